// Copyright (C) 2023 Fred Clausen

// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA

use crate::backoff::{Backoff, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP};
use crate::configurator::{ConfigError, DemodulatorConfig, DemodulatorConfigurator, DEFAULT_DEBOUNCE};
use crate::http::HttpTransport;
use crate::ingest::{IngestCounters, IngestWorker};
use crate::queue::{QueueCapacity, QueueStats, SampleQueue};
use crate::transport::{Transport, TransportError};
use custom_error::custom_error;
use spectran_decoders::decoders::iq::WireEncoding;
use spectran_decoders::{IqSample, StreamFormat};
use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

custom_error! {pub SessionError
    Transport { source: TransportError } = "Unable to start stream: {source}",
    Spawn { source: io::Error } = "Unable to spawn stream worker: {source}",
    Stopped = "Stream session has been stopped",
    FormatMismatch { requested: StreamFormat, actual: StreamFormat } = "Requested {requested} samples from a {actual} stream",
}

/// Lifecycle of a stream session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopped,
}

impl SessionState {
    /// State after a start request. Starting twice is a no-op, starting after stop is refused.
    pub fn on_start(self) -> Result<SessionState, SessionError> {
        match self {
            SessionState::Created | SessionState::Started => Ok(SessionState::Started),
            SessionState::Stopped => Err(SessionError::Stopped),
        }
    }

    pub fn on_stop(self) -> SessionState {
        SessionState::Stopped
    }

    /// Only a started session has a remote end worth reconfiguring.
    pub fn accepts_reconfiguration(self) -> bool {
        self == SessionState::Started
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Started => "started",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub format: StreamFormat,
    pub queue_capacity: QueueCapacity,
    /// Longest single blocking receive in the ingest worker; also bounds how long `stop` waits.
    pub receive_timeout: Duration,
    /// Longest a `get_samples` call waits for a full buffer.
    pub read_timeout: Duration,
    pub debounce: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            format: StreamFormat::Int16Complex,
            queue_capacity: QueueCapacity::default(),
            receive_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(100),
            debounce: DEFAULT_DEBOUNCE,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub queue: QueueStats,
    pub blocks: u64,
    pub decode_errors: u64,
    pub transport_errors: u64,
    pub receive_timeouts: u64,
    pub reconnects: u64,
    pub config_sends: u64,
}

struct Running {
    ingest: JoinHandle<()>,
    configurator: DemodulatorConfigurator,
}

/// One active receive stream.
///
/// Owns the transport, the sample queue, the ingest worker and the demodulator configurator.
/// Nothing outlives the session: `stop` (or drop) joins both workers and closes the transport.
pub struct StreamSession {
    tag: String,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    queue: Arc<SampleQueue>,
    counters: Arc<IngestCounters>,
    stop: Arc<AtomicBool>,
    // serialises start and stop; `state` itself is only held for a transition
    lifecycle: Mutex<()>,
    state: Mutex<SessionState>,
    demodulator: Mutex<DemodulatorConfig>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        demodulator: DemodulatorConfig,
    ) -> StreamSession {
        let mut queue_capacity = config.queue_capacity;
        if let QueueCapacity::Duration { seconds, .. } = queue_capacity {
            queue_capacity = QueueCapacity::Duration {
                seconds,
                sample_rate_hz: demodulator.sample_rate_hz,
            };
        }

        StreamSession {
            tag: transport.endpoint().to_string(),
            queue: Arc::new(SampleQueue::new(queue_capacity)),
            config,
            transport,
            counters: Arc::new(IngestCounters::default()),
            stop: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(()),
            state: Mutex::new(SessionState::Created),
            demodulator: Mutex::new(demodulator),
            running: Mutex::new(None),
        }
    }

    /// Session against the instrument's HTTP server. Only the endpoint syntax is checked here;
    /// reachability is checked by `start`.
    pub fn open(
        endpoint: &str,
        config: SessionConfig,
        demodulator: DemodulatorConfig,
    ) -> Result<StreamSession, SessionError> {
        info!("[{: <13}] Opening {} stream", endpoint, config.format);
        let transport = HttpTransport::new(endpoint, WireEncoding::Int16, config.receive_timeout)?;
        Ok(StreamSession::new(Arc::new(transport), config, demodulator))
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn format(&self) -> StreamFormat {
        self.config.format
    }

    pub fn demodulator(&self) -> DemodulatorConfig {
        lock(&self.demodulator).clone()
    }

    /// Connect and spawn the workers. Idempotent once started.
    ///
    /// An unreachable instrument is reported here and leaves the session in `Created`, so the
    /// caller may try again.
    pub fn start(&self) -> Result<(), SessionError> {
        let _lifecycle = lock(&self.lifecycle);
        match self.state() {
            SessionState::Started => {
                debug!("[{: <13}] Stream already started", self.tag);
                return Ok(());
            }
            SessionState::Stopped => return Err(SessionError::Stopped),
            SessionState::Created => {}
        }

        info!("[{: <13}] Starting stream", self.tag);
        self.transport.connect()?;

        let configurator =
            match DemodulatorConfigurator::spawn(self.transport.clone(), self.config.debounce) {
                Ok(configurator) => configurator,
                Err(e) => {
                    self.transport.close();
                    return Err(SessionError::Spawn { source: e });
                }
            };

        let worker = IngestWorker::new(
            self.transport.clone(),
            self.queue.clone(),
            self.config.format,
            self.config.receive_timeout,
            Backoff::new(self.config.backoff_base, self.config.backoff_cap),
            self.stop.clone(),
            self.counters.clone(),
        );

        let ingest = match thread::Builder::new()
            .name("spectran-ingest".to_string())
            .spawn(move || worker.run())
        {
            Ok(ingest) => ingest,
            Err(e) => {
                drop(configurator);
                self.transport.close();
                return Err(SessionError::Spawn { source: e });
            }
        };

        *lock(&self.running) = Some(Running {
            ingest,
            configurator,
        });
        let mut state = lock(&self.state);
        *state = state.on_start()?;
        Ok(())
    }

    /// Copy up to `count` samples into `dest`. Returns how many were written.
    ///
    /// Waits at most the configured read timeout. A short count is an underrun, not an error.
    pub fn get_samples<S: IqSample>(&self, count: usize, dest: &mut [S]) -> Result<usize, SessionError> {
        self.get_samples_within(count, dest, self.config.read_timeout)
    }

    /// `get_samples` with an explicit wait bound.
    pub fn get_samples_within<S: IqSample>(
        &self,
        count: usize,
        dest: &mut [S],
        timeout: Duration,
    ) -> Result<usize, SessionError> {
        if S::FORMAT != self.config.format {
            return Err(SessionError::FormatMismatch {
                requested: S::FORMAT,
                actual: self.config.format,
            });
        }

        if self.state() != SessionState::Started {
            return Ok(0);
        }

        let count = count.min(dest.len());
        let pulled = self
            .queue
            .pull_into(&mut dest[..count], timeout);

        if pulled.underrun {
            trace!(
                "[{: <13}] Underrun: {} of {} samples",
                self.tag,
                pulled.written,
                count
            );
        }

        Ok(pulled.written)
    }

    /// Update the tuning and push it to the instrument.
    ///
    /// The local value always changes. Nothing goes out before `start`. An error means a
    /// previous change never reached the instrument; streaming carries on regardless.
    pub fn update_demodulator(
        &self,
        center_frequency_hz: f64,
        frequency_offset_hz: f64,
        sample_rate_hz: f64,
        demodulator_block_id: &str,
        source_block_id: &str,
    ) -> Result<(), ConfigError> {
        self.apply_demodulator(DemodulatorConfig {
            demodulator_block_id: demodulator_block_id.to_string(),
            source_block_id: source_block_id.to_string(),
            center_frequency_hz,
            frequency_offset_hz,
            sample_rate_hz,
        })
    }

    pub fn apply_demodulator(&self, config: DemodulatorConfig) -> Result<(), ConfigError> {
        config.validate()?;

        {
            let mut current = lock(&self.demodulator);
            if current.sample_rate_hz != config.sample_rate_hz {
                self.queue.set_sample_rate(config.sample_rate_hz);
            }
            *current = config.clone();
        }

        if !self.state().accepts_reconfiguration() {
            trace!("[{: <13}] Not started, keeping {} locally", self.tag, config);
            return Ok(());
        }

        match lock(&self.running).as_ref() {
            Some(running) => running.configurator.submit(config),
            None => Ok(()),
        }
    }

    /// Stop both workers, close the transport and drop buffered samples. Idempotent.
    ///
    /// The session reads as `Stopped` as soon as this begins, so concurrent `get_samples` calls
    /// return straight away instead of waiting for the workers to wind down.
    pub fn stop(&self) {
        let _lifecycle = lock(&self.lifecycle);
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Stopped {
                return;
            }
            *state = state.on_stop();
        }

        self.stop.store(true, Ordering::Release);
        self.queue.close();

        let running = lock(&self.running).take();
        if let Some(mut running) = running {
            running.configurator.begin_shutdown();
            running.ingest.thread().unpark();
            if running.ingest.join().is_err() {
                error!("[{: <13}] Ingest worker panicked", self.tag);
            }
            running.configurator.shutdown();
        }

        self.transport.close();
        let dropped = self.queue.drain();
        info!(
            "[{: <13}] Stream stopped, {} buffered samples dropped",
            self.tag, dropped
        );
    }

    pub fn stats(&self) -> SessionStats {
        let config_sends = lock(&self.running)
            .as_ref()
            .map_or(0, |running| running.configurator.sends());

        SessionStats {
            queue: self.queue.stats(),
            blocks: self.counters.blocks.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            transport_errors: self.counters.transport_errors.load(Ordering::Relaxed),
            receive_timeouts: self.counters.receive_timeouts.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            config_sends,
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::ConnectionState;
    use num::Complex;
    use std::time::Instant;

    fn session(transport: Arc<MockTransport>, config: SessionConfig) -> StreamSession {
        StreamSession::new(transport, config, DemodulatorConfig::default())
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            queue_capacity: QueueCapacity::Blocks(1000),
            receive_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(SessionState::Created.on_start().ok(), Some(SessionState::Started));
        assert_eq!(SessionState::Started.on_start().ok(), Some(SessionState::Started));
        assert!(matches!(SessionState::Stopped.on_start(), Err(SessionError::Stopped)));
        assert_eq!(SessionState::Created.on_stop(), SessionState::Stopped);
        assert_eq!(SessionState::Started.on_stop(), SessionState::Stopped);
        assert!(SessionState::Started.accepts_reconfiguration());
        assert!(!SessionState::Created.accepts_reconfiguration());
        assert!(!SessionState::Stopped.accepts_reconfiguration());
    }

    #[test]
    fn test_responsive_stream_fills_request() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(10), 128));
        let session = session(transport.clone(), quick_config());

        session.start()?;
        session.start()?;
        assert_eq!(transport.connect_attempts().len(), 1);
        assert_eq!(session.state(), SessionState::Started);

        thread::sleep(Duration::from_millis(100));
        let mut buf = vec![Complex::<i16>::default(); 1000];
        let written = session.get_samples(1000, &mut buf)?;
        assert!(written >= 900, "only {} samples", written);
        assert!(buf[..written].iter().enumerate().all(|(i, s)| s.re == i as i16));

        let stats = session.stats();
        assert_eq!(stats.queue.overruns, 0);
        assert_eq!(stats.decode_errors, 0);

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(session.start(), Err(SessionError::Stopped)));
        assert_eq!(session.get_samples(10, &mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn test_get_samples_is_bounded() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(10), 16));
        let session = session(transport, quick_config());
        session.start()?;

        let mut buf = vec![Complex::<i16>::default(); 64];
        for count in [0, 1, 10, 64, 500] {
            let started = Instant::now();
            let written = session.get_samples(count, &mut buf)?;
            assert!(written <= count.min(buf.len()));
            assert!(started.elapsed() < Duration::from_millis(50) + Duration::from_millis(100));
        }

        let mut floats = vec![Complex::<f32>::default(); 4];
        assert!(matches!(
            session.get_samples(4, &mut floats),
            Err(SessionError::FormatMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_outage_then_recovery() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(
            MockTransport::new(Duration::from_millis(10), 100).lose_connection_after(5, 2),
        );
        let session = session(transport.clone(), quick_config());
        session.start()?;

        // stream breaks after ~50 ms, reconnects follow 100, 200 and 400 ms apart
        thread::sleep(Duration::from_millis(200));
        let mut buf = vec![Complex::<i16>::default(); 10_000];
        let before = session.get_samples(10_000, &mut buf)?;
        assert!(before <= 500);
        assert_eq!(session.get_samples(1000, &mut buf)?, 0);
        assert_eq!(session.state(), SessionState::Started);

        thread::sleep(Duration::from_millis(900));
        assert_eq!(session.get_samples(100, &mut buf)?, 100);

        let lost_at = transport.lost_at();
        assert_eq!(lost_at.len(), 1);
        let attempts = transport.connect_attempts();
        assert_eq!(attempts.len(), 4);

        let delays = [
            attempts[1] - lost_at[0],
            attempts[2] - attempts[1],
            attempts[3] - attempts[2],
        ];
        for (delay, expected) in delays.iter().zip([100u64, 200, 400]) {
            assert!(*delay >= Duration::from_millis(expected - 5), "delay {:?}", delay);
            assert!(*delay < Duration::from_millis(expected + 150), "delay {:?}", delay);
        }

        let stats = session.stats();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.transport_errors, 1);
        Ok(())
    }

    #[test]
    fn test_stream_dropped_on_connect_is_backed_off() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(10), 16).flapping());
        let session = session(transport.clone(), quick_config());
        session.start()?;

        thread::sleep(Duration::from_millis(350));
        session.stop();

        // start, then reconnects after 100 and 200 ms
        let attempts = transport.connect_attempts().len();
        assert!((2..=4).contains(&attempts), "{} connects", attempts);
        assert_eq!(session.stats().queue.pushed_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_get_samples_not_held_up_by_stop() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(10), 16).silent());
        let config = SessionConfig {
            receive_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(10),
            ..quick_config()
        };
        let session = session(transport, config);
        session.start()?;
        thread::sleep(Duration::from_millis(20));

        let mut buf = vec![Complex::<i16>::default(); 100];
        let (elapsed, written) = thread::scope(|scope| {
            let stopper = scope.spawn(|| session.stop());
            thread::sleep(Duration::from_millis(20));

            let started = Instant::now();
            let written = session.get_samples(100, &mut buf);
            let elapsed = started.elapsed();
            let _ = stopper.join();
            (elapsed, written)
        });

        assert_eq!(written?, 0);
        assert!(elapsed < Duration::from_millis(100), "took {:?}", elapsed);
        assert_eq!(session.state(), SessionState::Stopped);
        Ok(())
    }

    #[test]
    fn test_get_samples_not_held_up_by_start() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(
            MockTransport::new(Duration::from_millis(10), 16).slow_connect(Duration::from_millis(300)),
        );
        let session = session(transport, quick_config());

        let mut buf = vec![Complex::<i16>::default(); 100];
        let (elapsed, written, started) = thread::scope(|scope| {
            let starter = scope.spawn(|| session.start());
            thread::sleep(Duration::from_millis(20));

            let begin = Instant::now();
            let written = session.get_samples(100, &mut buf);
            let elapsed = begin.elapsed();
            (elapsed, written, starter.join())
        });

        assert_eq!(written?, 0);
        assert!(elapsed < Duration::from_millis(100), "took {:?}", elapsed);
        assert!(matches!(started, Ok(Ok(()))));
        assert_eq!(session.state(), SessionState::Started);
        Ok(())
    }

    #[test]
    fn test_stop_interrupts_blocked_receive() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(10), 16).silent());
        let config = SessionConfig {
            receive_timeout: Duration::from_millis(200),
            ..quick_config()
        };
        let session = session(transport, config);
        session.start()?;
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_millis(100));
        assert!(lock(&session.running).is_none());
        Ok(())
    }

    #[test]
    fn test_update_before_start_stays_local() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(10), 16));
        let session = session(transport.clone(), quick_config());

        session.update_demodulator(433e6, -5e6, 4e6, "Block_IQDemodulator_1", "Block_Spectran_V6B_1")?;
        assert_eq!(session.demodulator().center_frequency_hz, 433e6);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(transport.send_attempts(), 0);

        assert!(session
            .update_demodulator(433e6, -5e6, -1.0, "Block_IQDemodulator_1", "Block_Spectran_V6B_1")
            .is_err());
        assert_eq!(session.demodulator().sample_rate_hz, 4e6);
        Ok(())
    }

    #[test]
    fn test_update_burst_sends_final_values_once() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(10), 16));
        let session = session(transport.clone(), quick_config());
        session.start()?;

        for step in 0..10 {
            session.update_demodulator(
                400e6 + step as f64 * 1e5,
                -5e6,
                2e6 + step as f64 * 1e3,
                "Block_IQDemodulator_1",
                "Block_Spectran_V6B_1",
            )?;
        }
        thread::sleep(Duration::from_millis(250));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].center_frequency_hz, 400e6 + 9.0 * 1e5);
        assert_eq!(sent[0].sample_rate_hz, 2e6 + 9.0 * 1e3);
        assert_eq!(session.stats().config_sends, 1);
        Ok(())
    }

    #[test]
    fn test_unreachable_instrument_fails_start() {
        let session = match StreamSession::open("127.0.0.1:9", quick_config(), DemodulatorConfig::default()) {
            Ok(session) => session,
            Err(e) => panic!("endpoint should parse: {}", e),
        };

        assert!(matches!(session.start(), Err(SessionError::Transport { .. })));
        assert_eq!(session.state(), SessionState::Created);

        assert!(matches!(
            StreamSession::open("no-port", quick_config(), DemodulatorConfig::default()),
            Err(SessionError::Transport { .. })
        ));
    }
}
