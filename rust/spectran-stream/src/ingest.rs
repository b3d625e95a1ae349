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

use crate::backoff::Backoff;
use crate::queue::SampleQueue;
use crate::transport::{ConnectionState, Transport, TransportError};
use spectran_decoders::decoders::iq::decode;
use spectran_decoders::StreamFormat;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Counters kept by the ingest worker.
#[derive(Debug, Default)]
pub struct IngestCounters {
    pub blocks: AtomicU64,
    pub decode_errors: AtomicU64,
    pub transport_errors: AtomicU64,
    pub receive_timeouts: AtomicU64,
    pub reconnects: AtomicU64,
}

/// The single background reader of a stream session.
///
/// It owns the read side of the transport and is the only producer into the queue. Every
/// failure is logged, counted and retried; nothing here ends the loop except the stop flag.
pub struct IngestWorker {
    tag: String,
    transport: Arc<dyn Transport>,
    queue: Arc<SampleQueue>,
    format: StreamFormat,
    receive_timeout: Duration,
    backoff: Backoff,
    stop: Arc<AtomicBool>,
    counters: Arc<IngestCounters>,
    sequence: u64,
    // set once the stream broke, cleared on the next successful connect
    reconnecting: bool,
}

impl IngestWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<SampleQueue>,
        format: StreamFormat,
        receive_timeout: Duration,
        backoff: Backoff,
        stop: Arc<AtomicBool>,
        counters: Arc<IngestCounters>,
    ) -> IngestWorker {
        IngestWorker {
            tag: transport.endpoint().to_string(),
            transport,
            queue,
            format,
            receive_timeout,
            backoff,
            stop,
            counters,
            sequence: 0,
            reconnecting: false,
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn run(mut self) {
        info!("[{: <13}] Ingest worker started ({})", self.tag, self.format);

        while !self.stopping() {
            self.step();
        }

        info!(
            "[{: <13}] Ingest worker stopped after {} blocks",
            self.tag, self.sequence
        );
    }

    /// One loop iteration: reconnect if needed, then receive, decode and queue one payload.
    pub fn step(&mut self) {
        if !self.ensure_connected() {
            return;
        }

        let payload = match self.transport.receive_next(self.receive_timeout) {
            Ok(payload) => {
                // only a stream that delivers counts as recovered
                if self.backoff.attempts() > 0 {
                    self.backoff.reset();
                }
                payload
            }
            Err(TransportError::Timeout) => {
                self.counters.receive_timeouts.fetch_add(1, Ordering::Relaxed);
                trace!("[{: <13}] No payload within {:?}", self.tag, self.receive_timeout);
                return;
            }
            Err(e) => {
                self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[{: <13}] {}", self.tag, e);
                if self.transport.state() != ConnectionState::Streaming {
                    self.reconnecting = true;
                }
                return;
            }
        };

        match decode(&payload, self.format) {
            Ok(mut block) => {
                block.sequence = self.sequence;
                block.timestamp = Some(Instant::now());
                self.sequence += 1;
                self.counters.blocks.fetch_add(1, Ordering::Relaxed);

                let len = block.len();
                if self.queue.push(block) {
                    trace!(
                        "[{: <13}] Queue full, dropped the oldest block for block {}",
                        self.tag,
                        self.sequence - 1
                    );
                }
                trace!("[{: <13}] Queued {} samples", self.tag, len);
            }
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[{: <13}] Dropping payload: {}", self.tag, e);
            }
        }
    }

    /// Connect if the stream is down. Every attempt after a lost stream or a failed connect
    /// waits out the next backoff delay first.
    fn ensure_connected(&mut self) -> bool {
        if self.transport.state() == ConnectionState::Streaming {
            return true;
        }

        if self.reconnecting {
            let delay = self.backoff.next_delay();
            debug!("[{: <13}] Reconnecting in {:?}", self.tag, delay);
            self.pause(delay);
            if self.stopping() {
                return false;
            }
        }

        match self.transport.connect() {
            Ok(()) => {
                if self.reconnecting {
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "[{: <13}] Reconnected after {} attempts",
                        self.tag,
                        self.backoff.attempts()
                    );
                }
                self.reconnecting = false;
                true
            }
            Err(e) => {
                self.reconnecting = true;
                warn!("[{: <13}] {}", self.tag, e);
                false
            }
        }
    }

    // Sleeps for `delay` unless stopped first; `StreamSession::stop` unparks this thread.
    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}
