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

use crate::transport::Transport;
use custom_error::custom_error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const MIN_FREQUENCY_HZ: f64 = 1_000_000.0;
pub const MAX_FREQUENCY_HZ: f64 = 8_000_000_000.0;
pub const DEFAULT_DEMODULATOR_BLOCK: &str = "Block_IQDemodulator_1";
pub const DEFAULT_SOURCE_BLOCK: &str = "Block_Spectran_V6B_1";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

custom_error! {pub ConfigError
    SendFailed { reason: String } = "Demodulator configuration was not applied: {reason}",
    InvalidConfig { reason: String } = "Invalid demodulator configuration: {reason}",
}

/// Remote tuning of the instrument, always pushed as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct DemodulatorConfig {
    pub demodulator_block_id: String,
    pub source_block_id: String,
    pub center_frequency_hz: f64,
    pub frequency_offset_hz: f64,
    pub sample_rate_hz: f64,
}

impl Default for DemodulatorConfig {
    fn default() -> Self {
        DemodulatorConfig {
            demodulator_block_id: DEFAULT_DEMODULATOR_BLOCK.to_string(),
            source_block_id: DEFAULT_SOURCE_BLOCK.to_string(),
            center_frequency_hz: 100_000_000.0,
            frequency_offset_hz: -5_000_000.0,
            sample_rate_hz: 2_000_000.0,
        }
    }
}

impl DemodulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate_hz > 0.0) || !self.sample_rate_hz.is_finite() {
            return Err(ConfigError::InvalidConfig {
                reason: format!("sample rate {} must be positive", self.sample_rate_hz),
            });
        }

        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&self.center_frequency_hz) {
            return Err(ConfigError::InvalidConfig {
                reason: format!(
                    "center frequency {} is outside {} - {}",
                    self.center_frequency_hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ
                ),
            });
        }

        if !self.frequency_offset_hz.is_finite() {
            return Err(ConfigError::InvalidConfig {
                reason: "frequency offset must be finite".to_string(),
            });
        }

        if self.demodulator_block_id.is_empty() || self.source_block_id.is_empty() {
            return Err(ConfigError::InvalidConfig {
                reason: "block names must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Where the instrument itself is tuned. The demodulator sits `-offset` away from it.
    pub fn source_center_frequency_hz(&self) -> f64 {
        self.center_frequency_hz + self.frequency_offset_hz
    }
}

impl Display for DemodulatorConfig {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{} fc={} offset={} rate={}",
            self.source_block_id,
            self.demodulator_block_id,
            self.center_frequency_hz,
            self.frequency_offset_hz,
            self.sample_rate_hz
        )
    }
}

struct ConfiguratorState {
    pending: Option<DemodulatorConfig>,
    applied: Option<DemodulatorConfig>,
    last_change: Instant,
    last_error: Option<String>,
    shutdown: bool,
}

struct ConfiguratorShared {
    tag: String,
    transport: Arc<dyn Transport>,
    debounce: Duration,
    state: Mutex<ConfiguratorState>,
    wake: Condvar,
    // serialises sends so a newer config never lands before an older one
    send_lock: Mutex<()>,
    sends: AtomicU64,
}

impl ConfiguratorShared {
    fn lock(&self) -> MutexGuard<'_, ConfiguratorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_pending(&self) -> Result<(), ConfigError> {
        let _sending = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());

        let config = {
            let mut state = self.lock();
            match state.pending.take() {
                None => return Ok(()),
                Some(config) if state.applied.as_ref() == Some(&config) => {
                    trace!("[{: <13}] Demodulator already at {}", self.tag, config);
                    return Ok(());
                }
                Some(config) => config,
            }
        };

        let result = self.transport.send_config(&config).or_else(|e| {
            if self.lock().shutdown {
                return Err(e);
            }
            warn!(
                "[{: <13}] Demodulator config send failed ({}). Retrying once",
                self.tag, e
            );
            self.transport.send_config(&config)
        });

        let mut state = self.lock();
        match result {
            Ok(()) => {
                self.sends.fetch_add(1, Ordering::Relaxed);
                debug!("[{: <13}] Applied demodulator config {}", self.tag, config);
                state.applied = Some(config);
                state.last_error = None;
                Ok(())
            }
            Err(e) => {
                error!(
                    "[{: <13}] Unable to apply demodulator config {}: {}",
                    self.tag, config, e
                );
                state.applied = None;
                state.last_error = Some(e.to_string());
                Err(ConfigError::SendFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn run(&self) {
        trace!("[{: <13}] Demodulator configurator started", self.tag);
        let mut state = self.lock();

        loop {
            if state.shutdown {
                break;
            }

            if state.pending.is_none() {
                state = self.wake.wait(state).unwrap_or_else(|e| e.into_inner());
                continue;
            }

            let quiet_for = state.last_change.elapsed();
            if quiet_for < self.debounce {
                state = self
                    .wake
                    .wait_timeout(state, self.debounce - quiet_for)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
                continue;
            }

            drop(state);
            // failures are recorded and reported on the next submit
            let _ = self.send_pending();
            state = self.lock();
        }

        if let Some(config) = state.pending.take() {
            debug!("[{: <13}] Discarding unsent demodulator config {}", self.tag, config);
        }
        trace!("[{: <13}] Demodulator configurator exiting", self.tag);
    }
}

/// Pushes demodulator changes to the instrument once they stop changing for the debounce window.
///
/// A failed send is retried once straight away. After that the change is dropped until the
/// next submit, which reports the failure back to its caller.
pub struct DemodulatorConfigurator {
    shared: Arc<ConfiguratorShared>,
    worker: Option<JoinHandle<()>>,
}

impl DemodulatorConfigurator {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        debounce: Duration,
    ) -> Result<DemodulatorConfigurator, io::Error> {
        let shared = Arc::new(ConfiguratorShared {
            tag: transport.endpoint().to_string(),
            transport,
            debounce,
            state: Mutex::new(ConfiguratorState {
                pending: None,
                applied: None,
                last_change: Instant::now(),
                last_error: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
            send_lock: Mutex::new(()),
            sends: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("spectran-config".to_string())
            .spawn(move || worker_shared.run())?;

        Ok(DemodulatorConfigurator {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue `config` as the desired remote state.
    ///
    /// Returns `SendFailed` when the previous change could not be applied. The new change is
    /// queued either way.
    pub fn submit(&self, config: DemodulatorConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let mut state = self.shared.lock();
        let previous_failure = state.last_error.take();
        state.pending = Some(config);
        state.last_change = Instant::now();
        drop(state);
        self.shared.wake.notify_one();

        match previous_failure {
            Some(reason) => Err(ConfigError::SendFailed { reason }),
            None => Ok(()),
        }
    }

    /// Send any pending change now, on the calling thread.
    pub fn flush(&self) -> Result<(), ConfigError> {
        self.shared.send_pending()
    }

    /// Number of configurations the instrument accepted.
    pub fn sends(&self) -> u64 {
        self.shared.sends.load(Ordering::Relaxed)
    }

    /// Ask the worker to finish without waiting for it. A send already in flight is not retried.
    pub fn begin_shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
    }

    pub fn shutdown(&mut self) {
        self.begin_shutdown();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("[{: <13}] Demodulator configurator panicked", self.shared.tag);
            }
        }
    }
}

impl Drop for DemodulatorConfigurator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
