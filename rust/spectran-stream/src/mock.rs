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

use crate::configurator::DemodulatorConfig;
use crate::transport::{ConnectionState, Transport, TransportError};
use num::Complex;
use spectran_decoders::decoders::iq::RawPayload;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

struct Script {
    state: ConnectionState,
    connect_attempts: Vec<Instant>,
    produced: u64,
    // payloads left before the stream breaks
    lose_after: Option<u64>,
    failed_reconnects: usize,
    outage_failures_left: usize,
    failing_sends: usize,
    send_attempts: usize,
    lost_at: Vec<Instant>,
    sent: Vec<DemodulatorConfig>,
}

/// Scripted transport. Payloads carry a running sample counter in the real part so the
/// consumer can check ordering.
pub struct MockTransport {
    interval: Duration,
    block_len: usize,
    silent: bool,
    // every stream breaks on its first receive
    flapping: bool,
    connect_delay: Duration,
    send_delay: Duration,
    script: Mutex<Script>,
}

impl MockTransport {
    pub fn new(interval: Duration, block_len: usize) -> MockTransport {
        MockTransport {
            interval,
            block_len,
            silent: false,
            flapping: false,
            connect_delay: Duration::ZERO,
            send_delay: Duration::ZERO,
            script: Mutex::new(Script {
                state: ConnectionState::Disconnected,
                connect_attempts: Vec::new(),
                produced: 0,
                lose_after: None,
                failed_reconnects: 0,
                outage_failures_left: 0,
                failing_sends: 0,
                send_attempts: 0,
                lost_at: Vec::new(),
                sent: Vec::new(),
            }),
        }
    }

    /// Never deliver a payload; every receive runs into its timeout.
    pub fn silent(mut self) -> MockTransport {
        self.silent = true;
        self
    }

    /// Accept every connect, then lose the stream on the first receive.
    pub fn flapping(mut self) -> MockTransport {
        self.flapping = true;
        self
    }

    pub fn slow_connect(mut self, delay: Duration) -> MockTransport {
        self.connect_delay = delay;
        self
    }

    pub fn slow_sends(mut self, delay: Duration) -> MockTransport {
        self.send_delay = delay;
        self
    }

    /// Break the stream after `payloads` payloads and refuse the next `failed_reconnects` connects.
    pub fn lose_connection_after(self, payloads: u64, failed_reconnects: usize) -> MockTransport {
        {
            let mut script = self.lock();
            script.lose_after = Some(payloads);
            script.failed_reconnects = failed_reconnects;
        }
        self
    }

    pub fn failing_sends(self, count: usize) -> MockTransport {
        self.lock().failing_sends = count;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    pub fn sent(&self) -> Vec<DemodulatorConfig> {
        self.lock().sent.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.lock().send_attempts
    }

    /// When each stream broke.
    pub fn lost_at(&self) -> Vec<Instant> {
        self.lock().lost_at.clone()
    }
}

impl Transport for MockTransport {
    fn endpoint(&self) -> &str {
        "mock:54664"
    }

    fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn connect(&self) -> Result<(), TransportError> {
        thread::sleep(self.connect_delay);
        let mut script = self.lock();
        if script.state == ConnectionState::Streaming {
            return Ok(());
        }

        script.connect_attempts.push(Instant::now());
        if script.outage_failures_left > 0 {
            script.outage_failures_left -= 1;
            script.state = ConnectionState::Faulted;
            return Err(TransportError::ConnectFailed {
                endpoint: self.endpoint().to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        script.state = ConnectionState::Streaming;
        Ok(())
    }

    fn send_config(&self, config: &DemodulatorConfig) -> Result<(), TransportError> {
        thread::sleep(self.send_delay);
        let mut script = self.lock();
        script.send_attempts += 1;
        if script.failing_sends > 0 {
            script.failing_sends -= 1;
            return Err(TransportError::ConnectionLost {
                reason: "scripted send failure".to_string(),
            });
        }

        script.sent.push(config.clone());
        Ok(())
    }

    fn receive_next(&self, timeout: Duration) -> Result<RawPayload, TransportError> {
        {
            let mut script = self.lock();
            if script.state != ConnectionState::Streaming {
                return Err(TransportError::ConnectionLost {
                    reason: "not connected".to_string(),
                });
            }

            if self.flapping {
                script.lost_at.push(Instant::now());
                script.state = ConnectionState::Faulted;
                return Err(TransportError::ConnectionLost {
                    reason: "scripted hang up".to_string(),
                });
            }

            if script.lose_after == Some(0) {
                script.lose_after = None;
                script.outage_failures_left = script.failed_reconnects;
                script.lost_at.push(Instant::now());
                script.state = ConnectionState::Faulted;
                return Err(TransportError::ConnectionLost {
                    reason: "scripted outage".to_string(),
                });
            }
        }

        if self.silent || self.interval > timeout {
            thread::sleep(timeout);
            return Err(TransportError::Timeout);
        }
        thread::sleep(self.interval);

        let mut script = self.lock();
        if let Some(left) = script.lose_after.as_mut() {
            *left -= 1;
        }

        let first = script.produced;
        script.produced += self.block_len as u64;
        let samples: Vec<Complex<i16>> = (first..first + self.block_len as u64)
            .map(|n| Complex::new((n % 32768) as i16, 0))
            .collect();

        Ok(RawPayload::from_i16(&samples))
    }

    fn close(&self) {
        self.lock().state = ConnectionState::Disconnected;
    }
}
