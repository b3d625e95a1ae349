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
use custom_error::custom_error;
use spectran_decoders::decoders::iq::RawPayload;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

custom_error! {pub TransportError
    Timeout = "Timed out waiting for a sample payload",
    ConnectionLost { reason: String } = "Connection lost: {reason}",
    ConnectFailed { endpoint: String, reason: String } = "Unable to connect to {endpoint}: {reason}",
    InvalidEndpoint { endpoint: String } = "Invalid endpoint '{endpoint}'. Expected host:port",
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Faulted,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Connection to the remote instrument.
///
/// The read side (`connect`, `receive_next`) is driven by the ingest worker alone. `send_config`
/// may be called from any thread and must not interfere with the framing of the read side.
pub trait Transport: Send + Sync {
    /// Endpoint used in log lines.
    fn endpoint(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Open the sample stream. Succeeds without side effects when already streaming.
    fn connect(&self) -> Result<(), TransportError>;

    fn send_config(&self, config: &DemodulatorConfig) -> Result<(), TransportError>;

    /// Block for at most `timeout` waiting for the next payload.
    ///
    /// A broken stream moves the state to `Faulted` and returns `ConnectionLost`.
    fn receive_next(&self, timeout: Duration) -> Result<RawPayload, TransportError>;

    fn close(&self);
}
