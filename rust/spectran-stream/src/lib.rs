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

#[macro_use]
extern crate log;

pub mod backoff;
pub mod configurator;
pub mod http;
pub mod ingest;
pub mod queue;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

pub use configurator::{ConfigError, DemodulatorConfig, DemodulatorConfigurator};
pub use queue::{QueueCapacity, QueueStats, SampleQueue};
pub use session::{SessionConfig, SessionError, SessionState, SessionStats, StreamSession};
pub use spectran_decoders::{IqSample, StreamFormat};
pub use transport::{ConnectionState, Transport, TransportError};
