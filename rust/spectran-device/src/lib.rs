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

use custom_error::custom_error;
use spectran_decoders::{StreamFormat, FULL_SCALE};
pub use spectran_stream::configurator::{
    DEFAULT_DEMODULATOR_BLOCK, DEFAULT_SOURCE_BLOCK, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ,
};
use spectran_stream::{
    ConfigError, DemodulatorConfig, IqSample, SessionConfig, SessionError, SessionStats,
    StreamSession,
};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

pub const DRIVER_KEY: &str = "SpectranV6";
pub const SERIAL: &str = "SPECTRAN-V6-00000000000";
pub const LABEL: &str = "SpectranV6 RTSA HTTP Stream";
pub const MANUFACTURER: &str = "HB9FXQ";
pub const ANTENNA: &str = "RX";
pub const REFERENCE_LEVEL: &str = "ReferenceLevel";
pub const RF: &str = "RF";

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:54664";
pub const DEFAULT_FC_OFFSET: &str = "-5e6";

pub const SAMPLE_RATES: [f64; 19] = [
    1e6, 2e6, 2.048e6, 3e6, 4e6, 5e6, 6e6, 7e6, 8e6, 9e6, 10e6, 11e6, 12e6, 13e6, 14e6, 92.16e6,
    122.88e6, 184.32e6, 245.76e6,
];

/// The listed rate within 1 Hz of `rate`, if there is one.
pub fn supported_sample_rate(rate: f64) -> Option<f64> {
    SAMPLE_RATES
        .iter()
        .copied()
        .find(|supported| (supported - rate).abs() < 1.0)
}

/// Device and stream arguments, as handed over by the host.
pub type Kwargs = HashMap<String, String>;

custom_error! {pub DeviceError
    UnsupportedFormat { format: String } = "Stream format {format} is not supported. Use CS16 or CF32",
    InvalidArgument { key: String, value: String } = "Invalid value {value} for argument {key}",
    NotSupported { what: String } = "{what} is not supported",
    NoStream = "No stream has been set up",
    Session { source: SessionError } = "{source}",
    Config { source: ConfigError } = "{source}",
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub minimum: f64,
    pub maximum: f64,
}

impl Range {
    pub fn new(minimum: f64, maximum: f64) -> Range {
        Range { minimum, maximum }
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.minimum, self.maximum)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Float,
}

/// Declaration of one stream argument with its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub key: &'static str,
    pub value: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub units: &'static str,
    pub kind: ArgKind,
}

pub fn stream_args_info() -> Vec<ArgInfo> {
    vec![
        ArgInfo {
            key: "endpoint",
            value: DEFAULT_ENDPOINT,
            name: "Spectran HTTP Endpoint",
            description: "Spectran HTTP Endpoint.",
            units: "uri",
            kind: ArgKind::String,
        },
        ArgInfo {
            key: "fcoffset",
            value: DEFAULT_FC_OFFSET,
            name: "fC Offset Hz",
            description: "fC Offset Hz",
            units: "Hz",
            kind: ArgKind::Float,
        },
        ArgInfo {
            key: "demodblock",
            value: DEFAULT_DEMODULATOR_BLOCK,
            name: "DEMODBLOCK",
            description: "DEMODBLOCK API NAME",
            units: "rtsastring",
            kind: ArgKind::String,
        },
        ArgInfo {
            key: "spectranblock",
            value: DEFAULT_SOURCE_BLOCK,
            name: "SPECTRANBLOCK",
            description: "SPECTRANBLOCK API NAME",
            units: "rtsastring",
            kind: ArgKind::String,
        },
    ]
}

/// Enumerate reachable devices. The instrument is not contacted, so there is always exactly one.
pub fn find(_args: &Kwargs) -> Vec<Kwargs> {
    debug!("[{: <13}] Enumerating devices", DRIVER_KEY);

    let mut info = Kwargs::new();
    info.insert("label".to_string(), LABEL.to_string());
    info.insert("serial".to_string(), SERIAL.to_string());
    info.insert("manufacturer".to_string(), MANUFACTURER.to_string());
    info.insert("product".to_string(), LABEL.to_string());
    vec![info]
}

fn parse_frequency(key: &str, value: &str) -> Result<f64, DeviceError> {
    match value.trim().parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(parsed),
        _ => Err(DeviceError::InvalidArgument {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// A Spectran V6 reached through its RTSA HTTP server, presented as a single channel receiver.
///
/// Tuning lives here and is pushed to the instrument as one `DemodulatorConfig` on every change.
/// At most one stream exists at a time.
pub struct SpectranDevice {
    endpoint: String,
    fc_offset: f64,
    demodulator_block: String,
    source_block: String,
    frequency: f64,
    sample_rate: f64,
    reference_level: f64,
    session_config: SessionConfig,
    session: Option<StreamSession>,
}

impl SpectranDevice {
    pub fn new(args: &Kwargs) -> Result<SpectranDevice, DeviceError> {
        let defaults = DemodulatorConfig::default();
        let endpoint = args
            .get("endpoint")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let fc_offset = match args.get("fcoffset") {
            Some(value) => parse_frequency("fcoffset", value)?,
            None => defaults.frequency_offset_hz,
        };

        info!(
            "[{: <13}] Opening {} with fc offset {}",
            endpoint, DRIVER_KEY, fc_offset
        );

        Ok(SpectranDevice {
            endpoint,
            fc_offset,
            demodulator_block: args
                .get("demodblock")
                .cloned()
                .unwrap_or(defaults.demodulator_block_id),
            source_block: args
                .get("spectranblock")
                .cloned()
                .unwrap_or(defaults.source_block_id),
            frequency: defaults.center_frequency_hz,
            sample_rate: defaults.sample_rate_hz,
            reference_level: 0.0,
            session_config: SessionConfig::default(),
            session: None,
        })
    }

    /// Queue sizing and timeouts for streams set up after this call. The format is chosen by
    /// `setup_stream`.
    pub fn with_session_config(mut self, session_config: SessionConfig) -> SpectranDevice {
        self.session_config = session_config;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn driver_key(&self) -> &'static str {
        DRIVER_KEY
    }

    pub fn hardware_key(&self) -> &'static str {
        DRIVER_KEY
    }

    pub fn hardware_info(&self) -> Kwargs {
        let mut info = Kwargs::new();
        info.insert("serial".to_string(), SERIAL.to_string());
        info
    }

    pub fn num_channels(&self, direction: Direction) -> usize {
        match direction {
            Direction::Rx => 1,
            Direction::Tx => 0,
        }
    }

    pub fn list_antennas(&self) -> Vec<&'static str> {
        vec![ANTENNA]
    }

    pub fn set_antenna(&mut self, name: &str) {
        debug!("[{: <13}] Ignoring antenna {}, only {} exists", self.endpoint, name, ANTENNA);
    }

    pub fn antenna(&self) -> &'static str {
        ANTENNA
    }

    pub fn has_dc_offset_mode(&self) -> bool {
        false
    }

    pub fn list_gains(&self) -> Vec<&'static str> {
        vec![REFERENCE_LEVEL]
    }

    pub fn has_gain_mode(&self) -> bool {
        true
    }

    pub fn set_gain_mode(&mut self, automatic: bool) {
        debug!(
            "[{: <13}] Setting AGC: {}",
            self.endpoint,
            if automatic { "Automatic" } else { "Manual" }
        );
    }

    pub fn gain_mode(&self) -> bool {
        true
    }

    /// Only the reference level is stored. It does not reach the instrument.
    pub fn set_gain(&mut self, name: &str, value: f64) {
        if name == REFERENCE_LEVEL {
            self.reference_level = value;
        }
    }

    pub fn gain(&self, name: &str) -> f64 {
        if name == REFERENCE_LEVEL {
            self.reference_level
        } else {
            0.0
        }
    }

    pub fn gain_range(&self, name: &str) -> Range {
        if name == REFERENCE_LEVEL {
            Range::new(-60.0, 0.0)
        } else {
            Range::new(0.0, 15.0)
        }
    }

    pub fn set_frequency(&mut self, name: &str, frequency: f64) -> Result<(), DeviceError> {
        if name != RF {
            return Ok(());
        }

        info!("[{: <13}] Setting frequency {} to {}", self.endpoint, name, frequency);
        let candidate = DemodulatorConfig {
            center_frequency_hz: frequency,
            ..self.demodulator_config()
        };
        candidate.validate()?;
        self.frequency = frequency;
        self.update_demodulator()
    }

    pub fn frequency(&self, name: &str) -> f64 {
        if name == RF {
            self.frequency
        } else {
            0.0
        }
    }

    pub fn list_frequencies(&self) -> Vec<&'static str> {
        vec![RF]
    }

    pub fn frequency_range(&self, name: &str) -> Vec<Range> {
        if name == RF {
            vec![Range::new(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ)]
        } else {
            Vec::new()
        }
    }

    pub fn set_sample_rate(&mut self, rate: f64) -> Result<(), DeviceError> {
        debug!("[{: <13}] Setting sample rate to {}", self.endpoint, rate);
        let rate = supported_sample_rate(rate).ok_or_else(|| DeviceError::InvalidArgument {
            key: "samplerate".to_string(),
            value: rate.to_string(),
        })?;
        let candidate = DemodulatorConfig {
            sample_rate_hz: rate,
            ..self.demodulator_config()
        };
        candidate.validate()?;
        self.sample_rate = rate;
        self.update_demodulator()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn list_sample_rates(&self) -> Vec<f64> {
        SAMPLE_RATES.to_vec()
    }

    pub fn list_bandwidths(&self) -> Vec<f64> {
        Vec::new()
    }

    pub fn stream_formats(&self) -> Vec<StreamFormat> {
        vec![StreamFormat::Int16Complex, StreamFormat::Float32Complex]
    }

    /// Native format and its full scale value.
    pub fn native_stream_format(&self) -> (StreamFormat, f64) {
        (StreamFormat::Int16Complex, FULL_SCALE as f64)
    }

    pub fn stream_args_info(&self) -> Vec<ArgInfo> {
        stream_args_info()
    }

    /// The tuning that is, or will be, pushed to the instrument.
    pub fn demodulator_config(&self) -> DemodulatorConfig {
        DemodulatorConfig {
            demodulator_block_id: self.demodulator_block.clone(),
            source_block_id: self.source_block.clone(),
            center_frequency_hz: self.frequency,
            frequency_offset_hz: self.fc_offset,
            sample_rate_hz: self.sample_rate,
        }
    }

    fn update_demodulator(&self) -> Result<(), DeviceError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };

        if let Err(e) = session.apply_demodulator(self.demodulator_config()) {
            warn!("[{: <13}] {}", self.endpoint, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Create the stream. Stream arguments override the device's endpoint, offset and block names.
    pub fn setup_stream(&mut self, format: &str, args: &Kwargs) -> Result<(), DeviceError> {
        let format: StreamFormat = format.parse().map_err(|_| DeviceError::UnsupportedFormat {
            format: format.to_string(),
        })?;

        if let Some(value) = args.get("fcoffset") {
            self.fc_offset = parse_frequency("fcoffset", value)?;
        }
        if let Some(endpoint) = args.get("endpoint") {
            self.endpoint = endpoint.clone();
        }
        if let Some(block) = args.get("demodblock") {
            self.demodulator_block = block.clone();
        }
        if let Some(block) = args.get("spectranblock") {
            self.source_block = block.clone();
        }

        if let Some(previous) = self.session.take() {
            warn!("[{: <13}] Replacing existing stream", self.endpoint);
            previous.stop();
        }

        info!(
            "[{: <13}] Setting up {} stream, {}",
            self.endpoint,
            format,
            self.demodulator_config()
        );
        let session_config = SessionConfig {
            format,
            ..self.session_config.clone()
        };
        self.session = Some(StreamSession::open(
            &self.endpoint,
            session_config,
            self.demodulator_config(),
        )?);
        Ok(())
    }

    /// Start streaming and push the current tuning. Only `flags == 0` is supported.
    pub fn activate_stream(&mut self, flags: i32) -> Result<(), DeviceError> {
        if flags != 0 {
            return Err(DeviceError::NotSupported {
                what: format!("Stream activation flags {:#x}", flags),
            });
        }

        let session = self.session.as_ref().ok_or(DeviceError::NoStream)?;
        session.start()?;
        self.update_demodulator()
    }

    /// Streaming carries on until the stream is closed.
    pub fn deactivate_stream(&mut self, _flags: i32) -> Result<(), DeviceError> {
        if self.session.is_none() {
            return Err(DeviceError::NoStream);
        }
        debug!("[{: <13}] Deactivate requested, stream keeps running", self.endpoint);
        Ok(())
    }

    /// Fill `buffer` with up to `buffer.len()` samples, waiting at most `timeout`.
    pub fn read_stream<S: IqSample>(
        &self,
        buffer: &mut [S],
        timeout: Duration,
    ) -> Result<usize, DeviceError> {
        let session = self.session.as_ref().ok_or(DeviceError::NoStream)?;
        Ok(session.get_samples_within(buffer.len(), buffer, timeout)?)
    }

    pub fn stream_stats(&self) -> Option<SessionStats> {
        self.session.as_ref().map(StreamSession::stats)
    }

    pub fn close_stream(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
        }
    }
}

impl Drop for SpectranDevice {
    fn drop(&mut self) {
        self.close_stream();
    }
}
