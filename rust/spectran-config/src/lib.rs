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

pub extern crate clap as clap;
extern crate custom_error;

use custom_error::custom_error;
use spectran_decoders::{FormatError, StreamFormat};
use spectran_device::{supported_sample_rate, Kwargs, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use std::num::ParseFloatError;
use std::num::ParseIntError;
use std::time::Duration;

use clap::Parser;

const MIN_REFERENCE_LEVEL: f64 = -60.0;
const MAX_REFERENCE_LEVEL: f64 = 0.0;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "Spectran Oxide",
    author,
    version,
    about,
    long_about = "Spectran Oxide streams IQ samples from an Aaronia Spectran V6 through its RTSA HTTP server."
)]
pub struct SpectranInput {
    /// General Program Options
    /// Set the log level. debug, trace, info are valid options. Info is default.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub logging: u8,
    /// host:port of the RTSA HTTP server.
    #[clap(long, env = "SPECTRAN_ENDPOINT", default_value = "127.0.0.1:54664")]
    pub endpoint: String,
    /// Distance in Hz between the instrument center frequency and the demodulator.
    #[clap(
        long,
        env = "SPECTRAN_FC_OFFSET",
        value_parser = parse_offset,
        default_value = "-5e6",
        allow_hyphen_values = true
    )]
    pub fc_offset: f64,
    #[clap(long, env = "SPECTRAN_DEMOD_BLOCK", default_value = "Block_IQDemodulator_1")]
    pub demod_block: String,
    #[clap(long, env = "SPECTRAN_SPECTRAN_BLOCK", default_value = "Block_Spectran_V6B_1")]
    pub spectran_block: String,
    /// Sample format written to the output. CS16 or CF32.
    #[clap(long, env = "SPECTRAN_FORMAT", value_parser = validate_format, default_value = "CS16")]
    pub format: StreamFormat,
    /// Demodulator center frequency in Hz.
    #[clap(long, env = "SPECTRAN_FREQUENCY", value_parser = validate_frequency, default_value = "100e6")]
    pub frequency: f64,
    #[clap(long, env = "SPECTRAN_SAMPLE_RATE", value_parser = validate_sample_rate, default_value = "2e6")]
    pub sample_rate: f64,
    /// Reference level in dBm, between -60 and 0.
    #[clap(
        long,
        env = "SPECTRAN_REFERENCE_LEVEL",
        value_parser = validate_reference_level,
        default_value = "0",
        allow_hyphen_values = true
    )]
    pub reference_level: f64,
    /// Seconds of samples held between the instrument and the reader.
    #[clap(long, env = "SPECTRAN_QUEUE_SECONDS", value_parser = validate_positive, default_value = "1")]
    pub queue_seconds: f64,
    #[clap(long, env = "SPECTRAN_RECEIVE_TIMEOUT_MS", value_parser = validate_timeout, default_value = "500")]
    pub receive_timeout_ms: u64,
    #[clap(long, env = "SPECTRAN_READ_TIMEOUT_MS", value_parser = validate_timeout, default_value = "100")]
    pub read_timeout_ms: u64,
    /// Stop after this many samples. 0 streams until interrupted.
    #[clap(long, env = "SPECTRAN_NUM_SAMPLES", default_value = "0")]
    pub num_samples: u64,
    /// File to write samples to. - is stdout.
    #[clap(short, long, env = "SPECTRAN_OUTPUT", default_value = "-")]
    pub output: String,
}

impl SpectranInput {
    /// Arguments for opening the device and setting up its stream.
    pub fn device_args(&self) -> Kwargs {
        let mut args = Kwargs::new();
        args.insert("endpoint".to_string(), self.endpoint.clone());
        args.insert("fcoffset".to_string(), self.fc_offset.to_string());
        args.insert("demodblock".to_string(), self.demod_block.clone());
        args.insert("spectranblock".to_string(), self.spectran_block.clone());
        args
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn writes_to_stdout(&self) -> bool {
        self.output == "-"
    }
}

custom_error! {pub SpectranInputError
    ParseFloat { source: ParseFloatError } = "Error parsing float",
    ParseInt { source: ParseIntError } = "Error parsing int",
    Format { source: FormatError } = "{source}",
    NotFinite { input: String } = "{input} is not a finite number",
    FrequencyRange { input: f64, min: f64, max: f64 } = "Frequency {input} out of range. Should be between {min} and {max}",
    SampleRate { input: f64 } = "Sample rate {input} is not supported by the instrument",
    ReferenceLevelRange { input: f64, min: f64, max: f64 } = "Reference level {input} out of range. Should be between {min} and {max}",
    NotPositive { input: String } = "{input} must be greater than zero",
}

fn parse_finite(input: &str) -> Result<f64, SpectranInputError> {
    let value = input.trim().parse::<f64>()?;
    if !value.is_finite() {
        return Err(SpectranInputError::NotFinite {
            input: input.to_string(),
        });
    }
    Ok(value)
}

fn parse_offset(input: &str) -> Result<f64, SpectranInputError> {
    parse_finite(input)
}

fn validate_format(input: &str) -> Result<StreamFormat, SpectranInputError> {
    Ok(input.parse::<StreamFormat>()?)
}

fn validate_frequency(input: &str) -> Result<f64, SpectranInputError> {
    let freq = parse_finite(input)?;
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&freq) {
        return Err(SpectranInputError::FrequencyRange {
            input: freq,
            min: MIN_FREQUENCY_HZ,
            max: MAX_FREQUENCY_HZ,
        });
    }
    Ok(freq)
}

fn validate_sample_rate(input: &str) -> Result<f64, SpectranInputError> {
    let rate = parse_finite(input)?;
    supported_sample_rate(rate).ok_or(SpectranInputError::SampleRate { input: rate })
}

fn validate_reference_level(input: &str) -> Result<f64, SpectranInputError> {
    let level = parse_finite(input)?;
    if !(MIN_REFERENCE_LEVEL..=MAX_REFERENCE_LEVEL).contains(&level) {
        return Err(SpectranInputError::ReferenceLevelRange {
            input: level,
            min: MIN_REFERENCE_LEVEL,
            max: MAX_REFERENCE_LEVEL,
        });
    }
    Ok(level)
}

fn validate_positive(input: &str) -> Result<f64, SpectranInputError> {
    let value = parse_finite(input)?;
    if value <= 0.0 {
        return Err(SpectranInputError::NotPositive {
            input: input.to_string(),
        });
    }
    Ok(value)
}

fn validate_timeout(input: &str) -> Result<u64, SpectranInputError> {
    let value = input.trim().parse::<u64>()?;
    if value == 0 {
        return Err(SpectranInputError::NotPositive {
            input: input.to_string(),
        });
    }
    Ok(value)
}
