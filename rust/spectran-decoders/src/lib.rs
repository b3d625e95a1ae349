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
use num::Complex;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Instant;

pub mod decoders {
    pub mod iq;
}

/// Full scale of the instrument's native 16 bit samples. `CF32` output is normalised against it.
pub const FULL_SCALE: f32 = 32767.0;

custom_error! {pub FormatError
    Unknown { format: String } = "Stream format '{format}' is not supported. Only CS16 and CF32 are supported",
}

/// Sample representation handed to the consumer. Fixed for the lifetime of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Int16Complex,
    Float32Complex,
}

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Int16Complex => "CS16",
            StreamFormat::Float32Complex => "CF32",
        }
    }

    /// Size of one complex sample in bytes.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            StreamFormat::Int16Complex => 2 * std::mem::size_of::<i16>(),
            StreamFormat::Float32Complex => 2 * std::mem::size_of::<f32>(),
        }
    }
}

impl Display for StreamFormat {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CS16" => Ok(StreamFormat::Int16Complex),
            "CF32" => Ok(StreamFormat::Float32Complex),
            _ => Err(FormatError::Unknown {
                format: s.to_string(),
            }),
        }
    }
}

/// Decoded samples in one of the two supported representations.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    Int16(Vec<Complex<i16>>),
    Float32(Vec<Complex<f32>>),
}

impl Samples {
    pub fn empty(format: StreamFormat) -> Samples {
        match format {
            StreamFormat::Int16Complex => Samples::Int16(Vec::new()),
            StreamFormat::Float32Complex => Samples::Float32(Vec::new()),
        }
    }

    pub fn format(&self) -> StreamFormat {
        match self {
            Samples::Int16(_) => StreamFormat::Int16Complex,
            Samples::Float32(_) => StreamFormat::Float32Complex,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Samples::Int16(samples) => samples.len(),
            Samples::Float32(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The output of one decode operation.
///
/// `sequence` is assigned by the ingest side and increases by one for every block pushed
/// towards the consumer. `timestamp` is the moment the payload arrived, when known.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    pub sequence: u64,
    pub timestamp: Option<Instant>,
    pub samples: Samples,
}

impl SampleBlock {
    pub fn new(samples: Samples) -> SampleBlock {
        SampleBlock {
            sequence: 0,
            timestamp: None,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn format(&self) -> StreamFormat {
        self.samples.format()
    }
}

/// A complex sample type a consumer can read a stream into.
pub trait IqSample: Copy + Default + Send + 'static {
    const FORMAT: StreamFormat;

    /// Borrow `samples` as a slice of `Self`, or `None` when the representation differs.
    fn view(samples: &Samples) -> Option<&[Self]>;
}

impl IqSample for Complex<i16> {
    const FORMAT: StreamFormat = StreamFormat::Int16Complex;

    fn view(samples: &Samples) -> Option<&[Self]> {
        match samples {
            Samples::Int16(samples) => Some(samples),
            Samples::Float32(_) => None,
        }
    }
}

impl IqSample for Complex<f32> {
    const FORMAT: StreamFormat = StreamFormat::Float32Complex;

    fn view(samples: &Samples) -> Option<&[Self]> {
        match samples {
            Samples::Float32(samples) => Some(samples),
            Samples::Int16(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_format_names() {
        assert_eq!("cs16".parse::<StreamFormat>().ok(), Some(StreamFormat::Int16Complex));
        assert_eq!("CF32".parse::<StreamFormat>().ok(), Some(StreamFormat::Float32Complex));
        assert!("CU8".parse::<StreamFormat>().is_err());
        assert_eq!(StreamFormat::Int16Complex.to_string(), "CS16");
        assert_eq!(StreamFormat::Int16Complex.bytes_per_sample(), 4);
        assert_eq!(StreamFormat::Float32Complex.bytes_per_sample(), 8);
    }

    #[test]
    fn test_view_matches_representation() {
        let samples = Samples::Int16(vec![Complex::new(1, -1); 3]);
        assert_eq!(<Complex<i16> as IqSample>::view(&samples).map(|s| s.len()), Some(3));
        assert!(<Complex<f32> as IqSample>::view(&samples).is_none());
        assert_eq!(samples.format(), StreamFormat::Int16Complex);
        assert!(Samples::empty(StreamFormat::Float32Complex).is_empty());
    }
}
