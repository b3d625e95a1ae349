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

use crate::{SampleBlock, Samples, StreamFormat, FULL_SCALE};
use custom_error::custom_error;
use num::Complex;

custom_error! {pub DecodeError
    MalformedPayload { reason: String } = "Malformed payload: {reason}",
    SizeMismatch { expected: usize, actual: usize } = "Payload size mismatch. Expected {expected} bytes, found {actual}",
}

/// Sample encoding of a payload as it arrives from the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEncoding {
    /// Little endian interleaved i16, full scale 32767.
    Int16,
    /// Little endian interleaved f32, full scale 1.0.
    Float32,
}

impl WireEncoding {
    /// Bytes per I or Q component.
    pub fn width(&self) -> usize {
        match self {
            WireEncoding::Int16 => 2,
            WireEncoding::Float32 => 4,
        }
    }

    pub fn query_value(&self) -> &'static str {
        match self {
            WireEncoding::Int16 => "int16",
            WireEncoding::Float32 => "float32",
        }
    }
}

/// One undecoded frame body as handed over by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub encoding: WireEncoding,
    /// Complex sample count announced by the frame header.
    pub samples: usize,
    /// Instrument time of the first sample in seconds, when the header carries one.
    pub start_time: Option<f64>,
    pub data: Vec<u8>,
}

impl RawPayload {
    pub fn from_i16(samples: &[Complex<i16>]) -> RawPayload {
        let mut data = Vec::with_capacity(samples.len() * 4);
        for sample in samples {
            data.extend_from_slice(&sample.re.to_le_bytes());
            data.extend_from_slice(&sample.im.to_le_bytes());
        }

        RawPayload {
            encoding: WireEncoding::Int16,
            samples: samples.len(),
            start_time: None,
            data,
        }
    }

    pub fn from_f32(samples: &[Complex<f32>]) -> RawPayload {
        let mut data = Vec::with_capacity(samples.len() * 8);
        for sample in samples {
            data.extend_from_slice(&sample.re.to_le_bytes());
            data.extend_from_slice(&sample.im.to_le_bytes());
        }

        RawPayload {
            encoding: WireEncoding::Float32,
            samples: samples.len(),
            start_time: None,
            data,
        }
    }
}

fn i16_to_f32(value: i16) -> f32 {
    value as f32 / FULL_SCALE
}

// `as` saturates, NaN becomes 0
fn f32_to_i16(value: f32) -> i16 {
    (value * FULL_SCALE).round().clamp(-32768.0, FULL_SCALE) as i16
}

fn read_i16(chunk: &[u8]) -> (i16, i16) {
    (
        i16::from_le_bytes([chunk[0], chunk[1]]),
        i16::from_le_bytes([chunk[2], chunk[3]]),
    )
}

fn read_f32(chunk: &[u8]) -> (f32, f32) {
    (
        f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
    )
}

/// Convert a wire payload into a block in the requested representation.
///
/// Stateless. The returned block carries sequence 0 and no timestamp; the caller stamps both.
pub fn decode(payload: &RawPayload, target: StreamFormat) -> Result<SampleBlock, DecodeError> {
    if payload.samples == 0 || payload.data.is_empty() {
        return Err(DecodeError::MalformedPayload {
            reason: "empty payload".to_string(),
        });
    }

    let stride = payload.encoding.width() * 2;
    if payload.data.len() % stride != 0 {
        return Err(DecodeError::MalformedPayload {
            reason: format!(
                "{} bytes is not a whole number of {} byte samples",
                payload.data.len(),
                stride
            ),
        });
    }

    let expected = payload.samples * stride;
    if payload.data.len() != expected {
        return Err(DecodeError::SizeMismatch {
            expected,
            actual: payload.data.len(),
        });
    }

    let chunks = payload.data.chunks_exact(stride);
    let samples = match (payload.encoding, target) {
        (WireEncoding::Int16, StreamFormat::Int16Complex) => Samples::Int16(
            chunks
                .map(|chunk| {
                    let (re, im) = read_i16(chunk);
                    Complex::new(re, im)
                })
                .collect(),
        ),
        (WireEncoding::Int16, StreamFormat::Float32Complex) => Samples::Float32(
            chunks
                .map(|chunk| {
                    let (re, im) = read_i16(chunk);
                    Complex::new(i16_to_f32(re), i16_to_f32(im))
                })
                .collect(),
        ),
        (WireEncoding::Float32, StreamFormat::Int16Complex) => Samples::Int16(
            chunks
                .map(|chunk| {
                    let (re, im) = read_f32(chunk);
                    Complex::new(f32_to_i16(re), f32_to_i16(im))
                })
                .collect(),
        ),
        (WireEncoding::Float32, StreamFormat::Float32Complex) => Samples::Float32(
            chunks
                .map(|chunk| {
                    let (re, im) = read_f32(chunk);
                    Complex::new(re, im)
                })
                .collect(),
        ),
    };

    trace!(
        "Decoded {} {:?} samples to {}",
        samples.len(),
        payload.encoding,
        target
    );

    Ok(SampleBlock::new(samples))
}
