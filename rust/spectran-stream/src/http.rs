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
use custom_error::custom_error;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use spectran_decoders::decoders::iq::{RawPayload, WireEncoding};
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Terminates the JSON header of every frame on the stream.
const RECORD_SEPARATOR: u8 = 0x1e;
const MAX_HEADER_LEN: usize = 64 * 1024;
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(2);

custom_error! {pub FrameError
    Timeout = "Timed out reading from the stream",
    Closed = "Stream closed by the remote end",
    Malformed { reason: String } = "Malformed frame: {reason}",
    Io { source: io::Error } = "Error reading the stream: {source}",
}

#[derive(Debug, Deserialize)]
struct FrameHeader {
    samples: usize,
    #[serde(rename = "startTime", default)]
    start_time: Option<f64>,
    #[serde(default)]
    payload: Option<String>,
}

struct PendingFrame {
    header: FrameHeader,
    body: Vec<u8>,
    filled: usize,
}

/// Splits the RTSA HTTP stream into frames.
///
/// Every frame is a JSON header terminated by `0x1e`, followed by `samples * 2` interleaved
/// values of the wire width. Reads are resumable: a read timeout anywhere inside a frame keeps
/// what was received so far and the next call continues from there.
pub struct FrameReader<R: Read> {
    inner: BufReader<R>,
    encoding: WireEncoding,
    header: Vec<u8>,
    pending: Option<PendingFrame>,
}

fn is_timeout(error: &io::Error) -> bool {
    if matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) {
        return true;
    }

    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .map_or(false, |inner| inner.is_timeout())
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, encoding: WireEncoding) -> FrameReader<R> {
        FrameReader {
            inner: BufReader::new(inner),
            encoding,
            header: Vec::new(),
            pending: None,
        }
    }

    pub fn next_frame(&mut self) -> Result<RawPayload, FrameError> {
        loop {
            if self.pending.is_none() {
                self.read_header()?;
            }

            if let Some(payload) = self.read_body()? {
                return Ok(payload);
            }
        }
    }

    fn read_header(&mut self) -> Result<(), FrameError> {
        loop {
            let limit = (MAX_HEADER_LEN - self.header.len()) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(RECORD_SEPARATOR, &mut self.header);

            match read {
                Ok(_) if self.header.last() == Some(&RECORD_SEPARATOR) => break,
                Ok(_) if self.header.len() >= MAX_HEADER_LEN => {
                    return Err(FrameError::Malformed {
                        reason: format!("no header terminator within {} bytes", MAX_HEADER_LEN),
                    });
                }
                Ok(_) => return Err(FrameError::Closed),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(FrameError::Timeout),
                Err(e) => return Err(FrameError::Io { source: e }),
            }
        }

        let raw = std::mem::take(&mut self.header);
        let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        let header: FrameHeader =
            serde_json::from_str(text.trim()).map_err(|e| FrameError::Malformed {
                reason: format!("bad frame header: {}", e),
            })?;

        let size = header
            .samples
            .checked_mul(self.encoding.width() * 2)
            .filter(|size| *size <= MAX_FRAME_BYTES)
            .ok_or_else(|| FrameError::Malformed {
                reason: format!("frame of {} samples is too large", header.samples),
            })?;

        self.pending = Some(PendingFrame {
            header,
            body: vec![0u8; size],
            filled: 0,
        });

        Ok(())
    }

    // Ok(None) when the completed frame is not IQ data and was skipped.
    fn read_body(&mut self) -> Result<Option<RawPayload>, FrameError> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };

        while pending.filled < pending.body.len() {
            match self.inner.read(&mut pending.body[pending.filled..]) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(n) => pending.filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(FrameError::Timeout),
                Err(e) => return Err(FrameError::Io { source: e }),
            }
        }

        let Some(frame) = self.pending.take() else {
            return Ok(None);
        };

        match frame.header.payload.as_deref() {
            None | Some("iq") => Ok(Some(RawPayload {
                encoding: self.encoding,
                samples: frame.header.samples,
                start_time: frame.header.start_time,
                data: frame.body,
            })),
            Some(other) => {
                debug!("Skipping {} byte '{}' frame", frame.body.len(), other);
                Ok(None)
            }
        }
    }
}

/// Parse `host:port` or `http://host:port[/]` into `host:port`.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, TransportError> {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    let host_port = without_scheme.trim_end_matches('/');

    let invalid = || TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
    };

    let (host, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains('/') || port.parse::<u16>().is_err() {
        return Err(invalid());
    }

    Ok(host_port.to_string())
}

/// Spectran V6 RTSA HTTP server connection.
///
/// Samples are read from one long lived `GET /stream` response. Configuration goes out as
/// separate `PUT /remoteconfig` requests on their own client, so the two never share framing.
pub struct HttpTransport {
    endpoint: String,
    base_url: String,
    encoding: WireEncoding,
    stream_client: Client,
    config_client: Client,
    state: Mutex<ConnectionState>,
    reader: Mutex<Option<FrameReader<Response>>>,
}

impl HttpTransport {
    /// `receive_timeout` bounds every blocking read of the sample stream.
    pub fn new(
        endpoint: &str,
        encoding: WireEncoding,
        receive_timeout: Duration,
    ) -> Result<HttpTransport, TransportError> {
        let endpoint = normalize_endpoint(endpoint)?;

        let build_error = |e: reqwest::Error| TransportError::ConnectFailed {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        };

        let stream_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(receive_timeout)
            .build()
            .map_err(build_error)?;

        let config_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(CONFIG_TIMEOUT)
            .build()
            .map_err(build_error)?;

        Ok(HttpTransport {
            base_url: format!("http://{}", endpoint),
            endpoint,
            encoding,
            stream_client,
            config_client,
            state: Mutex::new(ConnectionState::Disconnected),
            reader: Mutex::new(None),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            trace!("[{: <13}] Connection {} -> {}", self.endpoint, current, state);
            *current = state;
        }
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<FrameReader<Response>>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn put_config(&self, body: serde_json::Value) -> Result<(), TransportError> {
        self.config_client
            .put(format!("{}/remoteconfig", self.base_url))
            .json(&body)
            .send()
            .and_then(|response| response.error_for_status())
            .map(|_| ())
            .map_err(|e| TransportError::ConnectionLost {
                reason: e.to_string(),
            })
    }
}

impl Transport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connect(&self) -> Result<(), TransportError> {
        let mut reader = self.lock_reader();
        if reader.is_some() && self.state() == ConnectionState::Streaming {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let url = format!(
            "{}/stream?format={}",
            self.base_url,
            self.encoding.query_value()
        );
        debug!("[{: <13}] Requesting {}", self.endpoint, url);

        let response = self
            .stream_client
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status());

        match response {
            Ok(response) => {
                *reader = Some(FrameReader::new(response, self.encoding));
                self.set_state(ConnectionState::Streaming);
                info!("[{: <13}] Connected to sample stream", self.endpoint);
                Ok(())
            }
            Err(e) => {
                *reader = None;
                self.set_state(ConnectionState::Faulted);
                Err(TransportError::ConnectFailed {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn send_config(&self, config: &DemodulatorConfig) -> Result<(), TransportError> {
        debug!(
            "[{: <13}] Sending demodulator config: {}",
            self.endpoint, config
        );

        self.put_config(json!({
            "receiverName": config.source_block_id,
            "simpleconfig": {
                "main": {
                    "centerfreq": config.source_center_frequency_hz(),
                }
            }
        }))?;

        self.put_config(json!({
            "receiverName": config.demodulator_block_id,
            "simpleconfig": {
                "main": {
                    "centerfreq": config.center_frequency_hz,
                    "samplerate": config.sample_rate_hz,
                    "spanfreq": config.sample_rate_hz,
                }
            }
        }))
    }

    // The read deadline is fixed on the stream client at construction; `timeout` cannot extend it.
    fn receive_next(&self, _timeout: Duration) -> Result<RawPayload, TransportError> {
        let mut reader = self.lock_reader();
        let Some(frames) = reader.as_mut() else {
            self.set_state(ConnectionState::Faulted);
            return Err(TransportError::ConnectionLost {
                reason: "stream is not open".to_string(),
            });
        };

        match frames.next_frame() {
            Ok(payload) => Ok(payload),
            Err(FrameError::Timeout) => Err(TransportError::Timeout),
            Err(e) => {
                *reader = None;
                self.set_state(ConnectionState::Faulted);
                Err(TransportError::ConnectionLost {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn close(&self) {
        if self.lock_reader().take().is_some() {
            info!("[{: <13}] Closed sample stream", self.endpoint);
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
