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
use sdre_rust_logging::SetupLogging;
use spectran_config::clap::Parser;
use spectran_config::SpectranInput;
use spectran_device::{DeviceError, SpectranDevice, REFERENCE_LEVEL, RF};
use spectran_stream::{IqSample, QueueCapacity, SessionConfig, StreamFormat};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const READ_BLOCK: usize = 16384;

custom_error! {OxideError
    Device { source: DeviceError } = "{source}",
    Io { source: io::Error } = "Unable to write samples: {source}",
    Join { source: tokio::task::JoinError } = "Sample writer stopped unexpectedly: {source}",
}

trait NativeBytes {
    fn write_native(&self, out: &mut dyn Write) -> io::Result<()>;
}

impl NativeBytes for Complex<i16> {
    fn write_native(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&self.re.to_ne_bytes())?;
        out.write_all(&self.im.to_ne_bytes())
    }
}

impl NativeBytes for Complex<f32> {
    fn write_native(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&self.re.to_ne_bytes())?;
        out.write_all(&self.im.to_ne_bytes())
    }
}

fn open_output(path: &str) -> io::Result<Box<dyn Write + Send>> {
    if path == "-" {
        Ok(Box::new(BufWriter::new(io::stdout())))
    } else {
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

/// Pull samples until `limit` is reached (0 for no limit) or `stop` is raised.
fn pump<S: IqSample + NativeBytes>(
    device: &SpectranDevice,
    out: &mut dyn Write,
    limit: u64,
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<u64, OxideError> {
    let mut buffer = vec![S::default(); READ_BLOCK];
    let mut written: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let wanted = match limit {
            0 => READ_BLOCK,
            _ => (limit - written).min(READ_BLOCK as u64) as usize,
        };
        if wanted == 0 {
            break;
        }

        let count = device.read_stream(&mut buffer[..wanted], timeout)?;
        for sample in &buffer[..count] {
            sample.write_native(out)?;
        }
        written += count as u64;
    }

    out.flush()?;
    Ok(written)
}

async fn run(args: SpectranInput) -> Result<(), OxideError> {
    let session_config = SessionConfig {
        queue_capacity: QueueCapacity::Duration {
            seconds: args.queue_seconds,
            sample_rate_hz: args.sample_rate,
        },
        receive_timeout: args.receive_timeout(),
        read_timeout: args.read_timeout(),
        ..SessionConfig::default()
    };

    let device_args = args.device_args();
    let mut device = SpectranDevice::new(&device_args)?.with_session_config(session_config);
    device.set_gain(REFERENCE_LEVEL, args.reference_level);
    device.set_frequency(RF, args.frequency)?;
    device.set_sample_rate(args.sample_rate)?;
    device.setup_stream(args.format.as_str(), &device_args)?;
    device.activate_stream(0)?;

    info!(
        "[{: <13}] Streaming {} samples to {}",
        device.endpoint(),
        args.format,
        if args.writes_to_stdout() { "stdout" } else { args.output.as_str() }
    );

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let format = args.format;
    let limit = args.num_samples;
    let timeout = args.read_timeout();
    let output = args.output.clone();

    let mut writer = tokio::task::spawn_blocking(move || {
        let result = open_output(&output).map_err(OxideError::from).and_then(|mut out| {
            match format {
                StreamFormat::Int16Complex => {
                    pump::<Complex<i16>>(&device, &mut out, limit, timeout, &worker_stop)
                }
                StreamFormat::Float32Complex => {
                    pump::<Complex<f32>>(&device, &mut out, limit, timeout, &worker_stop)
                }
            }
        });
        (device, result)
    });

    let (mut device, result) = tokio::select! {
        joined = &mut writer => joined?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping stream");
            stop.store(true, Ordering::Relaxed);
            writer.await?
        }
    };

    if let Some(stats) = device.stream_stats() {
        info!(
            "[{: <13}] {} blocks, {} overruns, {} underruns, {} reconnects, {} decode errors",
            device.endpoint(),
            stats.blocks,
            stats.queue.overruns,
            stats.queue.underruns,
            stats.reconnects,
            stats.decode_errors
        );
    }
    device.close_stream();

    let written = result?;
    info!("Wrote {} samples", written);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args: SpectranInput = SpectranInput::parse();
    args.logging.enable_logging();
    debug!(
        "Starting Spectran Oxide with the following options: {:#?}",
        args
    );

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
