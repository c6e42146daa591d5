// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! rtlink soak run.
//!
//! Drives a worker thread the way an I/O loop would: control threads post
//! messages into a double-buffered queue, the worker drains it on every step
//! and answers each message through an SPSC ring read by the main thread.
//!
//! ```text
//! rtlink [--config <dir>] [--messages <count>]
//! ```

use rtlink::config::ConfigManager;
use rtlink::{CoreConfig, DoubleBufferQueue, QueueError, SpscRing, WorkerThread};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PRODUCERS: u64 = 2;
// 4-byte header + u64 sequence number
const REPLY_FRAME: usize = 12;
// 4-byte header + producer id + sequence number
const CONTROL_FRAME: usize = 20;

struct Args {
    config_dir: Option<String>,
    messages: u64,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config_dir: None,
        messages: 100_000,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                args.config_dir = Some(iter.next().ok_or("--config needs a directory")?);
            }
            "--messages" => {
                let value = iter.next().ok_or("--messages needs a count")?;
                args.messages = value
                    .parse()
                    .map_err(|e| format!("invalid message count '{}': {}", value, e))?;
            }
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }
    Ok(args)
}

fn load_config(dir: Option<&str>) -> CoreConfig {
    let manager = match dir {
        Some(dir) => ConfigManager::at(dir),
        None => ConfigManager::new(),
    };
    match manager.and_then(|m| m.load_config()) {
        Ok(config) => config,
        Err(e) => {
            warn!("Using default config: {}", e);
            CoreConfig::default()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtlink=debug")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = load_config(args.config_dir.as_deref());
    match run(&config, args.messages) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Soak run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &CoreConfig, per_producer: u64) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting soak: {} producers x {} messages, ring {} B, double buffer 2 x {} B",
        PRODUCERS, per_producer, config.queue.ring_bytes, config.queue.double_buffer_bytes
    );

    if config.queue.ring_bytes < 2 * REPLY_FRAME {
        return Err(format!("ring_bytes must be at least {}", 2 * REPLY_FRAME).into());
    }
    if config.queue.double_buffer_bytes < CONTROL_FRAME {
        return Err(format!("double_buffer_bytes must be at least {}", CONTROL_FRAME).into());
    }

    let (control_tx, mut control_rx) =
        DoubleBufferQueue::new(config.queue.double_buffer_bytes)?.split();
    let (mut reply_tx, mut reply_rx) = SpscRing::new(config.queue.ring_bytes)?.split();

    // Worker: drain control messages while there is room to reply with
    // each message's sequence number. Never waits on the reply ring, so a
    // pause request is honored even when nobody reads the replies.
    let mut worker = WorkerThread::with_config(&config.worker, move || {
        let mut handled = 0;
        while reply_tx.available() >= REPLY_FRAME {
            let Ok(seq) = control_rx.dequeue_with(|p| {
                p.get(8..16)
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_le_bytes)
                    .unwrap_or_default()
            }) else {
                break;
            };
            if let Err(e) = reply_tx.enqueue(&[&seq.to_le_bytes()]) {
                error!("Reply dropped: {}", e);
                return false;
            }
            handled += 1;
        }
        if handled == 0 {
            thread::sleep(Duration::from_micros(100));
        }
        true
    })?;
    worker.resume(true)?;

    let start = Instant::now();
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let tx = control_tx.clone();
            thread::spawn(move || {
                for seq in 0..per_producer {
                    let header = id.to_le_bytes();
                    let body = seq.to_le_bytes();
                    while tx.enqueue(&[&header, &body]).is_err() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    drop(control_tx);

    let total = PRODUCERS * per_producer;
    let mut received = 0u64;
    let mut paused_once = false;
    let mut buf = [0u8; 8];
    while received < total {
        match reply_rx.dequeue(&mut buf) {
            Ok(_) => received += 1,
            Err(QueueError::BufferEmpty) => thread::yield_now(),
            Err(e) => return Err(e.into()),
        }

        // Exercise a pause/resume cycle halfway through.
        if !paused_once && received >= total / 2 {
            worker.pause(true, true)?;
            info!("Worker paused at {} replies", received);
            worker.resume(true)?;
            paused_once = true;
        }
    }

    for producer in producers {
        if producer.join().is_err() {
            return Err("producer thread panicked".into());
        }
    }

    let elapsed = start.elapsed();
    let reason = worker.destroy()?;
    info!(
        "Soak complete: {} round trips in {:.2?} ({:.0} msg/s), worker exit: {:?}",
        received,
        elapsed,
        received as f64 / elapsed.as_secs_f64(),
        reason
    );
    Ok(())
}
