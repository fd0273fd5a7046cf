//! detection_sender - stream synthetic detections over UDP
//!
//! This tool:
//! 1. Opens a `DetectionChannel` (config file + env, then CLI overrides)
//! 2. Generates one fake "duck" detection per frame
//! 3. Sends each frame at a fixed rate until Ctrl-C or `--frames`
//! 4. Prints a sent/dropped summary
//!
//! Useful for exercising a receiver (e.g. the vehicle control process)
//! without a camera or model.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use detection_dispatch::config::{parse_send_buffer, split_host_port};
use detection_dispatch::{ChannelConfig, DetectionChannel, SyntheticDetector};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send synthetic detections over UDP")]
struct Args {
    /// Destination host:port (overrides config file and DETECTION_DEST_ADDR).
    #[arg(long)]
    dest: Option<String>,

    /// Frames per second.
    #[arg(long, default_value_t = 10.0)]
    hz: f64,

    /// Stop after this many frames (runs until Ctrl-C if omitted).
    #[arg(long)]
    frames: Option<u64>,

    /// Send buffer size in bytes, or 'system' for the OS default
    /// (overrides config file and DETECTION_SEND_BUFFER).
    #[arg(long, conflicts_with = "system_buffer")]
    send_buffer: Option<String>,

    /// Keep the OS default send buffer.
    #[arg(long)]
    system_buffer: bool,

    /// Log one warning per this many dropped frames
    /// (overrides config file and DETECTION_DROP_LOG_INTERVAL).
    #[arg(long)]
    drop_log_interval: Option<u64>,

    /// Seed for reproducible detections.
    #[arg(long)]
    seed: Option<u64>,

    /// Do not print every sent frame.
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !(args.hz.is_finite() && args.hz > 0.0) {
        return Err(anyhow!("--hz must be a positive number"));
    }

    let config = build_config(&args)?;
    let channel = DetectionChannel::new(&config).context("opening detection channel")?;
    let mut detector = match args.seed {
        Some(seed) => SyntheticDetector::seeded(seed),
        None => SyntheticDetector::new(),
    };

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("setting Ctrl-C handler")?;

    println!("Starting UDP detection sender");
    println!("Sending fake detections to {}", channel.destination());
    println!("Press Ctrl+C to stop\n");

    let period = Duration::from_secs_f64(1.0 / args.hz);
    let mut next_tick = Instant::now();
    let mut frame_id: u64 = 0;

    while running.load(Ordering::SeqCst) {
        if args.frames.is_some_and(|limit| frame_id >= limit) {
            break;
        }

        let objects = detector.next_frame();
        channel.send(&objects, frame_id)?;
        if !args.quiet {
            println!("Sent frame {}: {:?}", frame_id, objects);
        }
        frame_id += 1;

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    let stats = channel.stats();
    println!("\nSender stopped.");
    println!("  frames: {}", frame_id);
    println!("  sent: {}", stats.sent);
    println!("  dropped: {}", stats.dropped);
    Ok(())
}

fn build_config(args: &Args) -> Result<ChannelConfig> {
    let mut config = ChannelConfig::load()?;
    if let Some(dest) = &args.dest {
        let (host, port) = split_host_port(dest)?;
        config = config.with_destination(host, port);
    }
    if args.system_buffer {
        config = config.with_send_buffer_size(None);
    } else if let Some(size) = &args.send_buffer {
        config = config.with_send_buffer_size(parse_send_buffer(size)?);
    }
    if let Some(interval) = args.drop_log_interval {
        config = config.with_drop_log_interval(interval);
    }
    config.validate()?;
    Ok(config)
}
