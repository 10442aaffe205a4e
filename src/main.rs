//! v4l2-camera binary: capture throughput check.
//!
//! Usage: `v4l2-camera [DEVICE] [WIDTH] [HEIGHT] [FOURCC] [BUFFERS] [FRAMES]`

use std::env;
use std::io;
use std::fmt::Display;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::info;
use v4l2_camera::{CaptureConfig, FourCC, Session};

const DEFAULT_FRAMES: u64 = 100;

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn arg<T>(args: &[String], position: usize, name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    args.get(position).map_or(Ok(default), |raw| {
        raw.parse()
            .map_err(|err| format!("invalid {name} '{raw}': {err}"))
    })
}

/// Current `CLOCK_MONOTONIC` time, the clock V4L2 stamps capture buffers with.
#[allow(unsafe_code)]
fn monotonic_now() -> io::Result<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid timespec exclusively borrowed for the call.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Duration::new(
        u64::try_from(ts.tv_sec).unwrap_or_default(),
        u32::try_from(ts.tv_nsec).unwrap_or_default(),
    ))
}

/// Time from the driver stamping a frame to `now`. Unstamped frames and
/// stamps from another clock yield `None`.
fn capture_latency(now: Duration, timestamp: Duration) -> Option<Duration> {
    if timestamp.is_zero() {
        return None;
    }
    now.checked_sub(timestamp)
}

#[allow(clippy::cast_precision_loss)]
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();
    let defaults = CaptureConfig::default();

    let config = CaptureConfig::default()
        .with_device(arg(&args, 0, "device", defaults.device_path.display().to_string())?)
        .with_resolution(
            arg(&args, 1, "width", defaults.width)?,
            arg(&args, 2, "height", defaults.height)?,
        )
        .with_pixel_format(arg::<FourCC>(&args, 3, "pixel format", defaults.pixel_format)?)
        .with_buffer_count(arg(&args, 4, "buffer count", defaults.buffer_count)?);
    let frames = arg(&args, 5, "frame count", DEFAULT_FRAMES)?;

    let mut session = Session::open(config)?;

    println!("Device: {}", session.config().device_path.display());
    println!("Card: {}", session.capabilities().card);
    println!("Driver: {}", session.capabilities().driver);
    println!("Format: {}", session.format());
    println!("Buffers: {}", session.config().buffer_count);

    let started = Instant::now();
    let mut total_bytes = 0u64;
    let mut total_latency = Duration::ZERO;
    let mut stamped = 0u32;
    for _ in 0..frames {
        let frame = session.capture()?;
        let meta = frame.metadata();
        if let Some(latency) = capture_latency(monotonic_now()?, meta.timestamp) {
            total_latency += latency;
            stamped += 1;
        }
        println!(
            "Frame {}: {} bytes, timestamp: {:?}{}",
            meta.sequence,
            meta.bytes_used,
            meta.timestamp,
            if meta.corrupted { " (corrupted)" } else { "" }
        );
        total_bytes += u64::from(meta.bytes_used);
    }
    let elapsed = started.elapsed();

    if frames > 0 {
        let secs = elapsed.as_secs_f64();
        println!("Captured {frames} frames in {secs:.2}s");
        println!("FPS: {:.2}", frames as f64 / secs);
        println!("Average frame size: {} bytes", total_bytes / frames);
        if let Some(average) = total_latency.checked_div(stamped) {
            println!("Average latency: {average:?}");
        }
    }

    let report = session.close();
    if report.is_clean() {
        info!("session closed");
    } else {
        eprintln!("Warning: incomplete teardown: {report:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_latency() {
        let now = Duration::from_millis(1_000);
        assert_eq!(
            capture_latency(now, Duration::from_millis(960)),
            Some(Duration::from_millis(40))
        );
        // Unstamped frame.
        assert_eq!(capture_latency(now, Duration::ZERO), None);
        // Stamp from a clock ahead of ours.
        assert_eq!(capture_latency(now, Duration::from_secs(5)), None);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let first = monotonic_now().expect("clock_gettime failed");
        let second = monotonic_now().expect("clock_gettime failed");
        assert!(second >= first);
    }

    #[test]
    fn test_positional_argument_defaults() {
        let args = vec!["/dev/video2".to_owned(), "640".to_owned()];
        assert_eq!(arg(&args, 1, "width", 1920u32), Ok(640));
        assert_eq!(arg(&args, 2, "height", 1080u32), Ok(1080));
        assert!(arg::<u32>(&args, 0, "width", 0).is_err());
    }
}
