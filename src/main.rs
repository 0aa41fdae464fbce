//! deskrec — multi-monitor desktop recorder.
//!
//! Usage:
//!   deskrec --list-devices
//!   deskrec --filename out.mp4 --monitor 0 [--audio-endpoint <id>] [flags...]
//!   Press Ctrl+C to stop recording.

use std::path::Path;

use clap::Parser;
use deskrec::audio::AudioMedia;
use deskrec::config::{device_enumeration, Configuration};
use deskrec::gpu::{enumerate_monitors, GpuContext};
use deskrec::recorder::{RecorderHandle, RecorderThread, RecordingOutcome};
use log::{error, info};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("--list-devices") {
        return list_devices();
    }

    let config = match Configuration::try_parse() {
        Ok(c) => c,
        Err(e) => e.exit(),
    };

    run_with_auto_restart(config);
}

fn list_devices() {
    let enumeration = match gather_devices() {
        Ok(e) => e,
        Err(e) => {
            error!("device enumeration failed: {e}");
            std::process::exit(1);
        }
    };
    match serde_json::to_string_pretty(&enumeration) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("failed to serialize device enumeration: {e}"),
    }
}

fn gather_devices() -> deskrec::Result<deskrec::config::DeviceEnumeration> {
    let gpu = GpuContext::new()?;
    let adapters = gpu.enumerate_adapters()?;
    let monitors = enumerate_monitors(&adapters)?;
    let microphones = AudioMedia::get_audio_recording_devices()?;
    Ok(device_enumeration(&monitors, &microphones))
}

/// Run `config`, auto-restarting with an incremented filename whenever the
/// recorder exits from an internal error rather than a user-requested stop
/// (§4.8's auto-restart policy). A Ctrl+C handler is installed once and
/// shared across restarts via `handle.clone()`.
fn run_with_auto_restart(mut config: Configuration) {
    let handle = RecorderHandle::new();
    let ctrlc_handle = handle.clone();
    if let Err(e) = ctrlc::set_handler(move || ctrlc_handle.request_stop()) {
        error!("failed to install Ctrl+C handler: {e}");
    }

    loop {
        info!("recording to {}", config.filename);
        match RecorderThread::run(config.clone(), handle.clone()) {
            RecordingOutcome::StoppedByUser => {
                info!("recording stopped");
                break;
            }
            RecordingOutcome::Fatal(e) => {
                error!("recording ended with a fatal error: {e}");
                if handle.stop_requested() {
                    break;
                }
                config.filename = next_filename(&config.filename);
            }
        }
    }
}

/// `foo.mp4` -> `foo (1).mp4` -> `foo (2).mp4`, matching the shell's
/// auto-restart naming convention so a crash-and-retry loop never
/// overwrites a partially written file.
fn next_filename(filename: &str) -> String {
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("recording");
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("mp4");
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());

    let (base, mut n) = match stem.rsplit_once(" (") {
        Some((base, rest)) if rest.ends_with(')') => match rest[..rest.len() - 1].parse::<u32>() {
            Ok(n) => (base, n),
            Err(_) => (stem, 0),
        },
        _ => (stem, 0),
    };
    n += 1;

    let name = format!("{base} ({n}).{extension}");
    match parent {
        Some(p) => p.join(name).to_string_lossy().into_owned(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_restart_appends_one() {
        assert_eq!(next_filename("out.mp4"), "out (1).mp4");
    }

    #[test]
    fn subsequent_restart_increments() {
        assert_eq!(next_filename("out (1).mp4"), "out (2).mp4");
        assert_eq!(next_filename("out (9).mp4"), "out (10).mp4");
    }

    #[test]
    fn preserves_parent_directory() {
        assert_eq!(next_filename("C:/recordings/out.mp4"), "C:/recordings/out (1).mp4");
    }
}
