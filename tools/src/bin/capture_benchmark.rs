//! MediaRecorder Capture Benchmark
//!
//! Drives a full prepare/start/frames/end-of-stream/release cycle through the
//! capture controller and reports how long each phase took and what reached
//! the container.
//!
//! Usage:
//!   cargo run --manifest-path tools/Cargo.toml --bin capture_benchmark [-- [OPTIONS]]
//!
//! Options:
//!   --frames <n>        Frames to submit per run (default: 300)
//!   --runs <n>          Number of recordings (default: 3)
//!   --no-audio          Record video only
//!   --native            Use the GStreamer backend (needs the `gst` feature)
//!   --help              Show this help message

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediarecorder_lib::encoding::{MediaBackend, RawVideoFrame, TrackKind};
use mediarecorder_lib::recording::FinalizeOutcome;
use mediarecorder_lib::test_harness::validators::validate_container;
use mediarecorder_lib::test_harness::{SyntheticBackend, SyntheticOptions};
use mediarecorder_lib::{CaptureController, Lifecycle, RecorderConfig, RecorderEvent};

const DEFAULT_FRAMES: u32 = 300;
const DEFAULT_RUNS: u32 = 3;

// ═══════════════════════════════════════════════════════════════════════════════
// Arguments
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_arg_value<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn print_usage() {
    println!("Usage: capture_benchmark [--frames <n>] [--runs <n>] [--no-audio] [--native]");
}

// ═══════════════════════════════════════════════════════════════════════════════
// One recording
// ═══════════════════════════════════════════════════════════════════════════════

struct RunResult {
    prepare: Duration,
    submit: Duration,
    finish: Duration,
    video_samples: u64,
    audio_samples: u64,
    outcome: FinalizeOutcome,
    errors: usize,
}

fn frame(config: &RecorderConfig, index: u32, data: &[u8]) -> RawVideoFrame {
    let duration = 1_000_000_000 / config.video.fps.max(1) as u64;
    RawVideoFrame {
        data: data.to_vec(),
        pts: index as u64 * duration,
        duration,
        width: config.video.width,
        height: config.video.height,
        format: "RGBA".into(),
        capture_time: Instant::now(),
    }
}

fn run_once(
    config: &RecorderConfig,
    backend: Arc<dyn MediaBackend>,
    output: &Path,
    frames: u32,
) -> Result<RunResult, String> {
    let mut recorder = CaptureController::new(config.clone(), backend).with_output_path(output);
    let events = recorder.events();

    let started = Instant::now();
    recorder.prepare().map_err(|e| format!("prepare: {}", e))?;
    recorder.start().map_err(|e| format!("start: {}", e))?;
    let prepare = started.elapsed();

    let pixels = vec![0x80u8; (config.video.width * config.video.height * 4) as usize];
    let frame_interval = Duration::from_secs(1) / config.video.fps.max(1);
    let submitting = Instant::now();
    for i in 0..frames {
        recorder
            .submit_frame(&frame(config, i, &pixels))
            .map_err(|e| format!("frame {}: {}", i, e))?;
        // Pace like a renderer so audio keeps up
        let due = frame_interval * (i + 1);
        if let Some(wait) = due.checked_sub(submitting.elapsed()) {
            std::thread::sleep(wait);
        }
    }
    let submit = submitting.elapsed();

    let finishing = Instant::now();
    let summary = recorder.finish().map_err(|e| format!("finish: {}", e))?;
    let finish = finishing.elapsed();

    let errors = events
        .try_iter()
        .inspect(|RecorderEvent::Error { pipeline, error, fatal }| {
            log::warn!("[Benchmark] {} error (fatal: {}): {}", pipeline, fatal, error);
        })
        .count();

    Ok(RunResult {
        prepare,
        submit,
        finish,
        video_samples: summary.stats.samples(TrackKind::Video),
        audio_samples: summary.stats.samples(TrackKind::Audio),
        outcome: summary.outcome,
        errors,
    })
}

#[cfg(feature = "gst")]
fn native_backend() -> Result<Arc<dyn MediaBackend>, String> {
    use mediarecorder_lib::encoding::gst::{CaptureDevice, GstBackend};
    let backend = GstBackend::new(CaptureDevice::default()).map_err(|e| e.to_string())?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "gst"))]
fn native_backend() -> Result<Arc<dyn MediaBackend>, String> {
    Err("built without the `gst` feature".into())
}

fn main() {
    mediarecorder_lib::init_logging();
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let frames = parse_arg_value::<u32>(&args, "--frames").unwrap_or(DEFAULT_FRAMES);
    let runs = parse_arg_value::<u32>(&args, "--runs").unwrap_or(DEFAULT_RUNS);
    let native = args.iter().any(|a| a == "--native");

    let mut config = RecorderConfig::default();
    config.audio.enabled = !args.iter().any(|a| a == "--no-audio");

    let output_dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to create output directory: {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "Recording {} run(s) of {} frames at {}x{}@{} ({} backend, audio {})",
        runs,
        frames,
        config.video.width,
        config.video.height,
        config.video.fps,
        if native { "GStreamer" } else { "synthetic" },
        if config.audio.enabled { "on" } else { "off" }
    );
    println!(
        "{:>4} {:>10} {:>10} {:>10} {:>8} {:>8} {:>7}  outcome",
        "run", "prepare", "submit", "finish", "video", "audio", "errors"
    );

    let mut failures = 0;
    for run in 1..=runs {
        let output = output_dir.path().join(format!("run-{}.mp4", run));
        let result = if native {
            native_backend().and_then(|backend| run_once(&config, backend, &output, frames))
        } else {
            // Synthetic runs check the written track layout as well
            let backend = Arc::new(SyntheticBackend::new(SyntheticOptions::default()));
            let gauges = backend.gauges();
            run_once(&config, backend, &output, frames).and_then(|result| {
                validate_container(&gauges.writer.lock())?;
                Ok(result)
            })
        };

        match result {
            Ok(r) => println!(
                "{:>4} {:>8}ms {:>8}ms {:>8}ms {:>8} {:>8} {:>7}  {:?}",
                run,
                r.prepare.as_millis(),
                r.submit.as_millis(),
                r.finish.as_millis(),
                r.video_samples,
                r.audio_samples,
                r.errors,
                r.outcome
            ),
            Err(e) => {
                failures += 1;
                println!("{:>4} FAILED: {}", run, e);
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
}
