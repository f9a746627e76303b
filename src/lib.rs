// MediaRecorder - surface-input video capture with audio, muxed on a shared clock
// Main library entry point

pub mod config;
pub mod encoding;
pub mod recording;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use config::RecorderConfig;
pub use recording::{CaptureController, Lifecycle, LifecycleState, RecorderError, RecorderEvent};

/// Install the env_logger backend, defaulting to `info` when RUST_LOG is unset.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
