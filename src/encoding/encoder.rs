//! Encoder abstraction for surface-input video and PCM-input audio
//!
//! The recording core never talks to a codec API directly. It drives these
//! traits from its worker threads:
//! - [`VideoEncoder`] accepts frames through an [`InputSurface`] that the
//!   renderer owns, and emits compressed access units
//! - [`AudioEncoder`] accepts PCM pushed by the audio worker
//! - both expose the same polled output interface, [`EncoderOutput`], so a
//!   single drain state machine serves both tracks
//!
//! A [`MediaBackend`] builds the concrete encoders and the container writer.

use std::path::Path;
use std::time::Duration;

use crate::config::{AudioConfig, VideoConfig};
use crate::recording::muxer::{ContainerWriter, MuxError};

use super::{MediaFormat, PcmChunk, RawVideoFrame};

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("GStreamer error: {0}")]
    Gst(String),

    #[error("Encoder not available: {0}")]
    NotAvailable(String),

    #[error("Encoder configuration rejected: {0}")]
    Configure(String),

    #[error("Input surface error: {0}")]
    Surface(String),

    #[error("Capture device error: {0}")]
    Capture(String),

    #[error("Encoder is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Flags reported with an output buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub codec_config: bool,
    pub end_of_stream: bool,
    pub key_frame: bool,
}

/// A compressed buffer lent out by the encoder until [`EncoderOutput::release_output`]
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    /// Encoder-side slot index, handed back on release
    pub index: usize,
    /// Buffer contents. `None` on a ready status means the driver broke its contract.
    pub data: Option<Vec<u8>>,
    pub flags: BufferFlags,
    /// Encoder-native timestamp. The drain loop re-stamps samples with the shared clock.
    pub presentation_time_us: i64,
}

/// Result of one bounded poll of an encoder's output side
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Nothing available within the timeout
    TryAgainLater,
    /// The encoder swapped its output buffer set (legacy status, harmless)
    BuffersChanged,
    /// The one-time format descriptor is now known
    FormatChanged(MediaFormat),
    /// A compressed buffer is ready
    Buffer(OutputBuffer),
    /// A status code this crate does not understand
    Unexpected(i32),
}

/// Polled output side shared by video and audio encoders
pub trait EncoderOutput: Send {
    /// Wait up to `timeout` for the next output event
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent>;

    /// Return a buffer obtained from [`OutputEvent::Buffer`] to the encoder
    fn release_output(&mut self, index: usize);
}

/// Renderable surface feeding a video encoder.
///
/// The renderer writes frames to it from its own thread at its own cadence;
/// the recording core only hands the surface over.
pub trait InputSurface: Send {
    fn submit_frame(&mut self, frame: &RawVideoFrame) -> Result<()>;
}

/// Hardware video encoder with surface input
pub trait VideoEncoder: EncoderOutput {
    /// Create the surface the renderer draws into. Called once, at construction.
    fn create_input_surface(&mut self) -> Result<Box<dyn InputSurface>>;

    fn start(&mut self) -> Result<()>;

    /// Tell the encoder no more frames will arrive on the surface
    fn signal_end_of_input_stream(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Free native resources. Called exactly once, after `stop`.
    fn release(&mut self);
}

/// Audio encoder fed with PCM by the audio worker
pub trait AudioEncoder: EncoderOutput {
    fn start(&mut self) -> Result<()>;

    /// Queue interleaved PCM. An empty slice with `end_of_stream` closes the input.
    fn queue_input(&mut self, pcm: &[i16], pts_us: u64, end_of_stream: bool) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn release(&mut self);
}

/// PCM capture device
pub trait PcmSource: Send {
    fn start(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next chunk of captured samples
    fn read(&mut self, timeout: Duration) -> Result<Option<PcmChunk>>;

    fn stop(&mut self) -> Result<()>;
}

/// Factory for the native collaborators of a recording session
pub trait MediaBackend: Send + Sync {
    /// Open the output container. Failure here is fatal for `prepare`.
    fn open_container(&self, path: &Path) -> std::result::Result<Box<dyn ContainerWriter>, MuxError>;

    fn create_video_encoder(&self, config: &VideoConfig) -> Result<Box<dyn VideoEncoder>>;

    /// Create the capture source and encoder for the audio track
    fn create_audio(&self, config: &AudioConfig) -> Result<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)>;
}
