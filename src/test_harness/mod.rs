//! In-process stand-ins for the native collaborators
//!
//! [`SyntheticBackend`] builds scripted encoders, a synthetic PCM source and an
//! in-memory container writer, and keeps handles to what they observed so tests
//! and the benchmark tool can inspect a finished recording.

pub mod fake_encoder;
pub mod memory_writer;
pub mod validators;

use std::path::Path;

use crate::config::{AudioConfig, VideoConfig};
use crate::encoding::encoder::Result;
use crate::encoding::{AudioEncoder, EncoderError, MediaBackend, PcmSource, VideoEncoder};
use crate::recording::muxer::{ContainerWriter, MuxError};

use fake_encoder::{
    AudioScript, FakeAudioEncoder, FakePcmSource, FakeVideoEncoder, SharedCounters, VideoScript,
};
use memory_writer::{MemoryContainerWriter, SharedWriterLog};

/// Knobs for a [`SyntheticBackend`]
#[derive(Debug, Clone, Default)]
pub struct SyntheticOptions {
    /// `open_container` fails, as with an unwritable output path
    pub fail_open: bool,
    /// `create_video_encoder` fails, as with no encoder on the system
    pub fail_video: bool,
    /// The container writer refuses to start
    pub fail_writer_start: bool,
    pub video: VideoScript,
    pub audio: AudioScript,
}

/// What the synthetic collaborators observed
#[derive(Clone, Default)]
pub struct Gauges {
    pub writer: SharedWriterLog,
    pub video: SharedCounters,
    pub audio: SharedCounters,
    pub source: SharedCounters,
}

/// Media backend made of fakes
pub struct SyntheticBackend {
    options: SyntheticOptions,
    gauges: Gauges,
}

impl SyntheticBackend {
    pub fn new(options: SyntheticOptions) -> Self {
        Self {
            options,
            gauges: Gauges::default(),
        }
    }

    pub fn gauges(&self) -> Gauges {
        self.gauges.clone()
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticOptions::default())
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_container(&self, path: &Path) -> std::result::Result<Box<dyn ContainerWriter>, MuxError> {
        if self.options.fail_open {
            return Err(MuxError::Open(format!("{} is not writable", path.display())));
        }
        let (writer, _log) = MemoryContainerWriter::with_log(self.gauges.writer.clone());
        if self.options.fail_writer_start {
            Ok(Box::new(writer.failing_start()))
        } else {
            Ok(Box::new(writer))
        }
    }

    fn create_video_encoder(&self, config: &VideoConfig) -> Result<Box<dyn VideoEncoder>> {
        if self.options.fail_video {
            return Err(EncoderError::NotAvailable("no synthetic video encoder".into()));
        }
        Ok(Box::new(FakeVideoEncoder::new(
            config,
            self.options.video.clone(),
            self.gauges.video.clone(),
        )))
    }

    fn create_audio(&self, config: &AudioConfig) -> Result<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)> {
        let source = FakePcmSource::new(config, self.options.audio.clone(), self.gauges.source.clone());
        let encoder = FakeAudioEncoder::new(config, self.options.audio.clone(), self.gauges.audio.clone());
        Ok((Box::new(source), Box::new(encoder)))
    }
}
