// Media types shared by the encoders, the drain loop, and the container writer
//
// To add a new codec:
// 1. Add variant to VideoCodec / AudioCodec
// 2. Add GStreamer caps name mapping in gst_caps_name()
// 3. Add the encoder element candidates in encoding/gst.rs

pub mod encoder;
#[cfg(feature = "gst")]
pub mod gst;

pub use encoder::{
    AudioEncoder, BufferFlags, EncoderError, EncoderOutput, InputSurface, MediaBackend,
    OutputBuffer, OutputEvent, PcmSource, VideoEncoder,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Supported video codecs for surface-input encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC - the codec every hardware encoder offers
    H264,
    /// H.265/HEVC - better compression than H.264
    H265,
}

impl VideoCodec {
    pub fn gst_caps_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/x-h264",
            VideoCodec::H265 => "video/x-h265",
        }
    }

    /// Get the GStreamer parser element name for this codec
    pub fn gst_parser(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264parse",
            VideoCodec::H265 => "h265parse",
        }
    }

    /// Human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
        }
    }
}

impl Default for VideoCodec {
    fn default() -> Self {
        Self::H264
    }
}

/// Supported audio codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// AAC-LC, the audio codec MP4 players expect
    Aac,
}

impl AudioCodec {
    pub fn display_name(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "AAC",
        }
    }
}

impl Default for AudioCodec {
    fn default() -> Self {
        Self::Aac
    }
}

/// Which logical media stream a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Track index assigned by the container writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Codec-specific parameters carried by a [`MediaFormat`]
#[derive(Debug, Clone, PartialEq)]
pub enum FormatParams {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
        fps: u32,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u16,
    },
}

/// Format descriptor emitted once by an encoder before its first access unit.
///
/// `codec_data` holds the out-of-band decoder configuration (avcC / AudioSpecificConfig)
/// the container needs before any sample of the track can be written.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub params: FormatParams,
    pub codec_data: Vec<u8>,
}

impl MediaFormat {
    pub fn video(codec: VideoCodec, width: u32, height: u32, fps: u32, codec_data: Vec<u8>) -> Self {
        Self {
            params: FormatParams::Video { codec, width, height, fps },
            codec_data,
        }
    }

    pub fn audio(codec: AudioCodec, sample_rate: u32, channels: u16, codec_data: Vec<u8>) -> Self {
        Self {
            params: FormatParams::Audio { codec, sample_rate, channels },
            codec_data,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self.params {
            FormatParams::Video { .. } => TrackKind::Video,
            FormatParams::Audio { .. } => TrackKind::Audio,
        }
    }
}

/// Flags attached to an encoded sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleFlags {
    /// Sample carries codec configuration only (already consumed via the format event)
    pub config: bool,
    /// Last sample of the track
    pub end_of_stream: bool,
    /// Sync sample
    pub key_frame: bool,
}

/// A compressed access unit ready for the container writer.
///
/// Produced by a drain cycle and consumed exactly once by
/// [`ContainerWriter::write_sample`](crate::recording::muxer::ContainerWriter::write_sample).
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub track_id: TrackId,
    /// Presentation time in microseconds, relative to the shared clock anchor
    pub timestamp_us: u64,
    pub flags: SampleFlags,
    pub payload: Vec<u8>,
}

/// Represents a raw video frame handed to an input surface
#[derive(Clone)]
pub struct RawVideoFrame {
    /// Raw pixel data (typically RGBA from the renderer, or NV12)
    pub data: Vec<u8>,
    /// Presentation timestamp in nanoseconds
    pub pts: u64,
    /// Duration in nanoseconds
    pub duration: u64,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Pixel format (GStreamer format string, e.g., "RGBA", "NV12")
    pub format: String,
    /// Wall clock time when the frame was rendered
    pub capture_time: Instant,
}

impl fmt::Debug for RawVideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawVideoFrame")
            .field("bytes", &self.data.len())
            .field("pts", &self.pts)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// Interleaved 16-bit PCM read from a capture source
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
    pub captured_at: Instant,
}

impl PcmChunk {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_kind_follows_params() {
        let video = MediaFormat::video(VideoCodec::H264, 1280, 720, 30, vec![1, 2, 3]);
        let audio = MediaFormat::audio(AudioCodec::Aac, 44_100, 1, vec![0x12, 0x08]);
        assert_eq!(video.kind(), TrackKind::Video);
        assert_eq!(audio.kind(), TrackKind::Audio);
    }

    #[test]
    fn codec_names() {
        assert_eq!(VideoCodec::H264.gst_caps_name(), "video/x-h264");
        assert_eq!(VideoCodec::H265.gst_parser(), "h265parse");
        assert_eq!(AudioCodec::Aac.display_name(), "AAC");
    }

    #[test]
    fn track_kind_serializes_lowercase() {
        let toml = toml::to_string(&std::collections::BTreeMap::from([("kind", TrackKind::Audio)]))
            .expect("serialize");
        assert!(toml.contains("\"audio\""));
    }
}
