// Configuration management for MediaRecorder

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encoding::{AudioCodec, VideoCodec};

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Directory where capture files are written
    pub output_dir: PathBuf,

    /// File name prefix for generated capture files
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Video encoder settings
    #[serde(default)]
    pub video: VideoConfig,

    /// Audio capture and encoder settings
    #[serde(default)]
    pub audio: AudioConfig,

    /// Drain loop timing
    #[serde(default)]
    pub drain: DrainConfig,
}

/// Video encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate handed to the encoder
    pub fps: u32,
    /// Seconds between I-frames
    pub keyframe_interval_secs: u32,
    /// Target bitrate in bits per second (0 = automatic)
    #[serde(default)]
    pub bitrate: u32,
    #[serde(default)]
    pub codec: VideoCodec,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            keyframe_interval_secs: 5,
            bitrate: 0, // Automatic
            codec: VideoCodec::H264,
        }
    }
}

impl VideoConfig {
    /// Bitrate to configure the encoder with.
    ///
    /// When no explicit bitrate is set, budget 0.1 bits per pixel per frame,
    /// clamped to a range hardware encoders accept.
    pub fn effective_bitrate(&self) -> u32 {
        if self.bitrate > 0 {
            return self.bitrate;
        }
        let bits = self.width as u64 * self.height as u64 * self.fps.max(1) as u64 / 10;
        bits.clamp(500_000, 20_000_000) as u32
    }

    /// Keyframe interval expressed in frames
    pub fn keyframe_interval_frames(&self) -> u32 {
        (self.keyframe_interval_secs * self.fps).max(1)
    }
}

/// Audio capture and encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Record an audio track alongside the video
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u16,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    #[serde(default)]
    pub codec: AudioCodec,
    /// Upper bound on a single PCM read, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 44_100,
            channels: 1,
            bitrate: 64_000,
            codec: AudioCodec::Aac,
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl AudioConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Drain loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrainConfig {
    /// Bounded wait of a single encoder poll, in milliseconds
    pub poll_timeout_ms: u64,
    /// Deadline for an end-of-stream drain, in milliseconds.
    /// `None` keeps polling until the encoder reports end of stream.
    pub eos_timeout_ms: Option<u64>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10,
            eos_timeout_ms: Some(3_000),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: get_default_output_dir(),
            file_prefix: default_file_prefix(),
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            drain: DrainConfig::default(),
        }
    }
}

impl RecorderConfig {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    /// Output file for a capture started at `now`
    pub fn output_path_for(&self, now: DateTime<Local>) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}.mp4",
            self.file_prefix,
            now.format("%Y%m%d_%H%M%S")
        ))
    }
}

/// Get the default directory for capture files
fn get_default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("MediaRecorder")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediarecorder")
        .join("config.toml")
}

fn default_file_prefix() -> String {
    "capture".to_string()
}

fn default_read_timeout_ms() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RecorderConfig::default();
        config.video.width = 1920;
        config.video.height = 1080;
        config.audio.enabled = false;
        config.drain.eos_timeout_ms = None;
        config.save(&path).unwrap();

        let loaded = RecorderConfig::load_or_default(&path);
        assert_eq!(loaded.video, config.video);
        assert_eq!(loaded.audio, config.audio);
        assert_eq!(loaded.drain.eos_timeout_ms, None);
    }

    #[test]
    fn missing_or_corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert_eq!(RecorderConfig::load_or_default(&missing).video, VideoConfig::default());

        let corrupt = dir.path().join("corrupt.toml");
        std::fs::write(&corrupt, "video = [[[").unwrap();
        assert_eq!(RecorderConfig::load_or_default(&corrupt).drain, DrainConfig::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "output_dir = \"/tmp/captures\"\n").unwrap();

        let loaded = RecorderConfig::load_or_default(&path);
        assert_eq!(loaded.output_dir, PathBuf::from("/tmp/captures"));
        assert_eq!(loaded.file_prefix, "capture");
        assert_eq!(loaded.audio.read_timeout_ms, 20);
    }

    #[test]
    fn automatic_bitrate_scales_with_resolution() {
        let hd = VideoConfig::default();
        let full_hd = VideoConfig { width: 1920, height: 1080, ..VideoConfig::default() };
        assert!(full_hd.effective_bitrate() > hd.effective_bitrate());

        let fixed = VideoConfig { bitrate: 4_000_000, ..VideoConfig::default() };
        assert_eq!(fixed.effective_bitrate(), 4_000_000);

        let tiny = VideoConfig { width: 16, height: 16, ..VideoConfig::default() };
        assert_eq!(tiny.effective_bitrate(), 500_000);
    }

    #[test]
    fn keyframe_interval_in_frames() {
        let config = VideoConfig { fps: 30, keyframe_interval_secs: 5, ..VideoConfig::default() };
        assert_eq!(config.keyframe_interval_frames(), 150);
    }

    #[test]
    fn output_path_uses_timestamp() {
        let config = RecorderConfig {
            output_dir: PathBuf::from("/captures"),
            ..RecorderConfig::default()
        };
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            config.output_path_for(now),
            PathBuf::from("/captures/capture_20240309_140507.mp4")
        );
    }
}
