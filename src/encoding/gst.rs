//! GStreamer-backed encoders and MP4 container writer
//!
//! Each encoder is a small pipeline ending in an appsink that the drain loop
//! polls with a bounded wait:
//! - video: appsrc -> videoconvert -> H.264/H.265 encoder -> parser -> appsink
//! - audio: appsrc -> audioconvert -> audioresample -> AAC encoder -> aacparse -> appsink
//!
//! The container writer feeds one appsrc per registered track into mp4mux.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_audio as gst_audio;
use gstreamer_video as gst_video;

use crate::config::{AudioConfig, VideoConfig};
use crate::recording::muxer::{self, ContainerWriter, MuxError};

use super::encoder::Result;
use super::{
    AudioCodec, AudioEncoder, BufferFlags, EncodedSample, EncoderError, EncoderOutput,
    FormatParams, InputSurface, MediaBackend, MediaFormat, OutputBuffer, OutputEvent, PcmChunk,
    PcmSource, RawVideoFrame, TrackId, VideoCodec, VideoEncoder,
};

/// Pixel format the renderer hands to the input surface
pub const SURFACE_FORMAT: &str = "RGBA";

// ============================================================================
// Initialization
// ============================================================================

static GST_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initialize GStreamer once per process
pub fn init() -> Result<()> {
    GST_INIT
        .get_or_init(|| match gst::init() {
            Ok(()) => {
                let (major, minor, micro, _) = gst::version();
                log::info!("GStreamer {}.{}.{} initialized", major, minor, micro);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                Err(e.to_string())
            }
        })
        .clone()
        .map_err(EncoderError::Gst)
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| EncoderError::Gst(format!("Failed to create {}: {}", factory, e)))
}

/// Set a property only when the element has it, parsing from a string so the
/// same call works across encoders with different property types
fn set_if_present(element: &gst::Element, name: &str, value: &str) {
    if element.find_property(name).is_some() {
        element.set_property_from_str(name, value);
    }
}

/// First pipeline error posted on `bus`, if any
fn pending_error(bus: &gst::Bus) -> Option<String> {
    bus.pop_filtered(&[gst::MessageType::Error])
        .and_then(|msg| match msg.view() {
            gst::MessageView::Error(err) => {
                Some(format!("{} ({:?})", err.error(), err.debug()))
            }
            _ => None,
        })
}

// ============================================================================
// Encoder detection
// ============================================================================

/// Encoder element candidates in order of preference, hardware first
fn video_encoder_candidates(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::H264 => &["nvh264enc", "vah264enc", "qsvh264enc", "x264enc"],
        VideoCodec::H265 => &["nvh265enc", "vah265enc", "qsvh265enc", "x265enc"],
    }
}

fn audio_encoder_candidates(codec: AudioCodec) -> &'static [&'static str] {
    match codec {
        AudioCodec::Aac => &["fdkaacenc", "avenc_aac", "voaacenc", "faac"],
    }
}

/// Best available encoder element for `codec`
pub fn detect_video_encoder(codec: VideoCodec) -> Option<&'static str> {
    video_encoder_candidates(codec)
        .iter()
        .copied()
        .find(|name| gst::ElementFactory::find(name).is_some())
}

pub fn detect_audio_encoder(codec: AudioCodec) -> Option<&'static str> {
    audio_encoder_candidates(codec)
        .iter()
        .copied()
        .find(|name| gst::ElementFactory::find(name).is_some())
}

fn create_video_encoder_element(config: &VideoConfig) -> Result<gst::Element> {
    let name = detect_video_encoder(config.codec).ok_or_else(|| {
        EncoderError::NotAvailable(format!("no {} encoder installed", config.codec.display_name()))
    })?;
    log::info!("[Video] Using {} for {} encoding", name, config.codec.display_name());

    let encoder = make(name)?;
    let kbps = (config.effective_bitrate() / 1000).max(1).to_string();
    let gop = config.keyframe_interval_frames().to_string();

    set_if_present(&encoder, "bitrate", &kbps);
    // Software encoders name the GOP length key-int-max, hardware ones gop-size
    set_if_present(&encoder, "key-int-max", &gop);
    set_if_present(&encoder, "gop-size", &gop);
    if name.starts_with('x') {
        set_if_present(&encoder, "tune", "zerolatency");
        set_if_present(&encoder, "speed-preset", "veryfast");
    }
    Ok(encoder)
}

// ============================================================================
// Appsink reader shared by both encoders
// ============================================================================

/// Turns pulled appsink samples into [`OutputEvent`]s
struct SinkReader {
    label: &'static str,
    appsink: gst_app::AppSink,
    bus: gst::Bus,
    /// Sample pulled while reporting the format, returned on the next poll
    stashed: Option<gst::Sample>,
    format_sent: bool,
    eos_sent: bool,
    next_index: usize,
}

impl SinkReader {
    fn new(label: &'static str, pipeline: &gst::Pipeline, appsink: gst_app::AppSink) -> Result<Self> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| EncoderError::Gst("pipeline has no bus".into()))?;
        Ok(Self {
            label,
            appsink,
            bus,
            stashed: None,
            format_sent: false,
            eos_sent: false,
            next_index: 0,
        })
    }

    fn poll<F>(&mut self, timeout: Duration, format_of: F) -> Result<OutputEvent>
    where
        F: Fn(Option<&gst::CapsRef>) -> MediaFormat,
    {
        if let Some(error) = pending_error(&self.bus) {
            return Err(EncoderError::Gst(error));
        }

        let sample = match self.stashed.take() {
            Some(sample) => sample,
            None => {
                let pulled = self
                    .appsink
                    .try_pull_sample(gst::ClockTime::from_useconds(timeout.as_micros() as u64));
                match pulled {
                    Some(sample) => sample,
                    None if self.appsink.is_eos() && !self.eos_sent => {
                        self.eos_sent = true;
                        return Ok(OutputEvent::Buffer(OutputBuffer {
                            index: self.take_index(),
                            data: Some(Vec::new()),
                            flags: BufferFlags {
                                end_of_stream: true,
                                ..Default::default()
                            },
                            presentation_time_us: 0,
                        }));
                    }
                    None => return Ok(OutputEvent::TryAgainLater),
                }
            }
        };

        if !self.format_sent {
            self.format_sent = true;
            let format = format_of(sample.caps());
            log::debug!("[{}] Output caps {:?}", self.label, sample.caps());
            self.stashed = Some(sample);
            return Ok(OutputEvent::FormatChanged(format));
        }

        let index = self.take_index();
        let Some(buffer) = sample.buffer() else {
            return Ok(OutputEvent::Buffer(OutputBuffer {
                index,
                data: None,
                flags: BufferFlags::default(),
                presentation_time_us: 0,
            }));
        };

        let data = buffer
            .map_readable()
            .map(|map| map.as_slice().to_vec())
            .map_err(|e| EncoderError::Gst(format!("Failed to map output buffer: {}", e)))?;
        let flags = buffer.flags();

        Ok(OutputEvent::Buffer(OutputBuffer {
            index,
            data: Some(data),
            flags: BufferFlags {
                codec_config: flags.contains(gst::BufferFlags::HEADER),
                end_of_stream: false,
                key_frame: !flags.contains(gst::BufferFlags::DELTA_UNIT),
            },
            presentation_time_us: buffer.pts().map(|t| t.useconds() as i64).unwrap_or(0),
        }))
    }

    fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

fn codec_data(structure: Option<&gst::StructureRef>) -> Vec<u8> {
    structure
        .and_then(|s| s.get::<gst::Buffer>("codec_data").ok())
        .and_then(|buffer| buffer.map_readable().ok().map(|map| map.as_slice().to_vec()))
        .unwrap_or_default()
}

// ============================================================================
// Video encoder
// ============================================================================

/// Surface writing raw frames into the encoder's appsrc
pub struct GstSurface {
    appsrc: gst_app::AppSrc,
    width: u32,
    height: u32,
    first_pts: Option<u64>,
}

impl InputSurface for GstSurface {
    fn submit_frame(&mut self, frame: &RawVideoFrame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height || frame.format != SURFACE_FORMAT {
            return Err(EncoderError::Surface(format!(
                "expected {}x{} {}, got {}x{} {}",
                self.width, self.height, SURFACE_FORMAT, frame.width, frame.height, frame.format
            )));
        }

        let base = *self.first_pts.get_or_insert(frame.pts);
        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(frame.pts.saturating_sub(base)));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame.duration));
        }

        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| EncoderError::Surface(format!("Failed to push frame: {:?}", e)))
    }
}

/// Video encoder pipeline with an appsrc input surface
pub struct GstVideoEncoder {
    config: VideoConfig,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    reader: SinkReader,
    surface_created: bool,
}

impl GstVideoEncoder {
    pub fn new(config: &VideoConfig) -> Result<Self> {
        init()?;

        let pipeline = gst::Pipeline::new();
        let caps = gst_video::VideoCapsBuilder::new()
            .format(gst_video::VideoFormat::Rgba)
            .width(config.width as i32)
            .height(config.height as i32)
            .framerate(gst::Fraction::new(config.fps as i32, 1))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("surface")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        let convert = make("videoconvert")?;
        let encoder = create_video_encoder_element(config)?;
        let parser = make(config.codec.gst_parser())?;
        let stream_format = match config.codec {
            VideoCodec::H264 => "avc",
            VideoCodec::H265 => "hvc1",
        };
        let output_caps = gst::Caps::builder(config.codec.gst_caps_name())
            .field("stream-format", stream_format)
            .field("alignment", "au")
            .build();
        let appsink = gst_app::AppSink::builder()
            .name("encoded")
            .caps(&output_caps)
            .sync(false)
            .build();

        pipeline
            .add_many([appsrc.upcast_ref(), &convert, &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Gst(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([appsrc.upcast_ref(), &convert, &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Gst(format!("Failed to link elements: {}", e)))?;

        let reader = SinkReader::new("Video", &pipeline, appsink)?;
        Ok(Self {
            config: config.clone(),
            pipeline,
            appsrc,
            reader,
            surface_created: false,
        })
    }
}

impl EncoderOutput for GstVideoEncoder {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        let config = &self.config;
        self.reader.poll(timeout, |caps| {
            let structure = caps.and_then(|c| c.structure(0));
            let width = structure.and_then(|s| s.get::<i32>("width").ok()).unwrap_or(config.width as i32);
            let height = structure.and_then(|s| s.get::<i32>("height").ok()).unwrap_or(config.height as i32);
            let fps = structure
                .and_then(|s| s.get::<gst::Fraction>("framerate").ok())
                .filter(|f| f.denom() > 0)
                .map(|f| (f.numer() / f.denom()) as u32)
                .unwrap_or(config.fps);
            MediaFormat::video(config.codec, width as u32, height as u32, fps, codec_data(structure))
        })
    }

    fn release_output(&mut self, index: usize) {
        // Samples are copied out when pulled
        log::trace!("[Video] Released output {}", index);
    }
}

impl VideoEncoder for GstVideoEncoder {
    fn create_input_surface(&mut self) -> Result<Box<dyn InputSurface>> {
        if self.surface_created {
            return Err(EncoderError::Surface("input surface already created".into()));
        }
        self.surface_created = true;
        Ok(Box::new(GstSurface {
            appsrc: self.appsrc.clone(),
            width: self.config.width,
            height: self.config.height,
            first_pts: None,
        }))
    }

    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Gst(format!("Failed to start video encoder: {:?}", e)))?;
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> Result<()> {
        self.appsrc
            .end_of_stream()
            .map(|_| ())
            .map_err(|e| EncoderError::Gst(format!("Failed to send EOS: {:?}", e)))
    }

    fn stop(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| EncoderError::Gst(format!("Failed to stop video encoder: {:?}", e)))?;
        Ok(())
    }

    fn release(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for GstVideoEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

// ============================================================================
// Audio encoder
// ============================================================================

fn pcm_caps(sample_rate: u32, channels: u16) -> gst::Caps {
    gst_audio::AudioCapsBuilder::new_interleaved()
        .format(gst_audio::AudioFormat::S16le)
        .rate(sample_rate as i32)
        .channels(channels as i32)
        .build()
}

/// AAC encoder pipeline fed with interleaved PCM
pub struct GstAudioEncoder {
    config: AudioConfig,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    reader: SinkReader,
}

impl GstAudioEncoder {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        init()?;

        let name = detect_audio_encoder(config.codec).ok_or_else(|| {
            EncoderError::NotAvailable(format!("no {} encoder installed", config.codec.display_name()))
        })?;
        log::info!("[Audio] Using {} for {} encoding", name, config.codec.display_name());

        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("pcm")
            .caps(&pcm_caps(config.sample_rate, config.channels))
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        let convert = make("audioconvert")?;
        let resample = make("audioresample")?;
        let encoder = make(name)?;
        set_if_present(&encoder, "bitrate", &config.bitrate.to_string());
        let parser = make("aacparse")?;
        let output_caps = gst::Caps::builder("audio/mpeg")
            .field("mpegversion", 4i32)
            .field("stream-format", "raw")
            .build();
        let appsink = gst_app::AppSink::builder()
            .name("encoded")
            .caps(&output_caps)
            .sync(false)
            .build();

        pipeline
            .add_many([appsrc.upcast_ref(), &convert, &resample, &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Gst(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([appsrc.upcast_ref(), &convert, &resample, &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Gst(format!("Failed to link elements: {}", e)))?;

        let reader = SinkReader::new("Audio", &pipeline, appsink)?;
        Ok(Self {
            config: config.clone(),
            pipeline,
            appsrc,
            reader,
        })
    }
}

impl EncoderOutput for GstAudioEncoder {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        let config = &self.config;
        self.reader.poll(timeout, |caps| {
            let structure = caps.and_then(|c| c.structure(0));
            let rate = structure.and_then(|s| s.get::<i32>("rate").ok()).unwrap_or(config.sample_rate as i32);
            let channels = structure
                .and_then(|s| s.get::<i32>("channels").ok())
                .unwrap_or(config.channels as i32);
            MediaFormat::audio(config.codec, rate as u32, channels as u16, codec_data(structure))
        })
    }

    fn release_output(&mut self, index: usize) {
        log::trace!("[Audio] Released output {}", index);
    }
}

impl AudioEncoder for GstAudioEncoder {
    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Gst(format!("Failed to start audio encoder: {:?}", e)))?;
        Ok(())
    }

    fn queue_input(&mut self, pcm: &[i16], pts_us: u64, end_of_stream: bool) -> Result<()> {
        if !pcm.is_empty() {
            let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
            let frames = pcm.len() as u64 / self.config.channels.max(1) as u64;
            let duration_ns = frames * 1_000_000_000 / self.config.sample_rate.max(1) as u64;

            let mut buffer = gst::Buffer::from_slice(bytes);
            if let Some(buffer_ref) = buffer.get_mut() {
                buffer_ref.set_pts(gst::ClockTime::from_useconds(pts_us));
                buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration_ns));
            }
            self.appsrc
                .push_buffer(buffer)
                .map_err(|e| EncoderError::Gst(format!("Failed to push PCM: {:?}", e)))?;
        }

        if end_of_stream {
            self.appsrc
                .end_of_stream()
                .map_err(|e| EncoderError::Gst(format!("Failed to send EOS: {:?}", e)))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| EncoderError::Gst(format!("Failed to stop audio encoder: {:?}", e)))?;
        Ok(())
    }

    fn release(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for GstAudioEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

// ============================================================================
// Microphone source
// ============================================================================

/// Default capture device through autoaudiosrc, converted to S16LE
pub struct GstPcmSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GstPcmSource {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        init()?;

        let pipeline = gst::Pipeline::new();
        let source = make("autoaudiosrc")?;
        let convert = make("audioconvert")?;
        let resample = make("audioresample")?;
        let appsink = gst_app::AppSink::builder()
            .name("pcm")
            .caps(&pcm_caps(config.sample_rate, config.channels))
            .sync(false)
            .build();

        pipeline
            .add_many([&source, &convert, &resample, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Capture(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([&source, &convert, &resample, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Capture(format!("Failed to link elements: {}", e)))?;

        Ok(Self { pipeline, appsink })
    }
}

impl PcmSource for GstPcmSource {
    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Capture(format!("Failed to start capture: {:?}", e)))?;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<PcmChunk>> {
        let Some(sample) = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_useconds(timeout.as_micros() as u64))
        else {
            return Ok(None);
        };
        let Some(buffer) = sample.buffer() else {
            return Ok(None);
        };
        let map = buffer
            .map_readable()
            .map_err(|e| EncoderError::Capture(format!("Failed to map PCM buffer: {}", e)))?;
        let samples = map
            .as_slice()
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Some(PcmChunk::new(samples)))
    }

    fn stop(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| EncoderError::Capture(format!("Failed to stop capture: {:?}", e)))?;
        Ok(())
    }
}

impl Drop for GstPcmSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

// ============================================================================
// MP4 container writer
// ============================================================================

fn track_caps(format: &MediaFormat) -> gst::Caps {
    let codec_data = gst::Buffer::from_slice(format.codec_data.clone());
    match &format.params {
        FormatParams::Video { codec, width, height, fps } => {
            let stream_format = match codec {
                VideoCodec::H264 => "avc",
                VideoCodec::H265 => "hvc1",
            };
            gst::Caps::builder(codec.gst_caps_name())
                .field("stream-format", stream_format)
                .field("alignment", "au")
                .field("width", *width as i32)
                .field("height", *height as i32)
                .field("framerate", gst::Fraction::new(*fps as i32, 1))
                .field("codec_data", codec_data)
                .build()
        }
        FormatParams::Audio { sample_rate, channels, .. } => gst::Caps::builder("audio/mpeg")
            .field("mpegversion", 4i32)
            .field("stream-format", "raw")
            .field("rate", *sample_rate as i32)
            .field("channels", *channels as i32)
            .field("codec_data", codec_data)
            .build(),
    }
}

/// mp4mux-backed container writer with one appsrc per track
pub struct GstContainerWriter {
    pipeline: gst::Pipeline,
    muxer: gst::Element,
    tracks: Vec<gst_app::AppSrc>,
    output_path: PathBuf,
}

impl GstContainerWriter {
    pub fn open(path: &Path) -> muxer::Result<Self> {
        init().map_err(|e| MuxError::Open(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pipeline = gst::Pipeline::new();
        let muxer = gst::ElementFactory::make("mp4mux")
            .name("mux")
            .build()
            .map_err(|e| MuxError::Open(format!("Failed to create mp4mux: {}", e)))?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|e| MuxError::Open(format!("Failed to create filesink: {}", e)))?;

        pipeline
            .add_many([&muxer, &filesink])
            .map_err(|e| MuxError::Open(format!("Failed to add elements: {}", e)))?;
        muxer
            .link(&filesink)
            .map_err(|e| MuxError::Open(format!("Failed to link muxer: {}", e)))?;

        log::info!("[Muxer] Opened {}", path.display());
        Ok(Self {
            pipeline,
            muxer,
            tracks: Vec::new(),
            output_path: path.to_path_buf(),
        })
    }

    fn shut_down(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl ContainerWriter for GstContainerWriter {
    fn add_track(&mut self, format: &MediaFormat) -> muxer::Result<TrackId> {
        let id = TrackId(self.tracks.len() as u32);
        let appsrc = gst_app::AppSrc::builder()
            .name(format!("track{}", id.0))
            .caps(&track_caps(format))
            .format(gst::Format::Time)
            .build();

        self.pipeline
            .add(&appsrc)
            .map_err(|e| MuxError::Writer(format!("Failed to add track source: {}", e)))?;
        appsrc
            .link(&self.muxer)
            .map_err(|e| MuxError::Writer(format!("Failed to link {} track: {}", format.kind(), e)))?;

        self.tracks.push(appsrc);
        Ok(id)
    }

    fn start(&mut self) -> muxer::Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| MuxError::Writer(format!("Failed to start muxer: {:?}", e)))?;
        Ok(())
    }

    fn write_sample(&mut self, sample: &EncodedSample) -> muxer::Result<()> {
        let appsrc = self
            .tracks
            .get(sample.track_id.0 as usize)
            .ok_or(MuxError::UnknownTrack(sample.track_id))?;

        let mut buffer = gst::Buffer::from_slice(sample.payload.clone());
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_useconds(sample.timestamp_us));
            if !sample.flags.key_frame {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| MuxError::Writer(format!("Failed to push sample: {:?}", e)))
    }

    fn finalize(&mut self) -> muxer::Result<()> {
        for appsrc in &self.tracks {
            if let Err(e) = appsrc.end_of_stream() {
                log::warn!("[Muxer] Failed to send EOS: {:?}", e);
            }
        }

        let mut pipeline_error = None;
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        pipeline_error = Some(format!("{} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }
        self.shut_down();

        match pipeline_error {
            Some(error) => Err(MuxError::Writer(error)),
            None => Ok(()),
        }
    }

    fn discard(&mut self) -> muxer::Result<()> {
        self.shut_down();
        if self.output_path.exists() {
            std::fs::remove_file(&self.output_path)?;
            log::info!("[Muxer] Removed empty {}", self.output_path.display());
        }
        Ok(())
    }
}

impl Drop for GstContainerWriter {
    fn drop(&mut self) {
        self.shut_down();
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Where the GStreamer backend captures PCM from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureDevice {
    /// autoaudiosrc
    #[default]
    Gstreamer,
    /// The default cpal input device
    #[cfg(feature = "cpal")]
    Cpal,
}

/// Native media backend built on GStreamer
pub struct GstBackend {
    capture: CaptureDevice,
}

impl GstBackend {
    pub fn new(capture: CaptureDevice) -> Result<Self> {
        init()?;
        Ok(Self { capture })
    }
}

impl MediaBackend for GstBackend {
    fn open_container(&self, path: &Path) -> std::result::Result<Box<dyn ContainerWriter>, MuxError> {
        Ok(Box::new(GstContainerWriter::open(path)?))
    }

    fn create_video_encoder(&self, config: &VideoConfig) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(GstVideoEncoder::new(config)?))
    }

    fn create_audio(&self, config: &AudioConfig) -> Result<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)> {
        let source: Box<dyn PcmSource> = match self.capture {
            CaptureDevice::Gstreamer => Box::new(GstPcmSource::new(config)?),
            #[cfg(feature = "cpal")]
            CaptureDevice::Cpal => Box::new(crate::recording::cpal_source::CpalPcmSource::new(config)?),
        };
        Ok((source, Box::new(GstAudioEncoder::new(config)?)))
    }
}
