// Scripted encoders and capture source standing in for native codecs

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AudioConfig, VideoConfig};
use crate::encoding::encoder::Result;
use crate::encoding::{
    AudioEncoder, BufferFlags, EncoderError, EncoderOutput, InputSurface, MediaFormat,
    OutputBuffer, OutputEvent, PcmChunk, PcmSource, RawVideoFrame, VideoEncoder,
};

/// Status code emitted for [`VideoScript::unexpected_status_at`]
pub const UNEXPECTED_STATUS: i32 = -1_000;

// ── Shared counters ──────────────────────────────────────────────────

/// Calls observed on a fake, readable from the test thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub started: u32,
    pub stopped: u32,
    pub released: u32,
    pub end_of_input: u32,
    pub inputs: u64,
    pub buffers_emitted: u64,
    pub buffers_released: u64,
}

pub type SharedCounters = Arc<Mutex<Counters>>;

// ── Video ────────────────────────────────────────────────────────────

/// Behaviour knobs of [`FakeVideoEncoder`]
#[derive(Debug, Clone, Default)]
pub struct VideoScript {
    /// Emit a codec-config buffer right after the format event
    pub emit_codec_config: bool,
    /// Report a ready buffer with no data for the n-th data buffer (0-based)
    pub null_buffer_at: Option<u64>,
    /// Emit an unrecognised status before the n-th data buffer
    pub unexpected_status_at: Option<u64>,
    /// Never emit the end-of-stream buffer
    pub never_eos: bool,
    /// Refuse to start
    pub fail_start: bool,
}

/// Input surface that hands frames to a [`FakeVideoEncoder`]
pub struct FakeSurface {
    frames: Sender<RawVideoFrame>,
}

impl InputSurface for FakeSurface {
    fn submit_frame(&mut self, frame: &RawVideoFrame) -> Result<()> {
        self.frames
            .send(frame.clone())
            .map_err(|_| EncoderError::Surface("encoder is gone".into()))
    }
}

/// Video encoder with one frame of latency.
///
/// Each frame received on the surface produces a compressed buffer once the
/// next frame arrives; the last frame comes out flagged end of stream after
/// [`VideoEncoder::signal_end_of_input_stream`].
pub struct FakeVideoEncoder {
    config: VideoConfig,
    script: VideoScript,
    counters: SharedCounters,
    frames_tx: Option<Sender<RawVideoFrame>>,
    frames_rx: Receiver<RawVideoFrame>,
    pending: VecDeque<OutputEvent>,
    held: Option<RawVideoFrame>,
    running: bool,
    format_sent: bool,
    end_of_input: bool,
    eos_sent: bool,
    next_index: usize,
    data_buffers: u64,
}

impl FakeVideoEncoder {
    pub fn new(config: &VideoConfig, script: VideoScript, counters: SharedCounters) -> Self {
        let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
        Self {
            config: config.clone(),
            script,
            counters,
            frames_tx: Some(frames_tx),
            frames_rx,
            pending: VecDeque::new(),
            held: None,
            running: false,
            format_sent: false,
            end_of_input: false,
            eos_sent: false,
            next_index: 0,
            data_buffers: 0,
        }
    }

    fn format(&self) -> MediaFormat {
        MediaFormat::video(
            self.config.codec,
            self.config.width,
            self.config.height,
            self.config.fps,
            vec![0x01, 0x64, 0x00, 0x1f],
        )
    }

    fn accept(&mut self, frame: RawVideoFrame) {
        if self.end_of_input {
            return;
        }
        self.counters.lock().inputs += 1;

        if !self.format_sent {
            self.format_sent = true;
            self.pending.push_back(OutputEvent::FormatChanged(self.format()));
            if self.script.emit_codec_config {
                let index = self.take_index();
                self.pending.push_back(OutputEvent::Buffer(OutputBuffer {
                    index,
                    data: Some(vec![0, 0, 0, 1, 0x67]),
                    flags: BufferFlags {
                        codec_config: true,
                        ..Default::default()
                    },
                    presentation_time_us: 0,
                }));
            }
        }

        if let Some(previous) = self.held.replace(frame) {
            self.emit(previous, false);
        }
    }

    fn emit(&mut self, frame: RawVideoFrame, end_of_stream: bool) {
        let n = self.data_buffers;
        self.data_buffers += 1;

        if self.script.unexpected_status_at == Some(n) {
            self.pending.push_back(OutputEvent::Unexpected(UNEXPECTED_STATUS));
        }

        let interval = self.config.keyframe_interval_frames() as u64;
        let data = if self.script.null_buffer_at == Some(n) {
            None
        } else {
            // Payload size loosely tracks the input so stats have something to count
            Some(vec![(n % 251) as u8; 16 + frame.data.len() / 64])
        };

        let index = self.take_index();
        self.pending.push_back(OutputEvent::Buffer(OutputBuffer {
            index,
            data,
            flags: BufferFlags {
                codec_config: false,
                end_of_stream,
                key_frame: n % interval == 0,
            },
            presentation_time_us: (frame.pts / 1_000) as i64,
        }));
        self.counters.lock().buffers_emitted += 1;
    }

    fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn pull_available(&mut self) {
        while let Ok(frame) = self.frames_rx.try_recv() {
            self.accept(frame);
        }
    }
}

impl EncoderOutput for FakeVideoEncoder {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        if !self.running {
            return Err(EncoderError::NotRunning);
        }

        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        if self.end_of_input {
            if self.pending.is_empty() && !self.eos_sent && !self.script.never_eos {
                self.eos_sent = true;
                match self.held.take() {
                    Some(last) => self.emit(last, true),
                    None => {
                        let index = self.take_index();
                        self.pending.push_back(OutputEvent::Buffer(OutputBuffer {
                            index,
                            data: Some(Vec::new()),
                            flags: BufferFlags {
                                end_of_stream: true,
                                ..Default::default()
                            },
                            presentation_time_us: 0,
                        }));
                    }
                }
            }
            return Ok(match self.pending.pop_front() {
                Some(event) => event,
                None => {
                    std::thread::sleep(timeout);
                    OutputEvent::TryAgainLater
                }
            });
        }

        match self.frames_rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.accept(frame);
                self.pull_available();
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }

        Ok(self.pending.pop_front().unwrap_or(OutputEvent::TryAgainLater))
    }

    fn release_output(&mut self, _index: usize) {
        self.counters.lock().buffers_released += 1;
    }
}

impl VideoEncoder for FakeVideoEncoder {
    fn create_input_surface(&mut self) -> Result<Box<dyn InputSurface>> {
        let frames = self
            .frames_tx
            .take()
            .ok_or_else(|| EncoderError::Surface("input surface already created".into()))?;
        Ok(Box::new(FakeSurface { frames }))
    }

    fn start(&mut self) -> Result<()> {
        if self.script.fail_start {
            return Err(EncoderError::Configure("scripted start failure".into()));
        }
        self.running = true;
        self.counters.lock().started += 1;
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> Result<()> {
        if !self.running {
            return Err(EncoderError::NotRunning);
        }
        // Frames already on the surface are still encoded
        self.pull_available();
        self.end_of_input = true;
        self.counters.lock().end_of_input += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        self.counters.lock().stopped += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.pending.clear();
        self.held = None;
        self.counters.lock().released += 1;
    }
}

// ── Audio ────────────────────────────────────────────────────────────

/// Behaviour knobs of [`FakeAudioEncoder`] and [`FakePcmSource`]
#[derive(Debug, Clone, Default)]
pub struct AudioScript {
    /// Never emit a format event, so the audio track never registers
    pub withhold_format: bool,
    /// Refuse to start the capture source
    pub fail_source_start: bool,
}

/// Audio encoder that turns every queued PCM block into one output buffer
pub struct FakeAudioEncoder {
    config: AudioConfig,
    script: AudioScript,
    counters: SharedCounters,
    pending: VecDeque<OutputEvent>,
    running: bool,
    format_sent: bool,
    next_index: usize,
}

impl FakeAudioEncoder {
    pub fn new(config: &AudioConfig, script: AudioScript, counters: SharedCounters) -> Self {
        Self {
            config: config.clone(),
            script,
            counters,
            pending: VecDeque::new(),
            running: false,
            format_sent: false,
            next_index: 0,
        }
    }
}

impl EncoderOutput for FakeAudioEncoder {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        if !self.running {
            return Err(EncoderError::NotRunning);
        }
        match self.pending.pop_front() {
            Some(event) => Ok(event),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(1)));
                Ok(OutputEvent::TryAgainLater)
            }
        }
    }

    fn release_output(&mut self, _index: usize) {
        self.counters.lock().buffers_released += 1;
    }
}

impl AudioEncoder for FakeAudioEncoder {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        self.counters.lock().started += 1;
        Ok(())
    }

    fn queue_input(&mut self, pcm: &[i16], pts_us: u64, end_of_stream: bool) -> Result<()> {
        if !self.running {
            return Err(EncoderError::NotRunning);
        }
        let mut counters = self.counters.lock();
        counters.inputs += 1;
        if end_of_stream {
            counters.end_of_input += 1;
        }

        if !self.format_sent && !self.script.withhold_format {
            self.format_sent = true;
            self.pending.push_back(OutputEvent::FormatChanged(MediaFormat::audio(
                self.config.codec,
                self.config.sample_rate,
                self.config.channels,
                vec![0x12, 0x08],
            )));
        }

        if pcm.is_empty() && !end_of_stream {
            return Ok(());
        }

        let index = self.next_index;
        self.next_index += 1;
        self.pending.push_back(OutputEvent::Buffer(OutputBuffer {
            index,
            // The flush on end of stream still yields a final frame
            data: Some(vec![0x21; (pcm.len() / 8).max(4)]),
            flags: BufferFlags {
                end_of_stream,
                key_frame: true,
                ..Default::default()
            },
            presentation_time_us: pts_us as i64,
        }));
        counters.buffers_emitted += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        self.counters.lock().stopped += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.pending.clear();
        self.counters.lock().released += 1;
    }
}

/// Capture source producing a 440 Hz tone in 10 ms chunks
pub struct FakePcmSource {
    sample_rate: u32,
    channels: u16,
    script: AudioScript,
    counters: SharedCounters,
    running: bool,
    phase: f32,
}

impl FakePcmSource {
    pub const CHUNK: Duration = Duration::from_millis(10);

    pub fn new(config: &AudioConfig, script: AudioScript, counters: SharedCounters) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels.max(1),
            script,
            counters,
            running: false,
            phase: 0.0,
        }
    }
}

impl PcmSource for FakePcmSource {
    fn start(&mut self) -> Result<()> {
        if self.script.fail_source_start {
            return Err(EncoderError::Capture("no input device".into()));
        }
        self.running = true;
        self.counters.lock().started += 1;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<PcmChunk>> {
        if !self.running {
            return Ok(None);
        }
        if timeout < Self::CHUNK {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        std::thread::sleep(Self::CHUNK);

        let frames = (self.sample_rate as u64 * Self::CHUNK.as_millis() as u64 / 1_000) as usize;
        let step = 440.0 * std::f32::consts::TAU / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(frames * self.channels as usize);
        for _ in 0..frames {
            let value = (self.phase.sin() * 8_000.0) as i16;
            self.phase = (self.phase + step) % std::f32::consts::TAU;
            samples.extend(std::iter::repeat(value).take(self.channels as usize));
        }
        self.counters.lock().inputs += 1;
        Ok(Some(PcmChunk::new(samples)))
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        self.counters.lock().stopped += 1;
        Ok(())
    }
}
