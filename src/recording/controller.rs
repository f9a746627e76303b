//! Recording controller
//!
//! Ties the video and audio pipelines, the shared clock and the muxer gate
//! into one capture session with a four-phase lifecycle. `stop()` blocks until
//! both workers have quiesced and then finalizes the container.

use chrono::Local;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RecorderConfig;
use crate::encoding::{EncoderError, InputSurface, MediaBackend, RawVideoFrame, TrackKind};

use super::audio::AudioCaptureEncoder;
use super::clock::PtsClock;
use super::drain::{DrainError, DrainOptions};
use super::muxer::{FinalizeOutcome, MuxError, MuxerGate, MuxerStats, TrackState};
use super::video::{FrameSink, VideoEncoderCore};
use super::{advance, Lifecycle, LifecycleState, PipelineContext, Quiescence, QUIESCENCE_POLL};

/// Error type for recorder operations
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Input surface already acquired")]
    SurfaceAlreadyAcquired,

    #[error("The {0} worker is not running")]
    WorkerGone(TrackKind),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Muxer error: {0}")]
    Mux(#[from] MuxError),

    #[error("Drain error: {0}")]
    Drain(#[from] DrainError),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

/// Notification sent from the workers to whoever holds [`CaptureController::events`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecorderEvent {
    Error {
        pipeline: TrackKind,
        error: String,
        /// The pipeline stopped producing output
        fatal: bool,
    },
}

/// What a finished recording produced
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub output_path: PathBuf,
    pub outcome: FinalizeOutcome,
    pub stats: MuxerStats,
    pub duration: Duration,
}

/// Pipelines and shared state that exist once `prepare` succeeded
struct Session {
    gate: Arc<MuxerGate>,
    quiescence: Arc<Quiescence>,
    pipelines: Vec<TrackKind>,
    video: VideoEncoderCore,
    audio: Option<AudioCaptureEncoder>,
    sink: Option<FrameSink>,
}

/// Capture session over a video pipeline and an optional audio pipeline
pub struct CaptureController {
    config: RecorderConfig,
    backend: Arc<dyn MediaBackend>,
    state: LifecycleState,
    output_path: Option<PathBuf>,
    clock: Arc<PtsClock>,
    session: Option<Session>,
    events_tx: Sender<RecorderEvent>,
    events_rx: Receiver<RecorderEvent>,
    outcome: Option<FinalizeOutcome>,
    started_at: Option<Instant>,
    duration: Duration,
}

impl CaptureController {
    pub fn new(config: RecorderConfig, backend: Arc<dyn MediaBackend>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            backend,
            state: LifecycleState::Created,
            output_path: None,
            clock: Arc::new(PtsClock::new()),
            session: None,
            events_tx,
            events_rx,
            outcome: None,
            started_at: None,
            duration: Duration::ZERO,
        }
    }

    /// Write to `path` instead of a timestamped file in the output directory
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Output file, known once `prepare` ran
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Channel of worker errors. Every clone sees a share of the same stream.
    pub fn events(&self) -> Receiver<RecorderEvent> {
        self.events_rx.clone()
    }

    /// Shared presentation clock in microseconds. Calling this before capture
    /// begins anchors the clock at the time of the call.
    pub fn pts_us(&self) -> u64 {
        self.clock.pts_us()
    }

    /// Hand the encoder's input surface to an external renderer.
    /// Call [`frame_rendered`](Self::frame_rendered) after drawing each frame.
    pub fn acquire_input_surface(&mut self) -> Result<Box<dyn InputSurface>> {
        let state = self.state;
        let session = self.session_mut("acquire_input_surface", state)?;
        session.video.acquire_input_surface()
    }

    /// Ask the video worker to drain after the renderer drew a frame
    pub fn frame_rendered(&mut self) -> Result<()> {
        let state = self.state;
        let session = self.session_mut("frame_rendered", state)?;
        session.video.drain(false)
    }

    /// Cloneable frame submission handle for a renderer thread
    pub fn frame_sink(&mut self) -> Result<FrameSink> {
        let state = self.state;
        let session = self.session_mut("frame_sink", state)?;
        if session.sink.is_none() {
            session.sink = Some(session.video.frame_sink()?);
        }
        session
            .sink
            .clone()
            .ok_or(RecorderError::SurfaceAlreadyAcquired)
    }

    /// Write a frame onto the input surface and request a drain
    pub fn submit_frame(&mut self, frame: &RawVideoFrame) -> Result<()> {
        if self.state != LifecycleState::Started {
            return Err(RecorderError::InvalidState {
                operation: "submit_frame",
                state: self.state,
            });
        }
        self.frame_sink()?.submit(frame)
    }

    /// Request the one-shot end-of-stream drain. Also stops audio capture.
    pub fn end_of_stream(&mut self) -> Result<()> {
        if self.state != LifecycleState::Started {
            return Err(RecorderError::InvalidState {
                operation: "end_of_stream",
                state: self.state,
            });
        }
        let state = self.state;
        let session = self.session_mut("end_of_stream", state)?;
        log::info!("[Recorder] End of stream requested");
        session.video.drain(true)
    }

    /// End the stream, stop, release, and report what was written
    pub fn finish(&mut self) -> Result<RecordingSummary> {
        if self.state == LifecycleState::Started {
            self.end_of_stream()?;
        }
        self.stop()?;
        let summary = self.summary();
        self.release()?;
        summary.ok_or(RecorderError::InvalidState {
            operation: "finish",
            state: self.state,
        })
    }

    /// Summary of a stopped recording
    pub fn summary(&self) -> Option<RecordingSummary> {
        let session = self.session.as_ref()?;
        let outcome = self.outcome.clone()?;
        Some(RecordingSummary {
            output_path: self.output_path.clone().unwrap_or_default(),
            outcome,
            stats: session.gate.stats(),
            duration: self.duration,
        })
    }

    fn session_mut(&mut self, operation: &'static str, state: LifecycleState) -> Result<&mut Session> {
        if state == LifecycleState::Released {
            return Err(RecorderError::InvalidState { operation, state });
        }
        self.session
            .as_mut()
            .ok_or(RecorderError::InvalidState { operation, state })
    }

    fn fail(&mut self, error: RecorderError, pipeline: TrackKind) -> RecorderError {
        log::error!("[Recorder] Prepare failed: {}", error);
        self.state = LifecycleState::Failed;
        let _ = self.events_tx.send(RecorderEvent::Error {
            pipeline,
            error: error.to_string(),
            fatal: true,
        });
        error
    }

    fn build_session(&mut self, path: &Path) -> Result<Session> {
        let writer = self
            .backend
            .open_container(path)
            .map_err(|e| self.fail(e.into(), TrackKind::Video))?;

        let mut pipelines = vec![TrackKind::Video];
        if self.config.audio.enabled {
            pipelines.push(TrackKind::Audio);
        }
        let gate = Arc::new(MuxerGate::new(writer, &pipelines));
        let quiescence = Arc::new(Quiescence::new(&pipelines));
        let ctx = PipelineContext {
            gate: gate.clone(),
            clock: self.clock.clone(),
            quiescence: quiescence.clone(),
            events: self.events_tx.clone(),
            drain: DrainOptions::from(&self.config.drain),
        };

        let audio = if self.config.audio.enabled {
            match self.backend.create_audio(&self.config.audio) {
                Ok((source, encoder)) => Some(AudioCaptureEncoder::new(
                    source,
                    encoder,
                    &self.config.audio,
                    ctx.clone(),
                )),
                Err(e) => {
                    gate.finalize();
                    return Err(self.fail(e.into(), TrackKind::Audio));
                }
            }
        } else {
            None
        };

        let video = self
            .backend
            .create_video_encoder(&self.config.video)
            .map_err(RecorderError::from)
            .and_then(|encoder| {
                VideoEncoderCore::new(
                    encoder,
                    &self.config.video,
                    ctx,
                    audio.as_ref().map(|a| a.stop_handle()),
                )
            });
        let video = match video {
            Ok(video) => video,
            Err(e) => {
                gate.finalize();
                return Err(self.fail(e, TrackKind::Video));
            }
        };

        Ok(Session {
            gate,
            quiescence,
            pipelines,
            video,
            audio,
            sink: None,
        })
    }
}

impl Lifecycle for CaptureController {
    type Error = RecorderError;

    /// Open the container and create both pipelines.
    ///
    /// Any failure here is reported synchronously and leaves the controller
    /// `Failed`; it never reaches `Started`.
    fn prepare(&mut self) -> Result<()> {
        if self.state != LifecycleState::Created {
            return Err(RecorderError::InvalidState {
                operation: "prepare",
                state: self.state,
            });
        }

        let path = self
            .output_path
            .clone()
            .unwrap_or_else(|| self.config.output_path_for(Local::now()));
        self.output_path = Some(path.clone());
        log::info!("[Recorder] Preparing capture to {}", path.display());

        let mut session = self.build_session(&path)?;

        if let Some(audio) = session.audio.as_mut() {
            if let Err(e) = audio.prepare() {
                session.gate.finalize();
                return Err(self.fail(e, TrackKind::Audio));
            }
        }
        if let Err(e) = session.video.prepare() {
            session.gate.finalize();
            return Err(self.fail(e, TrackKind::Video));
        }

        self.session = Some(session);
        advance(&mut self.state, LifecycleState::Prepared, "prepare")
    }

    fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Prepared {
            return Err(RecorderError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let state = self.state;
        let session = self.session_mut("start", state)?;

        session.video.start()?;
        if let Some(audio) = session.audio.as_mut() {
            audio.start()?;
        }

        self.started_at = Some(Instant::now());
        log::info!("[Recorder] Capture started");
        advance(&mut self.state, LifecycleState::Started, "start")
    }

    /// Stop both pipelines, wait until they have quiesced, then finalize the
    /// container. Calling it again on a stopped controller returns the same state.
    fn stop(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Created | LifecycleState::Failed => return Ok(()),
            LifecycleState::Released => {
                return Err(RecorderError::InvalidState {
                    operation: "stop",
                    state: self.state,
                })
            }
            _ => {}
        }
        advance(&mut self.state, LifecycleState::Stopping, "stop")?;

        let Some(session) = self.session.as_mut() else {
            return Err(RecorderError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        };

        log::info!("[Recorder] Stopping");
        session.video.begin_stop()?;
        if let Some(audio) = session.audio.as_mut() {
            audio.begin_stop()?;
        }

        // Queued drains still run against a gate that may start late. Only a
        // stopped pipeline whose track never registered makes the start
        // impossible; then writers blocked on the other track are released.
        let video = &session.video;
        let audio = session.audio.as_ref();
        let gate = &session.gate;
        session.quiescence.wait_stopped_observing(
            &session.pipelines,
            QUIESCENCE_POLL,
            |kind| match kind {
                TrackKind::Video => video.worker_gone(),
                TrackKind::Audio => audio.map_or(true, |a| a.worker_gone()),
            },
            |stopped| {
                let stranded = stopped
                    .iter()
                    .any(|kind| gate.track_state(*kind) == Some(TrackState::Unregistered));
                if stranded {
                    gate.abandon_start();
                }
            },
        );

        if session.video.state() == LifecycleState::Stopping {
            session.video.finish_stop()?;
        }
        if let Some(audio) = session.audio.as_mut() {
            if audio.state() == LifecycleState::Stopping {
                audio.finish_stop()?;
            }
        }

        let outcome = session.gate.finalize();
        if let Some(started_at) = self.started_at.take() {
            self.duration = started_at.elapsed();
        }
        log::info!("[Recorder] Stopped: {:?}", outcome);
        self.outcome = Some(outcome);

        advance(&mut self.state, LifecycleState::Stopped, "stop")
    }

    /// Stop if needed, then release both pipelines. Idempotent.
    fn release(&mut self) -> Result<()> {
        if self.state == LifecycleState::Released {
            return Ok(());
        }
        if !matches!(self.state, LifecycleState::Created | LifecycleState::Failed) {
            self.stop()?;
        }

        if let Some(session) = self.session.as_mut() {
            session.sink = None;
            let video = session.video.release();
            let audio = session.audio.as_mut().map(|a| a.release()).unwrap_or(Ok(()));
            video?;
            audio?;
        }

        self.state = LifecycleState::Released;
        log::info!("[Recorder] Released");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if self.state != LifecycleState::Released {
            if let Err(e) = self.release() {
                log::warn!("[Recorder] Release on drop failed: {}", e);
            }
        }
    }
}
