//! Surface-input video pipeline
//!
//! The renderer draws into the encoder's input surface on its own thread and
//! asks for a drain after each frame. Drain requests are queued to a dedicated
//! worker that owns the encoder, so at most one drain runs at a time and the
//! renderer never blocks on the encoder.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::VideoConfig;
use crate::encoding::{EncoderError, InputSurface, RawVideoFrame, TrackKind, VideoEncoder};

use super::audio::AudioStopHandle;
use super::controller::RecorderError;
use super::drain::{drain_encoder, DrainOutcome, TrackOutput};
use super::{advance, Lifecycle, LifecycleState, PipelineContext, QUIESCENCE_POLL};

type Result<T> = std::result::Result<T, RecorderError>;

/// Work items for the video worker
enum VideoTask {
    Start {
        reply: Sender<std::result::Result<(), EncoderError>>,
    },
    Drain {
        end_of_stream: bool,
    },
    Stop,
    Shutdown,
}

/// Cloneable handle a renderer thread uses to push frames.
///
/// Each submitted frame is written to the input surface and followed by a
/// drain request.
#[derive(Clone)]
pub struct FrameSink {
    surface: Arc<Mutex<Box<dyn InputSurface>>>,
    tasks: Sender<VideoTask>,
}

impl FrameSink {
    pub fn submit(&self, frame: &RawVideoFrame) -> Result<()> {
        self.surface.lock().submit_frame(frame)?;
        self.tasks
            .send(VideoTask::Drain { end_of_stream: false })
            .map_err(|_| RecorderError::WorkerGone(TrackKind::Video))
    }
}

/// Owns the video encoder and runs its drain loop on a worker thread
pub struct VideoEncoderCore {
    config: VideoConfig,
    ctx: PipelineContext,
    state: LifecycleState,
    /// Held until `prepare` moves it into the worker, and again after `release` joins it
    encoder: Option<Box<dyn VideoEncoder>>,
    surface: Option<Box<dyn InputSurface>>,
    audio_stop: Option<AudioStopHandle>,
    tasks: Sender<VideoTask>,
    task_receiver: Option<Receiver<VideoTask>>,
    worker: Option<JoinHandle<Box<dyn VideoEncoder>>>,
    eos_requested: bool,
}

impl VideoEncoderCore {
    /// Wrap `encoder` and create its input surface.
    ///
    /// `audio_stop` is signalled when the end-of-stream drain begins.
    pub fn new(
        mut encoder: Box<dyn VideoEncoder>,
        config: &VideoConfig,
        ctx: PipelineContext,
        audio_stop: Option<AudioStopHandle>,
    ) -> Result<Self> {
        let surface = encoder.create_input_surface()?;
        let (tasks, task_receiver) = crossbeam_channel::unbounded();

        log::debug!(
            "[Video] Created {} {}x{}@{} encoder core",
            config.codec.display_name(),
            config.width,
            config.height,
            config.fps
        );

        Ok(Self {
            config: config.clone(),
            ctx,
            state: LifecycleState::Created,
            encoder: Some(encoder),
            surface: Some(surface),
            audio_stop,
            tasks,
            task_receiver: Some(task_receiver),
            worker: None,
            eos_requested: false,
        })
    }

    /// Hand the input surface to the renderer. Only the first call succeeds.
    pub fn acquire_input_surface(&mut self) -> Result<Box<dyn InputSurface>> {
        self.surface.take().ok_or(RecorderError::SurfaceAlreadyAcquired)
    }

    /// Take the input surface wrapped in a [`FrameSink`]. Counts as acquiring it.
    pub fn frame_sink(&mut self) -> Result<FrameSink> {
        let surface = self.acquire_input_surface()?;
        Ok(FrameSink {
            surface: Arc::new(Mutex::new(surface)),
            tasks: self.tasks.clone(),
        })
    }

    /// Queue a drain request and return immediately.
    ///
    /// The end-of-stream request is one-shot; repeats are ignored.
    pub fn drain(&mut self, end_of_stream: bool) -> Result<()> {
        if self.state == LifecycleState::Released {
            return Err(RecorderError::InvalidState {
                operation: "drain",
                state: self.state,
            });
        }
        if end_of_stream {
            if self.eos_requested {
                log::debug!("[Video] End of stream already requested");
                return Ok(());
            }
            self.eos_requested = true;
        }
        self.tasks
            .send(VideoTask::Drain { end_of_stream })
            .map_err(|_| RecorderError::WorkerGone(TrackKind::Video))
    }

    pub fn pts_us(&self) -> u64 {
        self.ctx.clock.pts_us()
    }

    pub fn config(&self) -> &VideoConfig {
        &self.config
    }

    pub(crate) fn worker_gone(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Post a stop task without waiting for it
    pub(crate) fn begin_stop(&mut self) -> Result<bool> {
        match self.state {
            LifecycleState::Created | LifecycleState::Failed => return Ok(false),
            _ => advance(&mut self.state, LifecycleState::Stopping, "stop")?,
        }
        if self.tasks.send(VideoTask::Stop).is_err() {
            log::warn!("[Video] Worker already gone, treating as stopped");
            self.ctx.quiescence.mark_stopped(TrackKind::Video);
        }
        Ok(true)
    }

    /// Record that the worker has quiesced
    pub(crate) fn finish_stop(&mut self) -> Result<()> {
        advance(&mut self.state, LifecycleState::Stopped, "stop")
    }

    fn run_worker(
        mut encoder: Box<dyn VideoEncoder>,
        tasks: Receiver<VideoTask>,
        ctx: PipelineContext,
        audio_stop: Option<AudioStopHandle>,
    ) -> Box<dyn VideoEncoder> {
        let mut track = TrackOutput::new(
            TrackKind::Video,
            ctx.gate.clone(),
            ctx.clock.clone(),
            ctx.events.clone(),
        );
        let mut running = false;
        let mut faulted = false;
        let mut reached_eos = false;

        for task in tasks.iter() {
            match task {
                VideoTask::Start { reply } => {
                    let result = encoder.start();
                    running = result.is_ok();
                    if running {
                        log::info!("[Video] Encoder started");
                    }
                    let _ = reply.send(result);
                }
                VideoTask::Drain { end_of_stream } => {
                    if !running || faulted || reached_eos {
                        log::trace!("[Video] Ignoring drain request");
                        continue;
                    }

                    if end_of_stream {
                        log::info!("[Video] End of stream requested, draining encoder");
                        if let Err(e) = encoder.signal_end_of_input_stream() {
                            log::warn!("[Video] Failed to signal end of input: {}", e);
                        }
                        if let Some(audio) = &audio_stop {
                            audio.request_stop();
                        }
                    }

                    match drain_encoder(encoder.as_mut(), &mut track, end_of_stream, &ctx.drain) {
                        Ok(DrainOutcome::Drained) => {}
                        Ok(DrainOutcome::EndOfStream) => reached_eos = true,
                        Err(e) if e.is_fatal() => {
                            log::error!("[Video] Drain failed, worker faulted: {}", e);
                            track.report(e.to_string(), true);
                            faulted = true;
                        }
                        Err(e) => {
                            log::warn!("[Video] Drain error: {}", e);
                            track.report(e.to_string(), false);
                        }
                    }
                }
                VideoTask::Stop => {
                    if running {
                        if let Err(e) = encoder.stop() {
                            log::warn!("[Video] Failed to stop encoder: {}", e);
                        }
                        running = false;
                        log::info!(
                            "[Video] Stopped after {} samples ({} failed writes)",
                            track.samples_written(),
                            track.write_failures()
                        );
                    }
                    ctx.quiescence.mark_stopped(TrackKind::Video);
                }
                VideoTask::Shutdown => break,
            }
        }

        ctx.quiescence.mark_stopped(TrackKind::Video);
        encoder
    }
}

impl Lifecycle for VideoEncoderCore {
    type Error = RecorderError;

    fn prepare(&mut self) -> Result<()> {
        advance(&mut self.state, LifecycleState::Prepared, "prepare")?;

        let (Some(encoder), Some(tasks)) = (self.encoder.take(), self.task_receiver.take()) else {
            self.state = LifecycleState::Failed;
            return Err(RecorderError::WorkerGone(TrackKind::Video));
        };
        let ctx = self.ctx.clone();
        let audio_stop = self.audio_stop.clone();

        let worker = std::thread::Builder::new()
            .name("mediarecorder-video".into())
            .spawn(move || Self::run_worker(encoder, tasks, ctx, audio_stop))
            .map_err(|e| {
                self.state = LifecycleState::Failed;
                RecorderError::Spawn(e)
            })?;
        self.worker = Some(worker);

        log::debug!("[Video] Worker spawned");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Prepared {
            return Err(RecorderError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.ctx.quiescence.mark_running(TrackKind::Video);
        let (reply, result) = crossbeam_channel::bounded(1);
        let started = self
            .tasks
            .send(VideoTask::Start { reply })
            .ok()
            .and_then(|_| result.recv().ok());

        match started {
            Some(Ok(())) => advance(&mut self.state, LifecycleState::Started, "start"),
            Some(Err(e)) => {
                self.ctx.quiescence.mark_stopped(TrackKind::Video);
                Err(e.into())
            }
            None => {
                self.ctx.quiescence.mark_stopped(TrackKind::Video);
                Err(RecorderError::WorkerGone(TrackKind::Video))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if !self.begin_stop()? {
            return Ok(());
        }
        let worker = &self.worker;
        self.ctx.quiescence.wait_stopped(&[TrackKind::Video], QUIESCENCE_POLL, |_| {
            worker.as_ref().map_or(true, |w| w.is_finished())
        });
        self.finish_stop()
    }

    fn release(&mut self) -> Result<()> {
        if self.state == LifecycleState::Released {
            return Ok(());
        }
        if matches!(
            self.state,
            LifecycleState::Prepared | LifecycleState::Started | LifecycleState::Stopping
        ) {
            self.stop()?;
        }

        if let Some(worker) = self.worker.take() {
            let _ = self.tasks.send(VideoTask::Shutdown);
            match worker.join() {
                Ok(encoder) => self.encoder = Some(encoder),
                Err(_) => log::error!("[Video] Worker panicked, encoder cannot be released"),
            }
        }

        if let Some(mut encoder) = self.encoder.take() {
            encoder.release();
        }
        self.surface = None;
        self.state = LifecycleState::Released;
        log::info!("[Video] Released");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state
    }
}

impl Drop for VideoEncoderCore {
    fn drop(&mut self) {
        if self.state != LifecycleState::Released {
            if let Err(e) = self.release() {
                log::warn!("[Video] Release on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::TrackKind;
    use crate::recording::clock::PtsClock;
    use crate::recording::drain::DrainOptions;
    use crate::recording::muxer::MuxerGate;
    use crate::recording::Quiescence;
    use crate::test_harness::fake_encoder::{FakeVideoEncoder, SharedCounters, VideoScript};
    use crate::test_harness::memory_writer::{MemoryContainerWriter, SharedWriterLog};
    use crate::test_harness::validators::validate_container;
    use std::time::{Duration, Instant};

    struct Fixture {
        core: VideoEncoderCore,
        counters: SharedCounters,
        log: SharedWriterLog,
        gate: Arc<MuxerGate>,
        events: Receiver<crate::recording::RecorderEvent>,
    }

    fn fixture(script: VideoScript) -> Fixture {
        let config = VideoConfig {
            width: 64,
            height: 64,
            ..VideoConfig::default()
        };
        let counters = SharedCounters::default();
        let encoder = FakeVideoEncoder::new(&config, script, counters.clone());
        let (writer, log) = MemoryContainerWriter::new();
        let gate = Arc::new(MuxerGate::new(Box::new(writer), &[TrackKind::Video]));
        let (events_tx, events) = crossbeam_channel::unbounded();
        let ctx = PipelineContext {
            gate: gate.clone(),
            clock: Arc::new(PtsClock::new()),
            quiescence: Arc::new(Quiescence::new(&[TrackKind::Video])),
            events: events_tx,
            drain: DrainOptions {
                poll_timeout: Duration::from_millis(2),
                eos_timeout: Some(Duration::from_millis(200)),
            },
        };
        let core = VideoEncoderCore::new(Box::new(encoder), &config, ctx, None).unwrap();
        Fixture { core, counters, log, gate, events }
    }

    fn frame(i: u64) -> RawVideoFrame {
        RawVideoFrame {
            data: vec![i as u8; 64 * 64 * 4],
            pts: i * 33_333_333,
            duration: 33_333_333,
            width: 64,
            height: 64,
            format: "RGBA".into(),
            capture_time: Instant::now(),
        }
    }

    #[test]
    fn surface_can_only_be_acquired_once() {
        let mut fx = fixture(VideoScript::default());
        assert!(fx.core.acquire_input_surface().is_ok());
        assert!(matches!(
            fx.core.acquire_input_surface(),
            Err(RecorderError::SurfaceAlreadyAcquired)
        ));
        assert!(matches!(fx.core.frame_sink(), Err(RecorderError::SurfaceAlreadyAcquired)));
    }

    #[test]
    fn frames_flow_to_the_muxer_and_end_with_eos() {
        let mut fx = fixture(VideoScript::default());
        fx.core.prepare().unwrap();
        fx.core.start().unwrap();

        let sink = fx.core.frame_sink().unwrap();
        for i in 0..10 {
            sink.submit(&frame(i)).unwrap();
        }
        fx.core.drain(true).unwrap();
        fx.core.stop().unwrap();
        assert_eq!(fx.core.state(), LifecycleState::Stopped);

        fx.gate.finalize();
        let validation = validate_container(&fx.log.lock()).unwrap();
        let video = validation.track(TrackKind::Video).unwrap();
        assert_eq!(video.samples, 10);
        assert!(video.ends_with_eos);
        assert!(video.key_frames >= 1);
        assert_eq!(fx.counters.lock().end_of_input, 1);
    }

    #[test]
    fn codec_config_and_status_noise_never_reach_the_muxer() {
        let mut fx = fixture(VideoScript {
            emit_codec_config: true,
            unexpected_status_at: Some(3),
            ..VideoScript::default()
        });
        fx.core.prepare().unwrap();
        fx.core.start().unwrap();

        let sink = fx.core.frame_sink().unwrap();
        for i in 0..10 {
            sink.submit(&frame(i)).unwrap();
        }
        fx.core.drain(true).unwrap();
        fx.core.stop().unwrap();
        fx.gate.finalize();

        let log = fx.log.lock();
        let validation = validate_container(&log).unwrap();
        let video = validation.track(TrackKind::Video).unwrap();
        assert_eq!(video.samples, 10);
        assert!(video.ends_with_eos);
        // The 5 byte SPS buffer was released without being written
        assert!(log.samples.iter().all(|s| s.size != 5));
        let counters = fx.counters.lock();
        assert_eq!(counters.buffers_released, counters.buffers_emitted + 1);
        assert!(fx.events.try_iter().next().is_none());
    }

    #[test]
    fn repeated_eos_request_is_ignored() {
        let mut fx = fixture(VideoScript::default());
        fx.core.prepare().unwrap();
        fx.core.start().unwrap();
        fx.core.drain(true).unwrap();
        fx.core.drain(true).unwrap();
        fx.core.stop().unwrap();
        assert_eq!(fx.counters.lock().end_of_input, 1);
    }

    #[test]
    fn start_before_prepare_is_rejected() {
        let mut fx = fixture(VideoScript::default());
        assert!(matches!(
            fx.core.start(),
            Err(RecorderError::InvalidState { operation: "start", .. })
        ));
    }

    #[test]
    fn failed_encoder_start_leaves_pipeline_prepared() {
        let mut fx = fixture(VideoScript {
            fail_start: true,
            ..VideoScript::default()
        });
        fx.core.prepare().unwrap();
        assert!(matches!(fx.core.start(), Err(RecorderError::Encoder(_))));
        assert_eq!(fx.core.state(), LifecycleState::Prepared);
        fx.core.release().unwrap();
        assert_eq!(fx.counters.lock().released, 1);
    }

    #[test]
    fn missing_buffer_faults_worker_but_stop_returns() {
        let mut fx = fixture(VideoScript {
            null_buffer_at: Some(2),
            ..VideoScript::default()
        });
        fx.core.prepare().unwrap();
        fx.core.start().unwrap();
        let sink = fx.core.frame_sink().unwrap();
        for i in 0..8 {
            sink.submit(&frame(i)).unwrap();
        }
        fx.core.drain(true).unwrap();
        fx.core.stop().unwrap();

        let fatal: Vec<_> = fx
            .events
            .try_iter()
            .filter(|e| matches!(e, crate::recording::RecorderEvent::Error { fatal: true, .. }))
            .collect();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fx.gate.stats().samples(TrackKind::Video), 2);
    }

    #[test]
    fn release_is_idempotent_and_releases_encoder_once() {
        let mut fx = fixture(VideoScript::default());
        fx.core.prepare().unwrap();
        fx.core.start().unwrap();
        fx.core.release().unwrap();
        fx.core.release().unwrap();
        assert_eq!(fx.core.state(), LifecycleState::Released);

        let counters = fx.counters.lock();
        assert_eq!(counters.released, 1);
        assert_eq!(counters.stopped, 1);
    }

    #[test]
    fn release_without_prepare_still_frees_encoder() {
        let mut fx = fixture(VideoScript::default());
        fx.core.release().unwrap();
        assert_eq!(fx.counters.lock().released, 1);
        assert!(fx.core.drain(false).is_err());
    }
}
