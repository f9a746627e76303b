//! Audio capture pipeline
//!
//! A worker thread reads PCM from the capture source, queues it to the audio
//! encoder stamped with the shared clock, and drains the encoder into the
//! shared muxer after every chunk. It follows the same register-once,
//! write-many protocol as the video pipeline.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::AudioConfig;
use crate::encoding::{AudioEncoder, EncoderError, PcmSource, TrackKind};

use super::controller::RecorderError;
use super::drain::{drain_encoder, DrainOutcome, TrackOutput};
use super::{advance, Lifecycle, LifecycleState, PipelineContext, QUIESCENCE_POLL};

type Result<T> = std::result::Result<T, RecorderError>;

enum AudioCommand {
    Start {
        reply: Sender<std::result::Result<(), EncoderError>>,
    },
    Stop,
    Shutdown,
}

/// Non-blocking stop request for the audio worker.
///
/// Used by the video pipeline when its end-of-stream drain begins.
#[derive(Clone)]
pub struct AudioStopHandle {
    commands: Sender<AudioCommand>,
}

impl AudioStopHandle {
    pub fn request_stop(&self) {
        if self.commands.send(AudioCommand::Stop).is_err() {
            log::debug!("[Audio] Stop requested after worker exit");
        }
    }
}

/// Capture source, encoder and the worker that moves data between them
pub struct AudioCaptureEncoder {
    config: AudioConfig,
    ctx: PipelineContext,
    state: LifecycleState,
    parts: Option<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)>,
    commands: Sender<AudioCommand>,
    command_receiver: Option<Receiver<AudioCommand>>,
    worker: Option<JoinHandle<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)>>,
}

/// State owned by the audio worker thread
struct AudioWorker {
    source: Box<dyn PcmSource>,
    encoder: Box<dyn AudioEncoder>,
    track: TrackOutput,
    ctx: PipelineContext,
    read_timeout: Duration,
    capturing: bool,
    faulted: bool,
    read_failures: u64,
}

impl AudioCaptureEncoder {
    pub fn new(
        source: Box<dyn PcmSource>,
        encoder: Box<dyn AudioEncoder>,
        config: &AudioConfig,
        ctx: PipelineContext,
    ) -> Self {
        let (commands, command_receiver) = crossbeam_channel::unbounded();
        Self {
            config: config.clone(),
            ctx,
            state: LifecycleState::Created,
            parts: Some((source, encoder)),
            commands,
            command_receiver: Some(command_receiver),
            worker: None,
        }
    }

    pub fn stop_handle(&self) -> AudioStopHandle {
        AudioStopHandle {
            commands: self.commands.clone(),
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub(crate) fn worker_gone(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    pub(crate) fn begin_stop(&mut self) -> Result<bool> {
        match self.state {
            LifecycleState::Created | LifecycleState::Failed => return Ok(false),
            _ => advance(&mut self.state, LifecycleState::Stopping, "stop")?,
        }
        if self.commands.send(AudioCommand::Stop).is_err() {
            log::warn!("[Audio] Worker already gone, treating as stopped");
            self.ctx.quiescence.mark_stopped(TrackKind::Audio);
        }
        Ok(true)
    }

    pub(crate) fn finish_stop(&mut self) -> Result<()> {
        advance(&mut self.state, LifecycleState::Stopped, "stop")
    }
}

impl AudioWorker {
    fn run(mut self, commands: Receiver<AudioCommand>) -> (Box<dyn PcmSource>, Box<dyn AudioEncoder>) {
        loop {
            let command = if self.capturing {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            match command {
                Some(AudioCommand::Start { reply }) => {
                    let _ = reply.send(self.start());
                }
                Some(AudioCommand::Stop) => {
                    if self.capturing {
                        self.stop_capture();
                    }
                    self.ctx.quiescence.mark_stopped(TrackKind::Audio);
                }
                Some(AudioCommand::Shutdown) => break,
                None => self.capture_cycle(),
            }
        }

        if self.capturing {
            self.stop_capture();
        }
        self.ctx.quiescence.mark_stopped(TrackKind::Audio);
        (self.source, self.encoder)
    }

    fn start(&mut self) -> std::result::Result<(), EncoderError> {
        if self.capturing {
            return Ok(());
        }
        self.encoder.start()?;
        if let Err(e) = self.source.start() {
            let _ = self.encoder.stop();
            return Err(e);
        }
        self.capturing = true;
        log::info!("[Audio] Capture started");
        Ok(())
    }

    /// Read one chunk, encode it, and drain whatever the encoder has ready
    fn capture_cycle(&mut self) {
        match self.source.read(self.read_timeout) {
            Ok(Some(chunk)) => {
                self.read_failures = 0;
                let pts_us = self.ctx.clock.pts_us();
                if let Err(e) = self.encoder.queue_input(&chunk.samples, pts_us, false) {
                    log::warn!("[Audio] Failed to queue {} samples: {}", chunk.samples.len(), e);
                    self.track.report(format!("queue input failed: {}", e), false);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.read_failures += 1;
                if self.read_failures == 1 {
                    log::warn!("[Audio] Capture read failed: {}", e);
                    self.track.report(format!("capture read failed: {}", e), false);
                }
                std::thread::sleep(self.read_timeout);
                return;
            }
        }

        match drain_encoder(self.encoder.as_mut(), &mut self.track, false, &self.ctx.drain) {
            Ok(DrainOutcome::Drained) => {}
            Ok(DrainOutcome::EndOfStream) => {
                // Encoder closed on its own; nothing more will come out of it
                self.shut_down_capture();
            }
            Err(e) if e.is_fatal() => {
                log::error!("[Audio] Drain failed, worker faulted: {}", e);
                self.track.report(e.to_string(), true);
                self.faulted = true;
                self.shut_down_capture();
            }
            Err(e) => {
                log::warn!("[Audio] Drain error: {}", e);
                self.track.report(e.to_string(), false);
            }
        }
    }

    /// Close the encoder input and drain it to end of stream
    fn stop_capture(&mut self) {
        log::info!("[Audio] Stopping capture");
        if let Err(e) = self.source.stop() {
            log::warn!("[Audio] Failed to stop capture source: {}", e);
        }

        if !self.faulted {
            let pts_us = self.ctx.clock.pts_us();
            match self.encoder.queue_input(&[], pts_us, true) {
                Ok(()) => {
                    if let Err(e) = drain_encoder(self.encoder.as_mut(), &mut self.track, true, &self.ctx.drain) {
                        log::error!("[Audio] End of stream drain failed: {}", e);
                        self.track.report(e.to_string(), e.is_fatal());
                    }
                }
                Err(e) => log::warn!("[Audio] Failed to queue end of stream: {}", e),
            }
        }

        if let Err(e) = self.encoder.stop() {
            log::warn!("[Audio] Failed to stop encoder: {}", e);
        }
        self.capturing = false;
        log::info!(
            "[Audio] Stopped after {} samples ({} failed writes)",
            self.track.samples_written(),
            self.track.write_failures()
        );
    }

    fn shut_down_capture(&mut self) {
        if let Err(e) = self.source.stop() {
            log::warn!("[Audio] Failed to stop capture source: {}", e);
        }
        if let Err(e) = self.encoder.stop() {
            log::warn!("[Audio] Failed to stop encoder: {}", e);
        }
        self.capturing = false;
    }
}

impl Lifecycle for AudioCaptureEncoder {
    type Error = RecorderError;

    fn prepare(&mut self) -> Result<()> {
        advance(&mut self.state, LifecycleState::Prepared, "prepare")?;

        let (Some((source, encoder)), Some(commands)) = (self.parts.take(), self.command_receiver.take()) else {
            self.state = LifecycleState::Failed;
            return Err(RecorderError::WorkerGone(TrackKind::Audio));
        };
        let worker = AudioWorker {
            source,
            encoder,
            track: TrackOutput::new(
                TrackKind::Audio,
                self.ctx.gate.clone(),
                self.ctx.clock.clone(),
                self.ctx.events.clone(),
            ),
            ctx: self.ctx.clone(),
            read_timeout: self.config.read_timeout(),
            capturing: false,
            faulted: false,
            read_failures: 0,
        };

        let handle = std::thread::Builder::new()
            .name("mediarecorder-audio".into())
            .spawn(move || worker.run(commands))
            .map_err(|e| {
                self.state = LifecycleState::Failed;
                RecorderError::Spawn(e)
            })?;
        self.worker = Some(handle);

        log::debug!(
            "[Audio] Worker spawned ({} Hz, {} ch, {})",
            self.config.sample_rate,
            self.config.channels,
            self.config.codec.display_name()
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Prepared {
            return Err(RecorderError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.ctx.quiescence.mark_running(TrackKind::Audio);
        let (reply, result) = crossbeam_channel::bounded(1);
        let started = self
            .commands
            .send(AudioCommand::Start { reply })
            .ok()
            .and_then(|_| result.recv().ok());

        match started {
            Some(Ok(())) => advance(&mut self.state, LifecycleState::Started, "start"),
            Some(Err(e)) => {
                self.ctx.quiescence.mark_stopped(TrackKind::Audio);
                Err(e.into())
            }
            None => {
                self.ctx.quiescence.mark_stopped(TrackKind::Audio);
                Err(RecorderError::WorkerGone(TrackKind::Audio))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if !self.begin_stop()? {
            return Ok(());
        }
        let worker = &self.worker;
        self.ctx.quiescence.wait_stopped(&[TrackKind::Audio], QUIESCENCE_POLL, |_| {
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
            let _ = self.commands.send(AudioCommand::Shutdown);
            match worker.join() {
                Ok(parts) => self.parts = Some(parts),
                Err(_) => log::error!("[Audio] Worker panicked, encoder cannot be released"),
            }
        }

        if let Some((_source, mut encoder)) = self.parts.take() {
            encoder.release();
        }
        self.state = LifecycleState::Released;
        log::info!("[Audio] Released");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state
    }
}

impl Drop for AudioCaptureEncoder {
    fn drop(&mut self) {
        if self.state != LifecycleState::Released {
            if let Err(e) = self.release() {
                log::warn!("[Audio] Release on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::clock::PtsClock;
    use crate::recording::drain::DrainOptions;
    use crate::recording::muxer::MuxerGate;
    use crate::recording::{Quiescence, RecorderEvent};
    use crate::test_harness::fake_encoder::{
        AudioScript, FakeAudioEncoder, FakePcmSource, SharedCounters,
    };
    use crate::test_harness::memory_writer::{MemoryContainerWriter, SharedWriterLog};
    use crate::test_harness::validators::validate_container;
    use std::sync::Arc;

    struct Fixture {
        audio: AudioCaptureEncoder,
        encoder: SharedCounters,
        source: SharedCounters,
        log: SharedWriterLog,
        gate: Arc<MuxerGate>,
        events: Receiver<RecorderEvent>,
    }

    fn fixture(expected: &[TrackKind], script: AudioScript) -> Fixture {
        let config = AudioConfig::default();
        let encoder = SharedCounters::default();
        let source = SharedCounters::default();
        let (writer, log) = MemoryContainerWriter::new();
        let gate = Arc::new(MuxerGate::new(Box::new(writer), expected));
        let (events_tx, events) = crossbeam_channel::unbounded();
        let ctx = PipelineContext {
            gate: gate.clone(),
            clock: Arc::new(PtsClock::new()),
            quiescence: Arc::new(Quiescence::new(&[TrackKind::Audio])),
            events: events_tx,
            drain: DrainOptions {
                poll_timeout: Duration::from_millis(1),
                eos_timeout: Some(Duration::from_millis(200)),
            },
        };
        let audio = AudioCaptureEncoder::new(
            Box::new(FakePcmSource::new(&config, script.clone(), source.clone())),
            Box::new(FakeAudioEncoder::new(&config, script, encoder.clone())),
            &config,
            ctx,
        );
        Fixture { audio, encoder, source, log, gate, events }
    }

    #[test]
    fn captures_until_stopped_and_ends_with_eos() {
        let mut fx = fixture(&[TrackKind::Audio], AudioScript::default());
        fx.audio.prepare().unwrap();
        fx.audio.start().unwrap();
        std::thread::sleep(Duration::from_millis(120));
        fx.audio.stop().unwrap();
        assert_eq!(fx.audio.state(), LifecycleState::Stopped);

        fx.gate.finalize();
        let validation = validate_container(&fx.log.lock()).unwrap();
        let track = validation.track(TrackKind::Audio).unwrap();
        assert!(track.samples >= 3, "only {} samples", track.samples);
        assert!(track.ends_with_eos);

        let encoder = fx.encoder.lock();
        assert_eq!(encoder.end_of_input, 1);
        assert_eq!(encoder.stopped, 1);
        assert_eq!(fx.source.lock().stopped, 1);
    }

    #[test]
    fn stop_handle_stops_capture_without_blocking() {
        let mut fx = fixture(&[TrackKind::Audio], AudioScript::default());
        fx.audio.prepare().unwrap();
        fx.audio.start().unwrap();
        std::thread::sleep(Duration::from_millis(40));

        fx.audio.stop_handle().request_stop();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fx.source.lock().stopped == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fx.source.lock().stopped, 1);

        // The controller's own stop afterwards is harmless
        fx.audio.stop().unwrap();
        assert_eq!(fx.encoder.lock().stopped, 1);
    }

    #[test]
    fn stop_unblocks_when_partner_track_never_registers() {
        let mut fx = fixture(&[TrackKind::Video, TrackKind::Audio], AudioScript::default());
        fx.audio.prepare().unwrap();
        fx.audio.start().unwrap();
        std::thread::sleep(Duration::from_millis(40));

        // The worker is now blocked writing into a gate waiting for video
        fx.gate.abandon_start();
        fx.audio.stop().unwrap();
        assert!(fx.log.lock().samples.is_empty());

        let reported: Vec<_> = fx.events.try_iter().collect();
        assert!(reported
            .iter()
            .any(|e| matches!(e, RecorderEvent::Error { pipeline: TrackKind::Audio, fatal: false, .. })));
    }

    #[test]
    fn source_start_failure_is_returned() {
        let mut fx = fixture(
            &[TrackKind::Audio],
            AudioScript {
                fail_source_start: true,
                ..AudioScript::default()
            },
        );
        fx.audio.prepare().unwrap();
        assert!(matches!(fx.audio.start(), Err(RecorderError::Encoder(EncoderError::Capture(_)))));
        fx.audio.release().unwrap();
        assert_eq!(fx.encoder.lock().released, 1);
    }

    #[test]
    fn release_from_started_releases_once() {
        let mut fx = fixture(&[TrackKind::Audio], AudioScript::default());
        fx.audio.prepare().unwrap();
        fx.audio.start().unwrap();
        fx.audio.release().unwrap();
        fx.audio.release().unwrap();
        assert_eq!(fx.audio.state(), LifecycleState::Released);
        assert_eq!(fx.encoder.lock().released, 1);
    }
}
