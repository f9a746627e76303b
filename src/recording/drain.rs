//! Encoder drain loop shared by the video and audio pipelines
//!
//! One call to [`drain_encoder`] is one drain cycle: poll the encoder's output
//! side with a bounded wait until it has nothing more to give (or, for an
//! end-of-stream drain, until it reports end of stream). Format events register
//! the track with the [`MuxerGate`]; data buffers are re-stamped with the shared
//! [`PtsClock`] and written through the gate.

use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DrainConfig;
use crate::encoding::{
    EncodedSample, EncoderError, EncoderOutput, OutputEvent, SampleFlags, TrackId, TrackKind,
};

use super::clock::PtsClock;
use super::controller::RecorderEvent;
use super::muxer::{MuxError, MuxerGate};

/// Error type for a drain cycle
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("Encoder reported output buffer {index} ready but returned no data")]
    MissingBuffer { index: usize },

    #[error("Encoder did not reach end of stream within {waited:?}")]
    EosTimeout { waited: Duration },

    /// The track cannot register or the container will never accept samples
    #[error("Muxer unavailable: {0}")]
    Muxer(#[from] MuxError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),
}

impl DrainError {
    /// Whether the pipeline can keep draining after this error
    pub fn is_fatal(&self) -> bool {
        // Without a track nothing the encoder produces can ever be written
        matches!(
            self,
            DrainError::MissingBuffer { .. } | DrainError::EosTimeout { .. } | DrainError::Muxer(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DrainError>;

/// Timing of a drain cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainOptions {
    /// Bounded wait of a single poll
    pub poll_timeout: Duration,
    /// Deadline of an end-of-stream drain; `None` waits for the encoder indefinitely
    pub eos_timeout: Option<Duration>,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self::from(&DrainConfig::default())
    }
}

impl From<&DrainConfig> for DrainOptions {
    fn from(config: &DrainConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            eos_timeout: config.eos_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// How a drain cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The encoder had no more output for now
    Drained,
    /// The encoder emitted its end-of-stream buffer
    EndOfStream,
}

/// Where one encoder's output goes: its track in the shared muxer
pub struct TrackOutput {
    kind: TrackKind,
    track_id: Option<TrackId>,
    gate: Arc<MuxerGate>,
    clock: Arc<PtsClock>,
    events: Sender<RecorderEvent>,
    samples_written: u64,
    write_failures: u64,
    unregistered_drops: u64,
}

impl TrackOutput {
    pub fn new(
        kind: TrackKind,
        gate: Arc<MuxerGate>,
        clock: Arc<PtsClock>,
        events: Sender<RecorderEvent>,
    ) -> Self {
        Self {
            kind,
            track_id: None,
            gate,
            clock,
            events,
            samples_written: 0,
            write_failures: 0,
            unregistered_drops: 0,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn track_id(&self) -> Option<TrackId> {
        self.track_id
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    /// Data buffers the encoder produced before reporting its format
    pub fn unregistered_drops(&self) -> u64 {
        self.unregistered_drops
    }

    pub fn clock(&self) -> &PtsClock {
        &self.clock
    }

    /// Report a problem on the controller's event channel
    pub fn report(&self, error: String, fatal: bool) {
        let _ = self.events.send(RecorderEvent::Error {
            pipeline: self.kind,
            error,
            fatal,
        });
    }

    /// Write one sample. Only a writer that failed to start is an error; other
    /// write failures are counted and reported once.
    fn write(&mut self, payload: Vec<u8>, flags: SampleFlags) -> Result<()> {
        let Some(track_id) = self.track_id else {
            self.unregistered_drops += 1;
            if self.unregistered_drops == 1 {
                log::warn!(
                    "[{}] Dropping {} byte sample, track not registered yet",
                    self.kind,
                    payload.len()
                );
                self.report("encoder produced data before its format".into(), false);
            } else {
                log::trace!("[{}] Dropping {} byte sample before format", self.kind, payload.len());
            }
            return Ok(());
        };

        let sample = EncodedSample {
            track_id,
            timestamp_us: self.clock.pts_us(),
            flags,
            payload,
        };

        match self.gate.write_sample(&sample) {
            Err(e @ MuxError::StartFailed(_)) => return Err(e.into()),
            Ok(()) => {
                self.samples_written += 1;
                log::trace!(
                    "[{}] Wrote {} bytes at {}us",
                    self.kind,
                    sample.payload.len(),
                    sample.timestamp_us
                );
            }
            Err(e) => {
                self.write_failures += 1;
                // Report the first failure only, the rest usually share its cause
                if self.write_failures == 1 {
                    log::warn!("[{}] Failed to write sample: {}", self.kind, e);
                    self.report(format!("write failed: {}", e), false);
                } else {
                    log::debug!("[{}] Failed to write sample: {}", self.kind, e);
                }
            }
        }
        Ok(())
    }
}

/// Run one drain cycle.
///
/// With `end_of_stream` the caller must already have closed the encoder's
/// input; the loop then keeps polling until the end-of-stream buffer arrives
/// or `options.eos_timeout` elapses.
pub fn drain_encoder(
    encoder: &mut dyn EncoderOutput,
    track: &mut TrackOutput,
    end_of_stream: bool,
    options: &DrainOptions,
) -> Result<DrainOutcome> {
    let started = Instant::now();
    let deadline = if end_of_stream {
        options.eos_timeout.map(|timeout| started + timeout)
    } else {
        None
    };

    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(DrainError::EosTimeout {
                    waited: started.elapsed(),
                });
            }
        }

        match encoder.dequeue_output(options.poll_timeout)? {
            OutputEvent::TryAgainLater => {
                if !end_of_stream {
                    return Ok(DrainOutcome::Drained);
                }
                log::trace!("[{}] No output available, waiting for end of stream", track.kind);
            }
            OutputEvent::BuffersChanged => {
                log::debug!("[{}] Encoder output buffers changed", track.kind);
            }
            OutputEvent::FormatChanged(format) => {
                if let Some(id) = track.track_id {
                    log::warn!("[{}] Format changed twice, keeping track {}", track.kind, id);
                    continue;
                }
                if format.kind() != track.kind {
                    log::error!(
                        "[{}] Encoder reported a {} format, ignoring",
                        track.kind,
                        format.kind()
                    );
                    track.report(format!("encoder reported a {} format", format.kind()), false);
                    continue;
                }
                log::info!("[{}] Encoder output format ready: {:?}", track.kind, format.params);
                match track.gate.register_track(&format) {
                    Ok(id) => track.track_id = Some(id),
                    Err(e) => {
                        log::error!("[{}] Failed to register track: {}", track.kind, e);
                        return Err(e.into());
                    }
                }
            }
            OutputEvent::Unexpected(status) => {
                log::warn!("[{}] Unexpected encoder status {}", track.kind, status);
            }
            OutputEvent::Buffer(buffer) => {
                let index = buffer.index;
                let Some(data) = buffer.data else {
                    return Err(DrainError::MissingBuffer { index });
                };

                let written = if buffer.flags.codec_config {
                    // Already delivered through the format event
                    log::trace!("[{}] Skipping {} byte codec config buffer", track.kind, data.len());
                    Ok(())
                } else if data.is_empty() {
                    Ok(())
                } else {
                    track.write(
                        data,
                        SampleFlags {
                            config: false,
                            end_of_stream: buffer.flags.end_of_stream,
                            key_frame: buffer.flags.key_frame,
                        },
                    )
                };

                encoder.release_output(index);
                written?;

                if buffer.flags.end_of_stream {
                    if end_of_stream {
                        log::debug!("[{}] End of stream reached", track.kind);
                    } else {
                        log::warn!("[{}] Reached end of stream unexpectedly", track.kind);
                    }
                    return Ok(DrainOutcome::EndOfStream);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{BufferFlags, MediaFormat, OutputBuffer, VideoCodec};
    use crate::test_harness::memory_writer::MemoryContainerWriter;
    use std::collections::VecDeque;

    /// Encoder output that replays a fixed script, then reports no data
    struct ScriptedOutput {
        script: VecDeque<OutputEvent>,
        released: Vec<usize>,
    }

    impl ScriptedOutput {
        fn new(script: Vec<OutputEvent>) -> Self {
            Self {
                script: script.into(),
                released: Vec::new(),
            }
        }
    }

    impl EncoderOutput for ScriptedOutput {
        fn dequeue_output(&mut self, _timeout: Duration) -> crate::encoding::encoder::Result<OutputEvent> {
            Ok(self.script.pop_front().unwrap_or(OutputEvent::TryAgainLater))
        }

        fn release_output(&mut self, index: usize) {
            self.released.push(index);
        }
    }

    fn format() -> OutputEvent {
        OutputEvent::FormatChanged(MediaFormat::video(VideoCodec::H264, 320, 240, 30, vec![1]))
    }

    fn buffer(index: usize, flags: BufferFlags) -> OutputEvent {
        OutputEvent::Buffer(OutputBuffer {
            index,
            data: Some(vec![index as u8; 8]),
            flags,
            presentation_time_us: index as i64 * 1_000,
        })
    }

    fn track() -> (TrackOutput, Arc<MuxerGate>, crossbeam_channel::Receiver<RecorderEvent>) {
        let (writer, _log) = MemoryContainerWriter::new();
        let gate = Arc::new(MuxerGate::new(Box::new(writer), &[TrackKind::Video]));
        let (tx, rx) = crossbeam_channel::unbounded();
        let output = TrackOutput::new(TrackKind::Video, gate.clone(), Arc::new(PtsClock::new()), tx);
        (output, gate, rx)
    }

    fn options() -> DrainOptions {
        DrainOptions {
            poll_timeout: Duration::from_millis(1),
            eos_timeout: Some(Duration::from_millis(100)),
        }
    }

    #[test]
    fn format_then_data_is_written() {
        let (mut track, gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            format(),
            buffer(0, BufferFlags { key_frame: true, ..Default::default() }),
            buffer(1, BufferFlags::default()),
        ]);

        let outcome = drain_encoder(&mut encoder, &mut track, false, &options()).unwrap();
        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(track.samples_written(), 2);
        assert_eq!(gate.stats().samples(TrackKind::Video), 2);
        assert_eq!(encoder.released, vec![0, 1]);
    }

    #[test]
    fn codec_config_buffer_is_released_but_not_written() {
        let (mut track, gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            format(),
            buffer(0, BufferFlags { codec_config: true, ..Default::default() }),
            buffer(1, BufferFlags::default()),
        ]);

        drain_encoder(&mut encoder, &mut track, false, &options()).unwrap();
        assert_eq!(gate.stats().samples(TrackKind::Video), 1);
        assert_eq!(encoder.released, vec![0, 1]);
    }

    #[test]
    fn data_before_format_is_dropped_and_reported_once() {
        let (mut track, gate, rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            buffer(0, BufferFlags::default()),
            buffer(1, BufferFlags::default()),
            buffer(2, BufferFlags::default()),
        ]);

        drain_encoder(&mut encoder, &mut track, false, &options()).unwrap();
        assert_eq!(track.track_id(), None);
        assert_eq!(track.samples_written(), 0);
        assert_eq!(track.unregistered_drops(), 3);
        assert_eq!(encoder.released, vec![0, 1, 2]);
        assert_eq!(gate.stats().total_samples(), 0);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RecorderEvent::Error { fatal: false, .. }));
    }

    #[test]
    fn failed_registration_ends_the_cycle_fatally() {
        let (writer, _log) = MemoryContainerWriter::new();
        let gate = Arc::new(MuxerGate::new(Box::new(writer.failing_start()), &[TrackKind::Video]));
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut track = TrackOutput::new(TrackKind::Video, gate, Arc::new(PtsClock::new()), tx);
        let mut encoder = ScriptedOutput::new(vec![format(), buffer(0, BufferFlags::default())]);

        let err = drain_encoder(&mut encoder, &mut track, false, &options()).unwrap_err();
        assert!(matches!(err, DrainError::Muxer(MuxError::StartFailed(_))));
        assert!(err.is_fatal());
        assert_eq!(track.track_id(), None);
        // The buffer behind the format is left for nobody to write
        assert!(encoder.released.is_empty());
    }

    #[test]
    fn second_format_event_is_ignored() {
        let (mut track, _gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![format(), format()]);
        drain_encoder(&mut encoder, &mut track, false, &options()).unwrap();
        assert_eq!(track.track_id(), Some(TrackId(0)));
    }

    #[test]
    fn status_noise_does_not_end_the_cycle() {
        let (mut track, _gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            OutputEvent::BuffersChanged,
            OutputEvent::Unexpected(-42),
            format(),
            buffer(3, BufferFlags::default()),
        ]);
        drain_encoder(&mut encoder, &mut track, false, &options()).unwrap();
        assert_eq!(track.samples_written(), 1);
    }

    #[test]
    fn missing_buffer_is_fatal() {
        let (mut track, _gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            format(),
            OutputEvent::Buffer(OutputBuffer {
                index: 7,
                data: None,
                flags: BufferFlags::default(),
                presentation_time_us: 0,
            }),
        ]);

        let err = drain_encoder(&mut encoder, &mut track, false, &options()).unwrap_err();
        assert!(matches!(err, DrainError::MissingBuffer { index: 7 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn eos_drain_waits_through_empty_polls() {
        let (mut track, _gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            format(),
            OutputEvent::TryAgainLater,
            OutputEvent::TryAgainLater,
            buffer(0, BufferFlags { end_of_stream: true, ..Default::default() }),
        ]);

        let outcome = drain_encoder(&mut encoder, &mut track, true, &options()).unwrap();
        assert_eq!(outcome, DrainOutcome::EndOfStream);
        assert_eq!(track.samples_written(), 1);
    }

    #[test]
    fn unrequested_eos_ends_the_cycle() {
        let (mut track, _gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            format(),
            buffer(0, BufferFlags { end_of_stream: true, ..Default::default() }),
            buffer(1, BufferFlags::default()),
        ]);

        let outcome = drain_encoder(&mut encoder, &mut track, false, &options()).unwrap();
        assert_eq!(outcome, DrainOutcome::EndOfStream);
        assert_eq!(encoder.script.len(), 1);
    }

    #[test]
    fn eos_drain_gives_up_at_deadline() {
        let (mut track, _gate, _rx) = track();
        let mut encoder = ScriptedOutput::new(vec![format()]);

        let err = drain_encoder(&mut encoder, &mut track, true, &options()).unwrap_err();
        assert!(matches!(err, DrainError::EosTimeout { .. }));
    }

    #[test]
    fn write_failure_is_reported_once() {
        let (mut track, gate, rx) = track();
        let mut encoder = ScriptedOutput::new(vec![
            format(),
            buffer(0, BufferFlags::default()),
            buffer(1, BufferFlags::default()),
        ]);
        // Registration succeeds, then the gate is closed under the worker
        let mut registration = ScriptedOutput::new(vec![format()]);
        drain_encoder(&mut registration, &mut track, false, &options()).unwrap();
        gate.finalize();

        drain_encoder(&mut encoder, &mut track, false, &options()).unwrap();
        assert_eq!(track.write_failures(), 2);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RecorderEvent::Error { pipeline: TrackKind::Video, fatal: false, .. }
        ));
    }
}
