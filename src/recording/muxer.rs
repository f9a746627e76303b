//! Gate in front of the container writer
//!
//! The container writer can only accept samples once every track it will ever
//! carry has been added and the writer started. Tracks register lazily, when
//! their encoder reports its output format, and the two tracks are drained on
//! different threads. [`MuxerGate`] owns the writer and enforces:
//! - each track registers exactly once
//! - the writer starts exactly once, when the last expected track registers
//! - no sample reaches the writer before it started (callers block instead)
//! - writes from the video and audio workers never overlap

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::encoding::{EncodedSample, MediaFormat, TrackId, TrackKind};

/// Error type for muxing operations
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("Failed to open container: {0}")]
    Open(String),

    #[error("Track {0} is not part of this recording")]
    UnexpectedTrack(TrackKind),

    #[error("No registered track has id {0}")]
    UnknownTrack(TrackId),

    #[error("Muxer already released")]
    Released,

    #[error("Muxer never started: {0}")]
    NotStarted(String),

    #[error("Container writer failed to start: {0}")]
    StartFailed(String),

    #[error("Container writer error: {0}")]
    Writer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;

/// Container writer collaborator.
///
/// Implementations need not be reentrant; [`MuxerGate`] serializes every call.
/// Calling `write_sample` before `start` is undefined for real writers.
pub trait ContainerWriter: Send {
    fn add_track(&mut self, format: &MediaFormat) -> Result<TrackId>;

    fn start(&mut self) -> Result<()>;

    fn write_sample(&mut self, sample: &EncodedSample) -> Result<()>;

    /// Flush and close a started container
    fn finalize(&mut self) -> Result<()>;

    /// Close a container that never started. Writers that cannot represent an
    /// empty file should remove what they created.
    fn discard(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxerState {
    NotStarted,
    Started,
    /// The writer refused to start; terminal until finalize
    Failed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Unregistered,
    Registered(TrackId),
}

/// How the container was closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// The writer started and was finalized
    Finalized { samples_written: u64 },
    /// The writer never started (a track never reported its format); it was discarded
    Empty,
    /// The writer reported an error while closing
    Failed { reason: String },
}

/// Per-track write statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackStats {
    pub samples: u64,
    pub bytes: u64,
    pub first_timestamp_us: Option<u64>,
    pub last_timestamp_us: Option<u64>,
    /// Samples whose timestamp was lower than the previous one on the same track
    pub out_of_order: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MuxerStats {
    pub state: MuxerState,
    pub tracks: BTreeMap<TrackKind, TrackStats>,
}

impl MuxerStats {
    pub fn samples(&self, kind: TrackKind) -> u64 {
        self.tracks.get(&kind).map(|t| t.samples).unwrap_or(0)
    }

    pub fn total_samples(&self) -> u64 {
        self.tracks.values().map(|t| t.samples).sum()
    }
}

struct GateInner {
    writer: Box<dyn ContainerWriter>,
    state: MuxerState,
    tracks: BTreeMap<TrackKind, TrackState>,
    stats: BTreeMap<TrackKind, TrackStats>,
    /// Set when the gate will never start; wakes blocked writers with an error
    abandoned: bool,
    /// Why the writer failed to start
    failure: Option<String>,
    outcome: Option<FinalizeOutcome>,
}

impl GateInner {
    fn all_registered(&self) -> bool {
        self.tracks
            .values()
            .all(|t| matches!(t, TrackState::Registered(_)))
    }

    fn start_failure(&self) -> MuxError {
        MuxError::StartFailed(self.failure.clone().unwrap_or_default())
    }

    fn kind_of(&self, id: TrackId) -> Option<TrackKind> {
        self.tracks.iter().find_map(|(kind, state)| match state {
            TrackState::Registered(registered) if *registered == id => Some(*kind),
            _ => None,
        })
    }
}

/// Single authority over the container writer's state
pub struct MuxerGate {
    inner: Mutex<GateInner>,
    started: Condvar,
}

impl MuxerGate {
    /// Wrap `writer`, expecting one track of each kind in `expected`
    pub fn new(writer: Box<dyn ContainerWriter>, expected: &[TrackKind]) -> Self {
        let tracks = expected
            .iter()
            .map(|kind| (*kind, TrackState::Unregistered))
            .collect();
        let stats = expected
            .iter()
            .map(|kind| (*kind, TrackStats::default()))
            .collect();

        Self {
            inner: Mutex::new(GateInner {
                writer,
                state: MuxerState::NotStarted,
                tracks,
                stats,
                abandoned: false,
                failure: None,
                outcome: None,
            }),
            started: Condvar::new(),
        }
    }

    /// Register the track for `format.kind()` and start the writer once all
    /// expected tracks are present. Registering an already registered track
    /// returns its existing id.
    ///
    /// If the writer refuses to start, the gate fails for good: blocked
    /// writers wake with [`MuxError::StartFailed`] and the writer is never
    /// started again.
    pub fn register_track(&self, format: &MediaFormat) -> Result<TrackId> {
        let kind = format.kind();
        let mut inner = self.inner.lock();

        match inner.state {
            MuxerState::Released => return Err(MuxError::Released),
            MuxerState::Failed => return Err(inner.start_failure()),
            MuxerState::NotStarted | MuxerState::Started => {}
        }

        match inner.tracks.get(&kind) {
            None => return Err(MuxError::UnexpectedTrack(kind)),
            Some(TrackState::Registered(id)) => {
                log::warn!("[Muxer] {} track already registered as {}, ignoring", kind, id);
                return Ok(*id);
            }
            Some(TrackState::Unregistered) => {}
        }

        let id = inner.writer.add_track(format)?;
        inner.tracks.insert(kind, TrackState::Registered(id));
        log::info!("[Muxer] Registered {} track {}", kind, id);

        if inner.state == MuxerState::NotStarted && inner.all_registered() {
            if let Err(e) = inner.writer.start() {
                log::error!("[Muxer] Writer failed to start: {}", e);
                inner.state = MuxerState::Failed;
                inner.failure = Some(e.to_string());
                self.started.notify_all();
                return Err(inner.start_failure());
            }
            inner.state = MuxerState::Started;
            log::info!("[Muxer] All tracks registered, writer started");
            self.started.notify_all();
        }

        Ok(id)
    }

    /// Write a sample, blocking until the writer has started
    pub fn write_sample(&self, sample: &EncodedSample) -> Result<()> {
        let mut inner = self.inner.lock();

        loop {
            match inner.state {
                MuxerState::Started => break,
                MuxerState::Released => return Err(MuxError::Released),
                MuxerState::Failed => return Err(inner.start_failure()),
                MuxerState::NotStarted => {
                    if inner.abandoned {
                        return Err(MuxError::NotStarted(
                            "not every track reported its format".into(),
                        ));
                    }
                    self.started.wait(&mut inner);
                }
            }
        }

        let kind = inner
            .kind_of(sample.track_id)
            .ok_or(MuxError::UnknownTrack(sample.track_id))?;

        inner.writer.write_sample(sample)?;

        if let Some(stats) = inner.stats.get_mut(&kind) {
            if let Some(last) = stats.last_timestamp_us {
                if sample.timestamp_us < last {
                    stats.out_of_order += 1;
                }
            }
            stats.samples += 1;
            stats.bytes += sample.payload.len() as u64;
            stats.first_timestamp_us.get_or_insert(sample.timestamp_us);
            stats.last_timestamp_us = Some(sample.timestamp_us);
        }

        Ok(())
    }

    /// Give up on starting: writers blocked on (or arriving at) a gate that
    /// has not started get [`MuxError::NotStarted`]. No effect once started.
    pub fn abandon_start(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MuxerState::NotStarted && !inner.abandoned {
            log::debug!("[Muxer] Abandoning start, waiting writers will be released");
            inner.abandoned = true;
        }
        self.started.notify_all();
    }

    /// Close the container. Must only be called once every pipeline has stopped.
    /// Later calls return the first outcome.
    pub fn finalize(&self) -> FinalizeOutcome {
        let mut inner = self.inner.lock();

        if let Some(outcome) = &inner.outcome {
            return outcome.clone();
        }

        let outcome = match inner.state {
            MuxerState::Started => {
                let samples_written: u64 = inner.stats.values().map(|t| t.samples).sum();
                match inner.writer.finalize() {
                    Ok(()) => {
                        log::info!("[Muxer] Finalized container, {} samples", samples_written);
                        FinalizeOutcome::Finalized { samples_written }
                    }
                    Err(e) => {
                        log::error!("[Muxer] Failed to finalize container: {}", e);
                        FinalizeOutcome::Failed { reason: e.to_string() }
                    }
                }
            }
            MuxerState::Failed => {
                let reason = inner.failure.clone().unwrap_or_default();
                if let Err(e) = inner.writer.discard() {
                    log::warn!("[Muxer] Failed to discard container: {}", e);
                }
                FinalizeOutcome::Failed { reason }
            }
            MuxerState::NotStarted | MuxerState::Released => {
                log::warn!("[Muxer] Writer never started, discarding container");
                match inner.writer.discard() {
                    Ok(()) => FinalizeOutcome::Empty,
                    Err(e) => {
                        log::error!("[Muxer] Failed to discard container: {}", e);
                        FinalizeOutcome::Failed { reason: e.to_string() }
                    }
                }
            }
        };

        inner.state = MuxerState::Released;
        inner.outcome = Some(outcome.clone());
        self.started.notify_all();
        outcome
    }

    pub fn state(&self) -> MuxerState {
        self.inner.lock().state
    }

    pub fn track_state(&self, kind: TrackKind) -> Option<TrackState> {
        self.inner.lock().tracks.get(&kind).copied()
    }

    pub fn stats(&self) -> MuxerStats {
        let inner = self.inner.lock();
        MuxerStats {
            state: inner.state,
            tracks: inner.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{AudioCodec, SampleFlags, VideoCodec};
    use crate::test_harness::memory_writer::{MemoryContainerWriter, WriterCall};
    use std::sync::Arc;
    use std::time::Duration;

    fn video_format() -> MediaFormat {
        MediaFormat::video(VideoCodec::H264, 640, 480, 30, vec![0x01, 0x64])
    }

    fn audio_format() -> MediaFormat {
        MediaFormat::audio(AudioCodec::Aac, 44_100, 1, vec![0x12, 0x08])
    }

    fn sample(track_id: TrackId, timestamp_us: u64) -> EncodedSample {
        EncodedSample {
            track_id,
            timestamp_us,
            flags: SampleFlags::default(),
            payload: vec![0xAB; 16],
        }
    }

    #[test]
    fn starts_only_when_all_tracks_registered() {
        let (writer, log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video, TrackKind::Audio]);

        gate.register_track(&video_format()).unwrap();
        assert_eq!(gate.state(), MuxerState::NotStarted);
        assert!(!log.lock().started);

        gate.register_track(&audio_format()).unwrap();
        assert_eq!(gate.state(), MuxerState::Started);
        assert_eq!(log.lock().start_calls, 1);
    }

    #[test]
    fn repeated_registration_is_a_no_op() {
        let (writer, log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video]);

        let first = gate.register_track(&video_format()).unwrap();
        let second = gate.register_track(&video_format()).unwrap();
        assert_eq!(first, second);

        let log = log.lock();
        assert_eq!(log.tracks.len(), 1);
        assert_eq!(log.start_calls, 1);
    }

    #[test]
    fn unexpected_track_is_rejected() {
        let (writer, _log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video]);
        assert!(matches!(
            gate.register_track(&audio_format()),
            Err(MuxError::UnexpectedTrack(TrackKind::Audio))
        ));
    }

    #[test]
    fn writer_blocks_until_last_track_registers() {
        let (writer, log) = MemoryContainerWriter::new();
        let gate = Arc::new(MuxerGate::new(
            Box::new(writer),
            &[TrackKind::Video, TrackKind::Audio],
        ));
        let video_id = gate.register_track(&video_format()).unwrap();

        let blocked = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.write_sample(&sample(video_id, 10)))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());
        assert!(log.lock().samples.is_empty());

        gate.register_track(&audio_format()).unwrap();
        blocked.join().unwrap().unwrap();

        let log = log.lock();
        assert_eq!(log.samples.len(), 1);
        assert!(log.violations.is_empty());
        let start_pos = log.calls.iter().position(|c| matches!(c, WriterCall::Start)).unwrap();
        let write_pos = log.calls.iter().position(|c| matches!(c, WriterCall::Write { .. })).unwrap();
        assert!(start_pos < write_pos);
    }

    #[test]
    fn abandon_releases_blocked_writers() {
        let (writer, log) = MemoryContainerWriter::new();
        let gate = Arc::new(MuxerGate::new(
            Box::new(writer),
            &[TrackKind::Video, TrackKind::Audio],
        ));
        let video_id = gate.register_track(&video_format()).unwrap();

        let blocked = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.write_sample(&sample(video_id, 10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        gate.abandon_start();

        assert!(matches!(blocked.join().unwrap(), Err(MuxError::NotStarted(_))));
        assert!(log.lock().samples.is_empty());
    }

    #[test]
    fn abandon_after_start_changes_nothing() {
        let (writer, _log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video]);
        let id = gate.register_track(&video_format()).unwrap();
        gate.abandon_start();
        gate.write_sample(&sample(id, 0)).unwrap();
        assert_eq!(gate.stats().samples(TrackKind::Video), 1);
    }

    #[test]
    fn finalize_started_gate_is_idempotent() {
        let (writer, log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video]);
        let id = gate.register_track(&video_format()).unwrap();
        gate.write_sample(&sample(id, 0)).unwrap();
        gate.write_sample(&sample(id, 33_000)).unwrap();

        let first = gate.finalize();
        let second = gate.finalize();
        assert_eq!(first, FinalizeOutcome::Finalized { samples_written: 2 });
        assert_eq!(first, second);
        assert_eq!(gate.state(), MuxerState::Released);
        assert_eq!(log.lock().finalize_calls, 1);
    }

    #[test]
    fn finalize_without_tracks_discards() {
        let (writer, log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video]);

        assert_eq!(gate.finalize(), FinalizeOutcome::Empty);
        assert_eq!(gate.finalize(), FinalizeOutcome::Empty);

        let log = log.lock();
        assert_eq!(log.finalize_calls, 0);
        assert_eq!(log.discard_calls, 1);
    }

    #[test]
    fn released_gate_rejects_new_tracks_and_writes() {
        let (writer, _log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video, TrackKind::Audio]);
        let id = gate.register_track(&video_format()).unwrap();
        gate.finalize();

        assert!(matches!(gate.register_track(&audio_format()), Err(MuxError::Released)));
        assert!(matches!(gate.write_sample(&sample(id, 0)), Err(MuxError::Released)));
    }

    #[test]
    fn stats_track_order_per_track() {
        let (writer, _log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video]);
        let id = gate.register_track(&video_format()).unwrap();
        gate.write_sample(&sample(id, 100)).unwrap();
        gate.write_sample(&sample(id, 50)).unwrap();
        gate.write_sample(&sample(id, 200)).unwrap();

        let stats = gate.stats();
        let video = &stats.tracks[&TrackKind::Video];
        assert_eq!(video.samples, 3);
        assert_eq!(video.bytes, 48);
        assert_eq!(video.first_timestamp_us, Some(100));
        assert_eq!(video.last_timestamp_us, Some(200));
        assert_eq!(video.out_of_order, 1);
    }

    #[test]
    fn failed_writer_start_is_terminal() {
        let (writer, log) = MemoryContainerWriter::new();
        let gate = Arc::new(MuxerGate::new(
            Box::new(writer.failing_start()),
            &[TrackKind::Video, TrackKind::Audio],
        ));
        let video_id = gate.register_track(&video_format()).unwrap();

        let blocked = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.write_sample(&sample(video_id, 10)))
        };
        std::thread::sleep(Duration::from_millis(20));

        assert!(matches!(gate.register_track(&audio_format()), Err(MuxError::StartFailed(_))));
        assert_eq!(gate.state(), MuxerState::Failed);
        assert!(matches!(blocked.join().unwrap(), Err(MuxError::StartFailed(_))));

        // Neither a retry nor a later write reaches the writer
        assert!(matches!(gate.register_track(&audio_format()), Err(MuxError::StartFailed(_))));
        assert!(matches!(gate.write_sample(&sample(video_id, 20)), Err(MuxError::StartFailed(_))));
        assert_eq!(log.lock().start_calls, 1);
        assert!(log.lock().samples.is_empty());

        assert!(matches!(gate.finalize(), FinalizeOutcome::Failed { .. }));
        let log = log.lock();
        assert_eq!(log.finalize_calls, 0);
        assert_eq!(log.discard_calls, 1);
    }

    #[test]
    fn unknown_track_id_is_rejected() {
        let (writer, _log) = MemoryContainerWriter::new();
        let gate = MuxerGate::new(Box::new(writer), &[TrackKind::Video]);
        gate.register_track(&video_format()).unwrap();
        assert!(matches!(
            gate.write_sample(&sample(TrackId(99), 0)),
            Err(MuxError::UnknownTrack(TrackId(99)))
        ));
    }
}
