// In-memory container writer that records every call it receives

use parking_lot::Mutex;
use std::sync::Arc;

use crate::encoding::{EncodedSample, MediaFormat, SampleFlags, TrackId};
use crate::recording::muxer::{ContainerWriter, MuxError, Result};

/// One call made on the writer, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum WriterCall {
    AddTrack(TrackId),
    Start,
    Write { track_id: TrackId, timestamp_us: u64 },
    Finalize,
    Discard,
}

/// A sample as it reached the writer
#[derive(Debug, Clone)]
pub struct RecordedSample {
    pub track_id: TrackId,
    pub timestamp_us: u64,
    pub flags: SampleFlags,
    pub size: usize,
}

/// Everything the writer observed
#[derive(Debug, Default)]
pub struct WriterLog {
    pub tracks: Vec<(TrackId, MediaFormat)>,
    pub started: bool,
    pub start_calls: u32,
    pub finalize_calls: u32,
    pub discard_calls: u32,
    pub samples: Vec<RecordedSample>,
    pub calls: Vec<WriterCall>,
    /// Contract breaches such as a write before start
    pub violations: Vec<String>,
}

impl WriterLog {
    pub fn samples_for(&self, track_id: TrackId) -> Vec<&RecordedSample> {
        self.samples.iter().filter(|s| s.track_id == track_id).collect()
    }

    pub fn track_of_kind(&self, kind: crate::encoding::TrackKind) -> Option<TrackId> {
        self.tracks
            .iter()
            .find(|(_, format)| format.kind() == kind)
            .map(|(id, _)| *id)
    }
}

pub type SharedWriterLog = Arc<Mutex<WriterLog>>;

/// Container writer that keeps sample metadata in memory.
///
/// It behaves like a strict real writer: writes before `start` and tracks
/// added after `start` are rejected and logged as violations.
pub struct MemoryContainerWriter {
    log: SharedWriterLog,
    next_track: u32,
    fail_start: bool,
}

impl MemoryContainerWriter {
    pub fn new() -> (Self, SharedWriterLog) {
        Self::with_log(Arc::new(Mutex::new(WriterLog::default())))
    }

    pub fn with_log(log: SharedWriterLog) -> (Self, SharedWriterLog) {
        (
            Self {
                log: log.clone(),
                next_track: 0,
                fail_start: false,
            },
            log,
        )
    }

    /// Make `start` fail, as a writer whose output went away would
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

impl ContainerWriter for MemoryContainerWriter {
    fn add_track(&mut self, format: &MediaFormat) -> Result<TrackId> {
        let mut log = self.log.lock();
        if log.started {
            log.violations.push("add_track after start".into());
            return Err(MuxError::Writer("cannot add a track after start".into()));
        }
        let id = TrackId(self.next_track);
        self.next_track += 1;
        log.tracks.push((id, format.clone()));
        log.calls.push(WriterCall::AddTrack(id));
        Ok(id)
    }

    fn start(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        log.start_calls += 1;
        if self.fail_start {
            return Err(MuxError::Writer("output closed".into()));
        }
        if log.tracks.is_empty() {
            log.violations.push("start with zero tracks".into());
        }
        log.started = true;
        log.calls.push(WriterCall::Start);
        Ok(())
    }

    fn write_sample(&mut self, sample: &EncodedSample) -> Result<()> {
        let mut log = self.log.lock();
        if !log.started {
            log.violations.push(format!(
                "write to track {} before start",
                sample.track_id
            ));
            return Err(MuxError::Writer("write before start".into()));
        }
        if !log.tracks.iter().any(|(id, _)| *id == sample.track_id) {
            log.violations.push(format!("write to unknown track {}", sample.track_id));
            return Err(MuxError::UnknownTrack(sample.track_id));
        }
        log.samples.push(RecordedSample {
            track_id: sample.track_id,
            timestamp_us: sample.timestamp_us,
            flags: sample.flags,
            size: sample.payload.len(),
        });
        log.calls.push(WriterCall::Write {
            track_id: sample.track_id,
            timestamp_us: sample.timestamp_us,
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        if !log.started {
            log.violations.push("finalize before start".into());
        }
        log.finalize_calls += 1;
        log.calls.push(WriterCall::Finalize);
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        log.discard_calls += 1;
        log.calls.push(WriterCall::Discard);
        Ok(())
    }
}
