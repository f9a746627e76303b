use std::collections::BTreeMap;

use crate::encoding::{TrackId, TrackKind};

use super::memory_writer::{WriterCall, WriterLog};

// ── Container validation ─────────────────────────────────────────────

#[derive(Debug)]
pub struct TrackValidation {
    pub track_id: TrackId,
    pub samples: usize,
    pub key_frames: usize,
    pub first_timestamp_us: u64,
    pub last_timestamp_us: u64,
    pub ends_with_eos: bool,
}

#[derive(Debug)]
pub struct ContainerValidation {
    pub tracks: BTreeMap<TrackKind, TrackValidation>,
    pub finalized: bool,
}

impl ContainerValidation {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackValidation> {
        self.tracks.get(&kind)
    }
}

/// Check a recorded container session against the writer contract:
/// every track added before start, start before any write, at most one
/// start, per-track timestamps never decreasing, no sample after an EOS
/// sample, and no codec-config sample written as data.
pub fn validate_container(log: &WriterLog) -> Result<ContainerValidation, String> {
    if !log.violations.is_empty() {
        return Err(format!("Writer contract violated: {}", log.violations.join("; ")));
    }
    if log.start_calls > 1 {
        return Err(format!("Writer started {} times", log.start_calls));
    }

    let start_pos = log.calls.iter().position(|c| *c == WriterCall::Start);
    for (pos, call) in log.calls.iter().enumerate() {
        match call {
            WriterCall::AddTrack(id) => {
                if start_pos.is_some_and(|start| pos > start) {
                    return Err(format!("Track {} added after start", id));
                }
            }
            WriterCall::Write { track_id, .. } => match start_pos {
                Some(start) if pos > start => {}
                _ => return Err(format!("Sample for track {} written before start", track_id)),
            },
            _ => {}
        }
    }

    let mut tracks = BTreeMap::new();
    for (track_id, format) in &log.tracks {
        let samples = log.samples_for(*track_id);
        let mut last: Option<u64> = None;
        let mut key_frames = 0;

        for (i, sample) in samples.iter().enumerate() {
            if sample.flags.config {
                return Err(format!("Track {} carries a codec-config sample", track_id));
            }
            if let Some(previous) = last {
                if sample.timestamp_us < previous {
                    return Err(format!(
                        "Track {} timestamp went backwards: {} after {}",
                        track_id, sample.timestamp_us, previous
                    ));
                }
            }
            if sample.flags.end_of_stream && i + 1 != samples.len() {
                return Err(format!("Track {} has samples after end of stream", track_id));
            }
            if sample.flags.key_frame {
                key_frames += 1;
            }
            last = Some(sample.timestamp_us);
        }

        let kind = format.kind();
        if tracks.contains_key(&kind) {
            return Err(format!("More than one {} track", kind));
        }
        tracks.insert(
            kind,
            TrackValidation {
                track_id: *track_id,
                samples: samples.len(),
                key_frames,
                first_timestamp_us: samples.first().map(|s| s.timestamp_us).unwrap_or(0),
                last_timestamp_us: last.unwrap_or(0),
                ends_with_eos: samples.last().is_some_and(|s| s.flags.end_of_stream),
            },
        );
    }

    Ok(ContainerValidation {
        tracks,
        finalized: log.finalize_calls == 1,
    })
}

/// Whether samples of the two tracks were written interleaved rather than
/// one track after the other
pub fn is_interleaved(log: &WriterLog, a: TrackId, b: TrackId) -> bool {
    let order: Vec<TrackId> = log
        .calls
        .iter()
        .filter_map(|c| match c {
            WriterCall::Write { track_id, .. } if *track_id == a || *track_id == b => Some(*track_id),
            _ => None,
        })
        .collect();
    let switches = order.windows(2).filter(|w| w[0] != w[1]).count();
    switches >= 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{EncodedSample, MediaFormat, SampleFlags, VideoCodec};
    use crate::recording::muxer::ContainerWriter;
    use crate::test_harness::memory_writer::MemoryContainerWriter;

    fn sample(track_id: TrackId, timestamp_us: u64, end_of_stream: bool) -> EncodedSample {
        EncodedSample {
            track_id,
            timestamp_us,
            flags: SampleFlags {
                end_of_stream,
                ..Default::default()
            },
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn accepts_well_formed_session() {
        let (mut writer, log) = MemoryContainerWriter::new();
        let id = writer
            .add_track(&MediaFormat::video(VideoCodec::H264, 64, 64, 30, vec![]))
            .unwrap();
        writer.start().unwrap();
        writer.write_sample(&sample(id, 0, false)).unwrap();
        writer.write_sample(&sample(id, 33_000, true)).unwrap();
        writer.finalize().unwrap();

        let validation = validate_container(&log.lock()).unwrap();
        let video = validation.track(TrackKind::Video).unwrap();
        assert_eq!(video.samples, 2);
        assert!(video.ends_with_eos);
        assert!(validation.finalized);
    }

    #[test]
    fn rejects_backwards_timestamps() {
        let (mut writer, log) = MemoryContainerWriter::new();
        let id = writer
            .add_track(&MediaFormat::video(VideoCodec::H264, 64, 64, 30, vec![]))
            .unwrap();
        writer.start().unwrap();
        writer.write_sample(&sample(id, 50, false)).unwrap();
        writer.write_sample(&sample(id, 10, false)).unwrap();

        let err = validate_container(&log.lock()).unwrap_err();
        assert!(err.contains("backwards"), "{}", err);
    }

    #[test]
    fn rejects_write_before_start() {
        let (mut writer, log) = MemoryContainerWriter::new();
        let id = writer
            .add_track(&MediaFormat::video(VideoCodec::H264, 64, 64, 30, vec![]))
            .unwrap();
        assert!(writer.write_sample(&sample(id, 0, false)).is_err());
        assert!(validate_container(&log.lock()).is_err());
    }
}
