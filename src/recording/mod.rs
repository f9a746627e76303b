// Recording modules

pub mod audio;
pub mod clock;
pub mod controller;
#[cfg(feature = "cpal")]
pub mod cpal_source;
pub mod drain;
pub mod muxer;
pub mod video;

pub use audio::{AudioCaptureEncoder, AudioStopHandle};
pub use clock::PtsClock;
pub use controller::{CaptureController, RecorderError, RecorderEvent, RecordingSummary};
pub use muxer::{ContainerWriter, FinalizeOutcome, MuxError, MuxerGate, MuxerState};
pub use video::{FrameSink, VideoEncoderCore};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::encoding::TrackKind;
use drain::DrainOptions;

/// How often a `stop()` waiter re-checks for workers that died
pub const QUIESCENCE_POLL: Duration = Duration::from_millis(50);

/// Lifecycle phase of a pipeline or of the whole recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Constructed, no worker yet
    Created,
    /// Worker running, encoder not started
    Prepared,
    /// Capturing
    Started,
    /// Stop requested, waiting for the workers to quiesce
    Stopping,
    /// Workers idle, output finalized
    Stopped,
    /// Native resources freed (terminal)
    Released,
    /// Preparation failed (terminal)
    Failed,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Created, Prepared) | (Created, Failed) => true,
            (Prepared, Started) => true,
            (Started, Stopping) | (Prepared, Stopping) => true,
            (Stopping, Stopped) => true,
            // stop() on a stopped pipeline re-enters the wait harmlessly
            (Stopped, Stopping) | (Stopped, Stopped) => true,
            // release() is legal from anywhere except an already released pipeline
            (Released, _) => false,
            (_, Released) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Released | LifecycleState::Failed)
    }
}

/// Move `state` to `next`, or fail with the operation that was attempted
pub(crate) fn advance(
    state: &mut LifecycleState,
    next: LifecycleState,
    operation: &'static str,
) -> Result<(), RecorderError> {
    if !state.can_transition_to(next) {
        return Err(RecorderError::InvalidState {
            operation,
            state: *state,
        });
    }
    *state = next;
    Ok(())
}

/// Four-phase lifecycle shared by both pipelines and the controller
pub trait Lifecycle {
    type Error;

    fn prepare(&mut self) -> Result<(), Self::Error>;

    fn start(&mut self) -> Result<(), Self::Error>;

    /// Blocks until the pipeline has quiesced
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// Idempotent; stops first when needed
    fn release(&mut self) -> Result<(), Self::Error>;

    fn state(&self) -> LifecycleState;
}

/// Shared "which pipelines are stopped" predicate plus its condition variable.
///
/// Workers mark themselves stopped; `stop()` callers wait until every pipeline
/// they care about has done so.
pub struct Quiescence {
    stopped: Mutex<BTreeSet<TrackKind>>,
    changed: Condvar,
}

impl Quiescence {
    /// All pipelines start out stopped
    pub fn new(pipelines: &[TrackKind]) -> Self {
        Self {
            stopped: Mutex::new(pipelines.iter().copied().collect()),
            changed: Condvar::new(),
        }
    }

    pub fn mark_running(&self, pipeline: TrackKind) {
        self.stopped.lock().remove(&pipeline);
    }

    pub fn mark_stopped(&self, pipeline: TrackKind) {
        let mut stopped = self.stopped.lock();
        stopped.insert(pipeline);
        self.changed.notify_all();
    }

    pub fn is_stopped(&self, pipeline: TrackKind) -> bool {
        self.stopped.lock().contains(&pipeline)
    }

    /// Block until every pipeline in `pipelines` is stopped.
    ///
    /// Wakes every `poll` to run `check`, which may mark dead workers stopped.
    pub fn wait_stopped<F>(&self, pipelines: &[TrackKind], poll: Duration, check: F)
    where
        F: FnMut(TrackKind) -> bool,
    {
        self.wait_stopped_observing(pipelines, poll, check, |_| {});
    }

    /// [`wait_stopped`](Self::wait_stopped) that also hands the stopped set to
    /// `observe` on every wake, so the caller can unblock pipelines that
    /// depend on the ones already stopped. `observe` runs with the stopped set
    /// locked and must not call back into this `Quiescence`.
    pub fn wait_stopped_observing<F, G>(&self, pipelines: &[TrackKind], poll: Duration, mut check: F, mut observe: G)
    where
        F: FnMut(TrackKind) -> bool,
        G: FnMut(&BTreeSet<TrackKind>),
    {
        let mut stopped = self.stopped.lock();
        loop {
            let mut pending = false;
            for pipeline in pipelines {
                if stopped.contains(pipeline) {
                    continue;
                }
                if check(*pipeline) {
                    stopped.insert(*pipeline);
                } else {
                    pending = true;
                }
            }
            if !pending {
                return;
            }
            observe(&stopped);
            self.changed.wait_for(&mut stopped, poll);
        }
    }
}

/// Everything a pipeline worker shares with the rest of the recording
#[derive(Clone)]
pub struct PipelineContext {
    pub gate: Arc<MuxerGate>,
    pub clock: Arc<PtsClock>,
    pub quiescence: Arc<Quiescence>,
    pub events: Sender<RecorderEvent>,
    pub drain: DrainOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use LifecycleState::*;
        assert!(Created.can_transition_to(Prepared));
        assert!(Prepared.can_transition_to(Started));
        assert!(Started.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Stopping));
        assert!(Started.can_transition_to(Released));
        assert!(Failed.can_transition_to(Released));

        assert!(!Created.can_transition_to(Started));
        assert!(!Stopped.can_transition_to(Started));
        assert!(!Failed.can_transition_to(Prepared));
        assert!(!Released.can_transition_to(Released));
        assert!(!Released.can_transition_to(Prepared));
    }

    #[test]
    fn advance_reports_the_rejected_operation() {
        let mut state = LifecycleState::Created;
        advance(&mut state, LifecycleState::Prepared, "prepare").unwrap();
        assert_eq!(state, LifecycleState::Prepared);

        let err = advance(&mut state, LifecycleState::Prepared, "prepare").unwrap_err();
        assert!(matches!(
            err,
            RecorderError::InvalidState { operation: "prepare", state: LifecycleState::Prepared }
        ));
    }

    #[test]
    fn wait_returns_once_all_pipelines_stop() {
        let q = Arc::new(Quiescence::new(&[TrackKind::Video, TrackKind::Audio]));
        q.mark_running(TrackKind::Video);
        q.mark_running(TrackKind::Audio);

        let worker = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.mark_stopped(TrackKind::Video);
                std::thread::sleep(Duration::from_millis(20));
                q.mark_stopped(TrackKind::Audio);
            })
        };

        q.wait_stopped(&[TrackKind::Video, TrackKind::Audio], Duration::from_millis(50), |_| false);
        assert!(q.is_stopped(TrackKind::Video));
        assert!(q.is_stopped(TrackKind::Audio));
        worker.join().unwrap();
    }

    #[test]
    fn wait_on_stopped_pipelines_returns_immediately() {
        let q = Quiescence::new(&[TrackKind::Video]);
        q.wait_stopped(&[TrackKind::Video], Duration::from_millis(10), |_| false);
        q.wait_stopped(&[TrackKind::Video], Duration::from_millis(10), |_| false);
        assert!(q.is_stopped(TrackKind::Video));
    }

    #[test]
    fn observer_can_release_a_pipeline_waiting_on_a_stopped_one() {
        let q = Arc::new(Quiescence::new(&[TrackKind::Video, TrackKind::Audio]));
        q.mark_running(TrackKind::Video);
        q.mark_running(TrackKind::Audio);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

        let worker = {
            let q = q.clone();
            std::thread::spawn(move || {
                q.mark_stopped(TrackKind::Audio);
                // Video only finishes once the waiter noticed audio is done
                release_rx.recv().unwrap();
                q.mark_stopped(TrackKind::Video);
            })
        };

        let mut observed = Vec::new();
        q.wait_stopped_observing(
            &[TrackKind::Video, TrackKind::Audio],
            Duration::from_millis(5),
            |_| false,
            |stopped| {
                observed.push(stopped.clone());
                if stopped.contains(&TrackKind::Audio) {
                    let _ = release_tx.try_send(());
                }
            },
        );

        worker.join().unwrap();
        assert!(q.is_stopped(TrackKind::Video));
        assert!(observed.iter().any(|s| s.contains(&TrackKind::Audio) && !s.contains(&TrackKind::Video)));
    }

    #[test]
    fn dead_worker_check_unblocks_wait() {
        let q = Quiescence::new(&[TrackKind::Audio]);
        q.mark_running(TrackKind::Audio);
        q.wait_stopped(&[TrackKind::Audio], Duration::from_millis(5), |kind| kind == TrackKind::Audio);
        assert!(q.is_stopped(TrackKind::Audio));
    }
}
