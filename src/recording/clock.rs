// Shared presentation clock for all tracks of a capture

use parking_lot::Mutex;
use std::time::Instant;

/// Presentation-time source shared by the video and audio workers.
///
/// The first call anchors the clock; every later value is the elapsed time
/// since that anchor in microseconds. Values never go backwards, even if the
/// platform clock does.
///
/// Any caller can anchor it, not only the workers. A query made before the
/// first frame or audio chunk starts the timeline at the time of that query,
/// so the first sample then carries a non-zero timestamp.
pub struct PtsClock {
    inner: Mutex<ClockState>,
}

struct ClockState {
    anchor: Option<Instant>,
    last_us: u64,
}

impl PtsClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClockState {
                anchor: None,
                last_us: 0,
            }),
        }
    }

    /// Current anchored timestamp in microseconds
    pub fn pts_us(&self) -> u64 {
        self.pts_at(Instant::now())
    }

    /// Timestamp for a specific instant. Anchors the clock on first use.
    pub fn pts_at(&self, now: Instant) -> u64 {
        let mut state = self.inner.lock();
        let anchor = *state.anchor.get_or_insert(now);
        let elapsed = now.saturating_duration_since(anchor).as_micros() as u64;
        if elapsed > state.last_us {
            state.last_us = elapsed;
        }
        state.last_us
    }

    pub fn is_anchored(&self) -> bool {
        self.inner.lock().anchor.is_some()
    }
}

impl Default for PtsClock {
    fn default() -> Self {
        Self::new()
    }
}
