//! Seekable-range bookkeeping for static and dynamic presentations.

use std::sync::Arc;

use crate::{Clock, ClockRef};

/// A range of media time available to the player, in microseconds on the master timeline.
#[derive(Clone)]
pub enum TimeRange {
    Static(StaticTimeRange),
    Dynamic(DynamicTimeRange),
}

impl TimeRange {
    pub fn is_static(&self) -> bool {
        matches!(self, TimeRange::Static(_))
    }

    /// Current `(start_us, end_us)` bounds. For a dynamic range this recomputes against the clock
    /// on every call; for live content the result is never empty.
    pub fn current_bounds(&self) -> (i64, i64) {
        match self {
            TimeRange::Static(r) => (r.start_us, r.end_us),
            TimeRange::Dynamic(r) => r.current_bounds(),
        }
    }
}

impl std::fmt::Debug for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (start, end) = self.current_bounds();
        let kind = if self.is_static() { "static" } else { "dynamic" };
        write!(f, "TimeRange[{kind} {start}..{end}]")
    }
}

/// Fixed bounds, used for on-demand content and for live periods whose index is explicit.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTimeRange {
    pub start_us: i64,
    pub end_us: i64,
}

impl StaticTimeRange {
    pub fn new(start_us: i64, end_us: i64) -> Self {
        debug_assert!(start_us <= end_us);
        StaticTimeRange { start_us, end_us }
    }
}

/// Bounds that slide with the wall clock: the end tracks `now - time_at_zero` and the start
/// trails it by the time-shift buffer depth.
#[derive(Clone)]
pub struct DynamicTimeRange {
    min_start_us: i64,
    max_end_us: i64,
    /// Epoch microseconds at which media time zero became available.
    time_at_zero_us: i64,
    buffer_depth_us: i64,
    clock: ClockRef,
}

impl DynamicTimeRange {
    pub fn new(
        min_start_us: i64,
        max_end_us: i64,
        time_at_zero_us: i64,
        buffer_depth_us: i64,
        clock: ClockRef,
    ) -> Self {
        DynamicTimeRange { min_start_us, max_end_us, time_at_zero_us, buffer_depth_us, clock }
    }

    pub fn current_bounds(&self) -> (i64, i64) {
        let elapsed = self.clock.now_us() - self.time_at_zero_us;
        let end = self.max_end_us.min(elapsed);
        let start = if self.buffer_depth_us > 0 {
            self.min_start_us.max(end - self.buffer_depth_us)
        } else {
            self.min_start_us
        };
        (start, end)
    }
}

/// A clock whose reading is set explicitly. Only useful for driving live-window logic in tests.
#[derive(Default)]
pub struct ManualClock {
    now_us: parking_lot::Mutex<i64>,
}

impl ManualClock {
    pub fn new(now_us: i64) -> Arc<Self> {
        Arc::new(ManualClock { now_us: parking_lot::Mutex::new(now_us) })
    }

    pub fn set_us(&self, now_us: i64) {
        *self.now_us.lock() = now_us;
    }

    pub fn advance_us(&self, delta_us: i64) {
        *self.now_us.lock() += delta_us;
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        *self.now_us.lock()
    }
}
