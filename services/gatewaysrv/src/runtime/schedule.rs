//! Poll timing and per-device scheduler state
//!
//! Intervals are measured from the completion of the previous poll, never
//! from its start, so a slow device can not pile up overlapping polls.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::runtime::prewrite::PreWriteTracker;
use crate::runtime::watchdog::WatchdogState;

/// Which data points a poll reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    /// The fast subset (or everything without a slow tier)
    Fast,
    /// Every readable data point
    Slow,
}

/// Fast and optional slow poll timers
#[derive(Debug, Clone)]
pub struct PollTimer {
    fast_interval: Duration,
    slow_interval: Option<Duration>,
    next_fast: Instant,
    next_slow: Option<Instant>,
}

impl PollTimer {
    /// Both tiers are due immediately
    pub fn new(fast_interval: Duration, slow_interval: Option<Duration>, now: Instant) -> Self {
        Self {
            fast_interval,
            slow_interval,
            next_fast: now,
            next_slow: slow_interval.map(|_| now),
        }
    }

    pub fn fast_interval(&self) -> Duration {
        self.fast_interval
    }

    /// The poll due at `now`; the slow tier wins when both are due
    pub fn due(&self, now: Instant) -> Option<PollKind> {
        if self.next_slow.is_some_and(|t| t <= now) {
            Some(PollKind::Slow)
        } else if self.next_fast <= now {
            Some(PollKind::Fast)
        } else {
            None
        }
    }

    /// Earliest instant at which a poll becomes due
    pub fn next_due(&self) -> Instant {
        match self.next_slow {
            Some(slow) => slow.min(self.next_fast),
            None => self.next_fast,
        }
    }

    /// Reschedule after a poll of `kind` finished at `completed`.
    ///
    /// A slow poll reads the fast subset too, so both timers restart.
    pub fn complete(&mut self, kind: PollKind, completed: Instant) {
        self.next_fast = completed + self.fast_interval;
        if kind == PollKind::Slow {
            if let Some(slow) = self.slow_interval {
                self.next_slow = Some(completed + slow);
            }
        }
    }
}

/// Mutable scheduler state of one running device
#[derive(Debug)]
pub struct ScheduleState {
    pub timer: PollTimer,
    pub connected: bool,
    pub last_error: Option<String>,
    /// When each data point was last written by a user
    pub last_writes: HashMap<String, Instant>,
    pub pre_writes: PreWriteTracker,
    pub watchdog: Option<WatchdogState>,
}

impl ScheduleState {
    pub fn new(timer: PollTimer, watchdog: Option<WatchdogState>) -> Self {
        Self {
            timer,
            connected: false,
            last_error: None,
            last_writes: HashMap::new(),
            pre_writes: PreWriteTracker::default(),
            watchdog,
        }
    }

    pub fn record_write(&mut self, dp_id: &str, now: Instant) {
        self.last_writes.insert(dp_id.to_string(), now);
    }

    /// Latest user write among `ids`
    pub fn last_write_of<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Option<Instant> {
        ids.into_iter()
            .filter_map(|id| self.last_writes.get(id).copied())
            .max()
    }
}
