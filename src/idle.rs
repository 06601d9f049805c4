/// Idle detection: a shared "last activity" clock and the timer that checks it.
///
/// Watchers call [`ActivityClock::touch`] whenever output arrives; the timer
/// compares the time since the last touch against the idle timeout on every
/// tick. Comparison is done at tenth-of-a-second resolution, both sides
/// truncated, so a run gets up to one tick of extra slack rather than
/// timing out on a tick boundary.
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::{Interval, MissedTickBehavior};

/// Default period between idle checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Timestamp of the most recent observed activity.
///
/// Cloning shares the same underlying timestamp.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    watched_at: Arc<Mutex<Instant>>,
}

impl ActivityClock {
    /// Start a clock with "now" as the last activity.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(at: Instant) -> Self {
        Self {
            watched_at: Arc::new(Mutex::new(at)),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at `at`. Never moves the clock backwards.
    pub fn touch_at(&self, at: Instant) {
        let mut watched_at = self
            .watched_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if at > *watched_at {
            *watched_at = at;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .watched_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time since the last activity, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic idle check against an [`ActivityClock`].
#[derive(Debug)]
pub struct IdleTimer {
    clock: ActivityClock,
    timeout: Duration,
    period: Duration,
    armed: bool,
}

impl IdleTimer {
    pub fn new(timeout: Duration, period: Duration) -> Self {
        Self {
            clock: ActivityClock::new(),
            timeout,
            period,
            armed: true,
        }
    }

    /// Handle for watchers to report activity through.
    pub fn clock(&self) -> ActivityClock {
        self.clock.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ticker for the event loop. The first tick fires immediately.
    pub fn tick_interval(&self) -> Interval {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Whether the idle timeout has been reached as of `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        exceeds_truncated(self.clock.idle_for(now), self.timeout)
    }

    /// Run one tick: returns `true` exactly once, on the first expired check.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        if !self.armed || !self.is_expired_at(now) {
            return false;
        }
        self.armed = false;
        tracing::debug!(
            idle_ms = self.clock.idle_for(now).as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "idle timeout reached"
        );
        true
    }
}

/// Compare both durations truncated to tenths of a second.
fn exceeds_truncated(elapsed: Duration, timeout: Duration) -> bool {
    elapsed.as_millis() / 100 >= timeout.as_millis() / 100
}
