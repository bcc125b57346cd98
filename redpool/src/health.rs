//! Health-check deadline kept per connection.

use std::time::{Duration, Instant};

/// Monotonic deadline for the next PING probe.
///
/// A zero interval disables probing entirely. An interval too large to add
/// to the clock leaves the deadline unset until [`expire`](Self::expire).
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckClock {
    interval: Duration,
    deadline: Option<Instant>,
}

impl HealthCheckClock {
    /// Creates a clock that is due immediately.
    pub fn new(interval: Duration) -> Self {
        HealthCheckClock {
            interval,
            deadline: Some(Instant::now()),
        }
    }

    /// Probe interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when probing is turned on.
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Current deadline, `None` when it lies beyond what `Instant` holds.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Overrides the deadline.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Makes the next check due right away.
    pub fn expire(&mut self) {
        self.deadline = Some(Instant::now());
    }

    /// True when a probe should be sent at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.enabled() && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Moves the deadline to `now + interval`.
    pub fn advance(&mut self, now: Instant) {
        if self.enabled() {
            self.deadline = now.checked_add(self.interval);
        }
    }
}
