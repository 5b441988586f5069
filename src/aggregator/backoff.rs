//! Reconnect backoff schedule
//!
//! Doubling delays from a base up to a cap, reset on a successful connect.
//! Kept as a plain iterator so the schedule itself is testable.

use std::time::Duration;

/// Exponential reconnect delay generator
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl ReconnectBackoff {
    /// Create a schedule: `base`, `2*base`, `4*base`, ... capped at `cap`
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: None,
        }
    }

    /// Next delay to sleep before the upcoming attempt
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(previous) => self.cap.min(previous.saturating_mul(2)),
        };
        self.current = Some(next);
        next
    }

    /// Reset after a successful connect
    pub fn reset(&mut self) {
        self.current = None;
    }
}
