//! Reconnect backoff: exponential, capped, reset on success.

use std::time::Duration;

/// First reconnect delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Double the delay, up to the cap. Returns the new delay.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.current(), Duration::from_secs(1));

        let waits: Vec<u64> = (0..8).map(|_| backoff.record_failure().as_secs()).collect();
        assert_eq!(waits, vec![2, 4, 8, 16, 32, 64, 120, 120]);
        assert_eq!(backoff.current(), Duration::from_secs(120));
        assert_eq!(backoff.failures(), 8);

        backoff.record_failure();
        assert_eq!(backoff.current(), MAX_BACKOFF);
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = Backoff::default();
        for _ in 0..5 {
            backoff.record_failure();
        }
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
        assert_eq!(backoff.failures(), 0);
    }
}
