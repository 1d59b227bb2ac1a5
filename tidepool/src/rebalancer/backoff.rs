//! Backoff applied after a failed rebalancing session.

use std::time::Duration;

/// Decides how long a worker stays suspended after its `n`th consecutive
/// failed (stagnated) session.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `IFailedSessionBackoffProvider`.
pub trait FailedSessionBackoff {
    /// Suspension after `failed_sessions` consecutive failures (`>= 1`).
    fn next(&self, failed_sessions: u32) -> Duration;
}

/// Doubling backoff: `base * 2^(n - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and never exceeding `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(600))
    }
}

impl FailedSessionBackoff for ExponentialBackoff {
    fn next(&self, failed_sessions: u32) -> Duration {
        let exponent = failed_sessions.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Constant backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl FailedSessionBackoff for FixedBackoff {
    fn next(&self, _failed_sessions: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_until_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.next(1), Duration::from_secs(1));
        assert_eq!(backoff.next(2), Duration::from_secs(2));
        assert_eq!(backoff.next(3), Duration::from_secs(4));
        assert_eq!(backoff.next(4), Duration::from_secs(8));
        assert_eq!(backoff.next(5), Duration::from_secs(10));
        assert_eq!(backoff.next(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed() {
        let backoff = FixedBackoff(Duration::from_secs(3));
        assert_eq!(backoff.next(1), backoff.next(100));
    }
}
