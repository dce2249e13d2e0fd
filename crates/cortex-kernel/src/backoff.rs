//! [`BackoffPolicy`] – capped exponential delays.
//!
//! Used for Reasoner retries within a tick, for restarting a failing input
//! source, and for stretching the degraded cooldown while the Reasoner stays
//! down.  The delay for attempt `n` (0-based) is `initial * 2^n`, clamped to
//! `max`.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use cortex_kernel::BackoffPolicy;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(1));
//! assert_eq!(policy.delay(0), Duration::from_millis(250));
//! assert_eq!(policy.delay(1), Duration::from_millis(500));
//! assert_eq!(policy.delay(5), Duration::from_secs(1));
//! ```

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// `max` is raised to `initial` if it is smaller.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// `true` once `attempt` has reached the cap.
    pub fn is_saturated(&self, attempt: u32) -> bool {
        self.delay(attempt) >= self.max
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(60))
    }
}
