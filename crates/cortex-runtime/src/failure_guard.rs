//! [`FailureGuard`] – consecutive Reasoner failure counter.
//!
//! Every Reasoner call reports its outcome to the guard.  After `threshold`
//! failures in a row the guard trips and the runtime switches to its
//! degraded cadence; a single success clears the streak.
//!
//! # Example
//!
//! ```rust
//! use cortex_runtime::failure_guard::FailureGuard;
//!
//! let mut guard = FailureGuard::new(3);
//!
//! assert!(!guard.record_failure());
//! assert!(!guard.record_failure());
//! assert!(guard.record_failure()); // third failure in a row → tripped
//!
//! guard.record_success();
//! assert!(!guard.is_tripped());
//! ```

/// Counts consecutive failures against a threshold.
#[derive(Debug, Clone)]
pub struct FailureGuard {
    threshold: u32,
    consecutive: u32,
}

impl FailureGuard {
    /// A `threshold` of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Record a failure.  Returns `true` when the streak has reached the
    /// threshold.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.is_tripped()
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Clear the streak without recording a success.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}
