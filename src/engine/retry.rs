// src/engine/retry.rs

//! Retry policy for persistent tasks: decides backoff delays.

use std::time::Duration;

/// Exponential backoff bounded by a cap and an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Total starts allowed, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after `attempts` failed starts (1-indexed):
    /// `min(base * 2^(attempts - 1), cap)`.
    ///
    /// With base=1s, cap=30s: 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Whether another start is allowed after `attempts` starts.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
