//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Exponential backoff with a cap.
///
/// `delay = min(base_delay * multiplier^(attempts - 1), max_delay)`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before the next attempt, given the attempts already made (1-indexed).
    ///
    /// Example with base_delay=30s, multiplier=2.0, max_delay=1h:
    /// - attempt 1: 30s
    /// - attempt 2: 60s
    /// - attempt 3: 120s
    /// - attempt 8 and later: 1h
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}
