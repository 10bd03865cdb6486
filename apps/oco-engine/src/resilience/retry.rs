//! Retry policies with exponential backoff for exchange calls.
//!
//! Whether a failure is worth retrying at all is decided by
//! [`super::classifier`]; this module only shapes the retry schedule.
//!
//! # Example
//!
//! ```rust,ignore
//! use oco_engine::resilience::retry::{BackoffSchedule, RetryPolicy};
//!
//! let policy = RetryPolicy::bracket_leg();
//! let mut backoff = BackoffSchedule::new(&policy);
//!
//! while let Some(delay) = backoff.next_backoff() {
//!     tokio::time::sleep(delay).await;
//!     // retry ...
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration for exchange calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (after the initial call).
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth.
    pub backoff_multiplier: f64,
    /// Jitter factor for randomization (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Aggressive policy for latency-sensitive calls (price fetches).
    #[must_use]
    pub const fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            jitter_factor: 0.1,
        }
    }

    /// Conservative policy for best-effort cleanup calls.
    #[must_use]
    pub const fn conservative() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }

    /// Policy for OCO bracket legs: a missing leg leaves the position
    /// unprotected, so attempts are generous before rollback kicks in.
    #[must_use]
    pub const fn bracket_leg() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(1500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

/// Iterator-style producer of jittered exponential backoff delays.
///
/// The next undithered delay is carried forward and scaled by the
/// multiplier on every draw, so the schedule never recomputes powers.
#[derive(Debug)]
pub struct BackoffSchedule {
    consumed: u32,
    max_attempts: u32,
    initial: Duration,
    next_delay: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl BackoffSchedule {
    /// Create a schedule from a retry policy.
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            consumed: 0,
            max_attempts: policy.max_attempts,
            initial: policy.initial_backoff,
            next_delay: policy.initial_backoff,
            max_backoff: policy.max_backoff,
            multiplier: policy.backoff_multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }

    /// Get the next backoff duration with jitter.
    ///
    /// Returns `None` once max attempts are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.consumed >= self.max_attempts {
            return None;
        }
        self.consumed += 1;

        let base = self.next_delay.min(self.max_backoff);
        if self.next_delay < self.max_backoff {
            self.next_delay = self.next_delay.mul_f64(self.multiplier);
        }

        Some(self.dither(base))
    }

    /// Scale a delay by a random factor in `1 ± jitter_factor`, still
    /// honoring the cap.
    fn dither(&self, base: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let spread = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
        base.mul_f64(1.0 + spread).min(self.max_backoff)
    }

    /// Attempts consumed so far.
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.consumed
    }

    /// Check if more retries are available.
    #[must_use]
    pub const fn has_remaining_attempts(&self) -> bool {
        self.consumed < self.max_attempts
    }

    /// Reset the schedule for a new request.
    pub const fn reset(&mut self) {
        self.consumed = 0;
        self.next_delay = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_exhausts_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        let mut backoff = BackoffSchedule::new(&policy);

        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_none());
        assert!(!backoff.has_remaining_attempts());
    }

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        let mut backoff = BackoffSchedule::new(&policy);

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(2500),
            backoff_multiplier: 3.0,
            jitter_factor: 0.0,
        };
        let mut backoff = BackoffSchedule::new(&policy);

        let mut last = Duration::ZERO;
        while let Some(delay) = backoff.next_backoff() {
            assert!(delay <= Duration::from_millis(2500));
            last = delay;
        }
        assert_eq!(last, Duration::from_millis(2500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        };

        for _ in 0..100 {
            let mut backoff = BackoffSchedule::new(&policy);
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= Duration::from_millis(800), "delay {delay:?} below jitter floor");
            assert!(delay <= Duration::from_millis(1200), "delay {delay:?} above jitter ceiling");
        }
    }

    #[test]
    fn reset_restores_full_budget() {
        let policy = RetryPolicy::conservative();
        let mut backoff = BackoffSchedule::new(&policy);
        while backoff.next_backoff().is_some() {}
        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
        assert!(backoff.next_backoff().is_some());
    }

    #[test]
    fn bracket_leg_preset_is_generous() {
        let policy = RetryPolicy::bracket_leg();
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.initial_backoff, Duration::from_millis(1500));
    }
}
