//! Circuit breaker for exchange call protection.
//!
//! Prevents hammering a failing venue endpoint. One breaker guards one
//! operation key ("{call_type}:{symbol}"); the map of breakers lives in
//! [`super::executor::ResilientExecutor`].
//!
//! # State Machine
//!
//! ```text
//! CLOSED ──(consecutive failures ≥ threshold)──▶ OPEN
//!   ▲                                             │
//!   │                                             │ (cooldown elapsed)
//!   │                                             ▼
//!   └──(probe successes ≥ probe_limit)──── HALF_OPEN
//!                                               │
//!                                               │ (probe failure)
//!                                               ▼
//!                                             OPEN
//! ```

use std::fmt;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing, calls are rejected immediately.
    Open,
    /// Testing recovery with a limited number of probe calls.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time to stay open before admitting probes.
    pub cooldown: Duration,
    /// Probe calls admitted (and successes required) in half-open.
    pub probe_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            probe_limit: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Sensitive preset for order placement: open early, recover fast.
    #[must_use]
    pub const fn order_flow() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            probe_limit: 2,
        }
    }

    /// Tolerant preset for read-only market data calls.
    #[must_use]
    pub const fn market_data() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(15),
            probe_limit: 3,
        }
    }
}

/// Point-in-time breaker metrics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed in the closed state.
    pub consecutive_failures: u32,
    /// Total calls rejected while open.
    pub rejected_calls: u64,
    /// Total transitions into the open state.
    pub times_opened: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
    rejected_calls: u64,
    times_opened: u64,
}

/// Circuit breaker guarding one operation key.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given name and configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
                rejected_calls: 0,
                times_opened: 0,
            }),
        }
    }

    /// Breaker name (its operation key).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask permission to place a call.
    ///
    /// # Errors
    ///
    /// Returns the remaining cooldown when the circuit rejects the call.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= self.config.cooldown {
                    self.transition_to_half_open(&mut inner);
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(self.config.cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.probe_limit {
                    inner.rejected_calls += 1;
                    Err(self.config.cooldown)
                } else {
                    inner.probes_in_flight += 1;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.probe_limit {
                    self.transition_to_closed(&mut inner);
                }
            }
            CircuitState::Open => {
                // Late success from a call admitted before opening.
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                self.transition_to_open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, with the OPEN → HALF_OPEN timer applied.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Point-in-time metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            rejected_calls: inner.rejected_calls,
            times_opened: inner.times_opened,
        }
    }

    /// Force the circuit open (kill switch).
    pub fn force_open(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.transition_to_open(&mut inner);
    }

    /// Force the circuit closed (manual reset).
    pub fn force_close(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.transition_to_closed(&mut inner);
    }

    fn transition_to_open(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            warn!(
                breaker = %self.name,
                from = %inner.state,
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
        inner.times_opened += 1;
    }

    fn transition_to_half_open(&self, inner: &mut Inner) {
        info!(breaker = %self.name, "circuit breaker half-open, admitting probes");
        inner.state = CircuitState::HalfOpen;
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
    }

    fn transition_to_closed(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
            probe_limit: 2,
        }
    }

    #[test]
    fn starts_closed_and_admits_calls() {
        let breaker = CircuitBreaker::new("test", fast_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", fast_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("test", fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_probe_successes() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));

        // First acquire after cooldown transitions to half-open.
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();

        assert!(breaker.try_acquire().is_ok());
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn half_open_limits_probes() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_ok());
        // probe_limit = 2: the third concurrent probe is rejected.
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn rejection_reports_remaining_cooldown() {
        let breaker = CircuitBreaker::new("test", fast_config());
        breaker.force_open();
        let retry_after = breaker.try_acquire().unwrap_err();
        assert!(retry_after <= Duration::from_millis(50));
        assert!(retry_after > Duration::ZERO);
    }

    #[test]
    fn force_close_resets_everything() {
        let breaker = CircuitBreaker::new("test", fast_config());
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn metrics_track_rejections_and_openings() {
        let breaker = CircuitBreaker::new("test", fast_config());
        breaker.force_open();
        let _ = breaker.try_acquire();
        let _ = breaker.try_acquire();

        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.rejected_calls, 2);
        assert_eq!(metrics.times_opened, 1);
    }
}
