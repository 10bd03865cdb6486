//! Retry + circuit breaker execution wrapper.
//!
//! `ResilientExecutor::call` is the single chokepoint for exchange calls:
//! it classifies failures, retries the retriable ones on a jittered
//! exponential schedule, and trips a per-key circuit breaker on repeated
//! failures. Keys follow the "{call_type}:{symbol}" convention so one
//! misbehaving symbol cannot block the rest of the book.
//!
//! During shutdown the engine flips `shutdown_mode`, which bypasses
//! breakers entirely: a drain must be able to close positions even
//! through an endpoint the breaker has given up on.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use super::retry::{BackoffSchedule, RetryPolicy};

/// Shared retry/breaker wrapper for exchange calls.
#[derive(Debug, Default)]
pub struct ResilientExecutor {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: CircuitBreakerConfig,
    shutdown_mode: AtomicBool,
}

impl ResilientExecutor {
    /// Create an executor whose breakers use the given configuration.
    #[must_use]
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            breaker_config,
            shutdown_mode: AtomicBool::new(false),
        }
    }

    /// Enable or disable shutdown mode (breaker bypass).
    pub fn set_shutdown_mode(&self, enabled: bool) {
        self.shutdown_mode.store(enabled, Ordering::SeqCst);
        if enabled {
            warn!("shutdown mode enabled, circuit breakers bypassed");
        }
    }

    /// Whether shutdown mode is active.
    #[must_use]
    pub fn is_shutdown_mode(&self) -> bool {
        self.shutdown_mode.load(Ordering::SeqCst)
    }

    /// Get or create the breaker for an operation key.
    #[must_use]
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(found) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(found);
        }
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.breaker_config.clone()))),
        )
    }

    /// Execute `op` under the default retry policy.
    pub async fn call<T, F, Fut>(&self, key: &str, op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.call_with_policy(key, &RetryPolicy::default(), op).await
    }

    /// Execute `op` with retries and breaker protection.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::CircuitOpen` when the breaker rejects the
    /// call, or the final underlying error once retries are exhausted.
    pub async fn call_with_policy<T, F, Fut>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let breaker = self.breaker(key);
        let mut backoff = BackoffSchedule::new(policy);

        loop {
            if !self.is_shutdown_mode() {
                if let Err(retry_after) = breaker.try_acquire() {
                    return Err(EngineError::CircuitOpen {
                        key: key.to_string(),
                        retry_after,
                    });
                }
            }

            match op().await {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    breaker.record_failure();

                    if !err.is_retriable() {
                        debug!(key, error = %err, "fatal error, not retrying");
                        return Err(err);
                    }

                    match backoff.next_backoff() {
                        Some(delay) => {
                            let delay = delay.max(minimum_delay(&err));
                            warn!(
                                key,
                                attempt = backoff.current_attempt(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retriable error, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(key, error = %err, "retries exhausted");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Execute `op` with an overall deadline on top of retry/breaker
    /// handling.
    pub async fn call_with_timeout<T, F, Fut>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        timeout: Duration,
        op: F,
    ) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        match tokio::time::timeout(timeout, self.call_with_policy(key, policy, op)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                operation: key.to_string(),
                elapsed: timeout,
            }),
        }
    }

    /// Metrics for every breaker created so far.
    #[must_use]
    pub fn breaker_metrics(&self) -> HashMap<String, CircuitBreakerMetrics> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.metrics()))
            .collect()
    }
}

/// For rate-limit errors the venue-mandated pause dominates the local
/// backoff schedule.
fn minimum_delay(err: &EngineError) -> Duration {
    if let EngineError::Exchange { message, .. } = err {
        let classification = super::classifier::classify(message);
        if classification.category == super::classifier::ErrorCategory::RateLimit {
            if let Some(delay) = classification.retry_delay {
                return delay;
            }
        }
    }
    Duration::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classifier::ErrorCategory;
    use std::sync::atomic::AtomicU32;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn test_executor() -> ResilientExecutor {
        ResilientExecutor::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            probe_limit: 1,
        })
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let executor = test_executor();
        let result: EngineResult<u32> = executor
            .call_with_policy("fetch_price:BTC", &fast_policy(), || async { Ok(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let executor = test_executor();
        let attempts = AtomicU32::new(0);

        let result = executor
            .call_with_policy("create_order:BTC", &fast_policy(), || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::exchange(ErrorCategory::Network, "connection reset"))
                    } else {
                        Ok("filled")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "filled");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_fail_fast() {
        let executor = test_executor();
        let attempts = AtomicU32::new(0);

        let result: EngineResult<()> = executor
            .call_with_policy("create_order:BTC", &fast_policy(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EngineError::exchange(
                        ErrorCategory::InsufficientFunds,
                        "margin is insufficient",
                    ))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_and_rejects() {
        let executor = test_executor();

        // Exhaust retries once: 1 initial + 3 retries = 4 failures, enough
        // to trip the 3-failure breaker.
        let _: EngineResult<()> = executor
            .call_with_policy("create_order:ETH", &fast_policy(), || async {
                Err(EngineError::exchange(ErrorCategory::Network, "connection refused"))
            })
            .await;

        let result: EngineResult<()> = executor
            .call_with_policy("create_order:ETH", &fast_policy(), || async { Ok(()) })
            .await;

        match result {
            Err(EngineError::CircuitOpen { key, .. }) => assert_eq!(key, "create_order:ETH"),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_mode_bypasses_open_breaker() {
        let executor = test_executor();
        executor.breaker("close_position:BTC").force_open();

        executor.set_shutdown_mode(true);
        let result = executor
            .call_with_policy("close_position:BTC", &fast_policy(), || async { Ok("closed") })
            .await;
        assert_eq!(result.unwrap(), "closed");
    }

    #[tokio::test]
    async fn per_key_isolation() {
        let executor = test_executor();
        executor.breaker("create_order:DOGE").force_open();

        // A different symbol's key is unaffected.
        let result = executor
            .call_with_policy("create_order:BTC", &fast_policy(), || async { Ok(1) })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_engine_timeout() {
        let executor = test_executor();
        let result: EngineResult<()> = executor
            .call_with_timeout(
                "fill_wait:BTC",
                &fast_policy(),
                Duration::from_millis(10),
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
            )
            .await;

        assert!(matches!(result, Err(EngineError::Timeout { .. })));
    }
}
