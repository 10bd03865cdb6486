//! Resilience layer: error classification, retries, circuit breakers and
//! order intent tracking.

pub mod circuit_breaker;
pub mod classifier;
pub mod executor;
pub mod intent;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classifier::{Classification, ErrorCategory, classify};
pub use executor::ResilientExecutor;
pub use intent::{IntentStatus, IntentTracker, OrderIntent};
pub use retry::{BackoffSchedule, RetryPolicy};
