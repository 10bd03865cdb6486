//! Engine-wide error taxonomy.
//!
//! Each service keeps failures typed until they cross the facade, where
//! they surface as [`EngineError`]. Retriability is decided by the
//! resilience classifier, not here; `is_retriable` only reflects what the
//! variant already knows.

use std::time::Duration;
use thiserror::Error;

use crate::resilience::classifier::ErrorCategory;

/// Top-level error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A request failed validation before reaching the exchange.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An OCO bracket could not be completed atomically; rollback ran.
    #[error("OCO atomicity violated for {symbol} during {stage}: {message}")]
    OcoAtomicity {
        /// Symbol whose bracket failed.
        symbol: String,
        /// Stage that failed: "entry", "fill-wait", "validate", "tp-leg",
        /// "sl-leg" or "deadline".
        stage: &'static str,
        /// Underlying failure description.
        message: String,
    },

    /// The exchange rejected or failed an operation.
    #[error("exchange error ({category}): {message}")]
    Exchange {
        /// Classified category of the failure.
        category: ErrorCategory,
        /// Exchange-reported message.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("timeout after {elapsed:?} in {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Time spent before giving up.
        elapsed: Duration,
    },

    /// Balance accounting rejected the operation.
    #[error("balance error: {0}")]
    Balance(String),

    /// A position lookup or transition failed.
    #[error("position error: {0}")]
    Position(String),

    /// A circuit breaker is open for this operation key.
    #[error("circuit open for '{key}', retry after {retry_after:?}")]
    CircuitOpen {
        /// Breaker key ("{call_type}:{symbol}").
        key: String,
        /// Time until the breaker admits a probe.
        retry_after: Duration,
    },

    /// Trading is halted after an unrecoverable reconciliation divergence.
    #[error("trading halted pending manual review")]
    Halted,

    /// State snapshot IO failed.
    #[error("persistence IO error: {0}")]
    PersistenceIo(#[from] std::io::Error),

    /// State snapshot (de)serialization failed.
    #[error("persistence serialization error: {0}")]
    PersistenceSerde(#[from] serde_json::Error),

    /// Configuration could not be loaded or validated.
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl EngineError {
    /// Convenience constructor for exchange failures.
    #[must_use]
    pub fn exchange(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Exchange {
            category,
            message: message.into(),
        }
    }

    /// Convenience constructor for validation failures.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Exchange { category, .. } => category.is_retriable(),
            Self::Timeout { .. } | Self::CircuitOpen { .. } => true,
            _ => false,
        }
    }
}

/// Engine result alias.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_retriability_follows_category() {
        let transient = EngineError::exchange(ErrorCategory::Network, "connection reset");
        assert!(transient.is_retriable());

        let fatal = EngineError::exchange(ErrorCategory::InsufficientFunds, "margin is insufficient");
        assert!(!fatal.is_retriable());
    }

    #[test]
    fn circuit_open_is_retriable() {
        let err = EngineError::CircuitOpen {
            key: "create_order:BTC/USDT".into(),
            retry_after: Duration::from_secs(30),
        };
        assert!(err.is_retriable());
        assert!(err.to_string().contains("create_order:BTC/USDT"));
    }

    #[test]
    fn validation_is_fatal() {
        assert!(!EngineError::validation("amount must be positive").is_retriable());
    }

    #[test]
    fn oco_atomicity_message_names_stage() {
        let err = EngineError::OcoAtomicity {
            symbol: "ETH/USDT".into(),
            stage: "tp-leg",
            message: "rejected".into(),
        };
        let text = err.to_string();
        assert!(text.contains("ETH/USDT"));
        assert!(text.contains("tp-leg"));
    }
}
