//! Exchange error classification: retriable vs fatal.
//!
//! Classification is keyword-driven over the lowercased error message,
//! including the venue's numeric error codes, which survive every wrapper
//! layer as substrings. Unknown errors are conservatively fatal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Category of an exchange-facing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection-level failure.
    Network,
    /// A deadline expired.
    Timeout,
    /// Request rate exceeded.
    RateLimit,
    /// 5xx-style venue failure.
    ServerError,
    /// Other transient failure (desync, disconnect).
    Temporary,
    /// Bad credentials or signature.
    Authentication,
    /// Missing permissions.
    Authorization,
    /// Unknown trading symbol.
    InvalidSymbol,
    /// Order parameters rejected.
    InvalidOrder,
    /// Not enough margin or balance.
    InsufficientFunds,
    /// Trading disabled on the venue.
    MarketClosed,
    /// Expected failure during connection teardown.
    Shutdown,
    /// Other permanent failure.
    Permanent,
    /// Could not be classified.
    Unknown,
}

impl ErrorCategory {
    /// Whether failures in this category are worth retrying.
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError | Self::Temporary
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Temporary => "temporary",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::InvalidSymbol => "invalid_symbol",
            Self::InvalidOrder => "invalid_order",
            Self::InsufficientFunds => "insufficient_funds",
            Self::MarketClosed => "market_closed",
            Self::Shutdown => "shutdown",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Result of classifying one error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Failure category.
    pub category: ErrorCategory,
    /// Whether a retry could succeed.
    pub retriable: bool,
    /// Suggested minimum delay before retrying, for retriable failures.
    pub retry_delay: Option<Duration>,
}

/// Keywords (and venue error codes) indicating a retriable failure.
const RETRIABLE_PATTERNS: &[(&str, ErrorCategory)] = &[
    ("connection reset", ErrorCategory::Network),
    ("connection refused", ErrorCategory::Network),
    ("network error", ErrorCategory::Network),
    ("socket", ErrorCategory::Network),
    ("broken pipe", ErrorCategory::Network),
    ("timed out", ErrorCategory::Timeout),
    ("timeout", ErrorCategory::Timeout),
    ("deadline exceeded", ErrorCategory::Timeout),
    ("rate limit", ErrorCategory::RateLimit),
    ("too many requests", ErrorCategory::RateLimit),
    ("429", ErrorCategory::RateLimit),
    // Venue: order flow throttled
    ("-1015", ErrorCategory::RateLimit),
    ("-1003", ErrorCategory::RateLimit),
    ("internal server error", ErrorCategory::ServerError),
    ("service unavailable", ErrorCategory::ServerError),
    ("bad gateway", ErrorCategory::ServerError),
    ("502", ErrorCategory::ServerError),
    ("503", ErrorCategory::ServerError),
    ("504", ErrorCategory::ServerError),
    // Venue: disconnects and clock desync, safe to retry
    ("-1001", ErrorCategory::Temporary),
    ("-1000", ErrorCategory::Temporary),
    ("-1021", ErrorCategory::Temporary),
    // Venue: reduce-only rejected due to position sync lag
    ("-2022", ErrorCategory::Temporary),
    ("-4118", ErrorCategory::Temporary),
    ("try again", ErrorCategory::Temporary),
    ("temporarily", ErrorCategory::Temporary),
];

/// Keywords (and venue error codes) indicating a fatal failure.
const FATAL_PATTERNS: &[(&str, ErrorCategory)] = &[
    ("invalid api", ErrorCategory::Authentication),
    ("invalid signature", ErrorCategory::Authentication),
    ("unauthorized", ErrorCategory::Authentication),
    ("401", ErrorCategory::Authentication),
    ("-2015", ErrorCategory::Authentication),
    ("-1022", ErrorCategory::Authentication),
    ("forbidden", ErrorCategory::Authorization),
    ("permission denied", ErrorCategory::Authorization),
    ("403", ErrorCategory::Authorization),
    ("invalid symbol", ErrorCategory::InvalidSymbol),
    ("symbol not found", ErrorCategory::InvalidSymbol),
    ("invalid order", ErrorCategory::InvalidOrder),
    // Venue: order would trigger immediately
    ("-2021", ErrorCategory::InvalidOrder),
    // Venue: precision / percent-price / type / side validation
    ("-1111", ErrorCategory::InvalidOrder),
    ("-4131", ErrorCategory::InvalidOrder),
    ("-1116", ErrorCategory::InvalidOrder),
    ("-1117", ErrorCategory::InvalidOrder),
    // Venue: cancel target already gone
    ("-2011", ErrorCategory::InvalidOrder),
    ("-2013", ErrorCategory::InvalidOrder),
    // Venue: quantity below minimum / notional too small
    ("-4003", ErrorCategory::InvalidOrder),
    ("-4164", ErrorCategory::InvalidOrder),
    ("insufficient", ErrorCategory::InsufficientFunds),
    ("not enough balance", ErrorCategory::InsufficientFunds),
    ("-2019", ErrorCategory::InsufficientFunds),
    ("-4028", ErrorCategory::InsufficientFunds),
    ("market closed", ErrorCategory::MarketClosed),
    ("trading disabled", ErrorCategory::MarketClosed),
    ("websocket closed", ErrorCategory::Shutdown),
    ("connection closed", ErrorCategory::Shutdown),
];

/// Classify an error message.
#[must_use]
pub fn classify(message: &str) -> Classification {
    let lower = message.to_lowercase();

    for (pattern, category) in RETRIABLE_PATTERNS {
        if lower.contains(pattern) {
            return Classification {
                category: *category,
                retriable: true,
                retry_delay: Some(suggested_delay(*category)),
            };
        }
    }

    for (pattern, category) in FATAL_PATTERNS {
        if lower.contains(pattern) {
            return Classification {
                category: *category,
                retriable: false,
                retry_delay: None,
            };
        }
    }

    Classification {
        category: ErrorCategory::Unknown,
        retriable: false,
        retry_delay: None,
    }
}

/// Minimum sensible wait per retriable category.
const fn suggested_delay(category: ErrorCategory) -> Duration {
    match category {
        ErrorCategory::RateLimit => Duration::from_secs(60),
        ErrorCategory::ServerError => Duration::from_secs(10),
        ErrorCategory::Timeout => Duration::from_secs(5),
        _ => Duration::from_secs(2),
    }
}

/// True when the message looks like a reduce-only rejection caused by
/// position sync lag, which warrants a size re-fetch before retrying.
#[must_use]
pub fn is_reduce_only_rejection(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("-2022") || lower.contains("-4118") || lower.contains("reduceonly")
}

/// True when the message means the order was already gone when we tried
/// to cancel it, which callers treat as success.
#[must_use]
pub fn is_unknown_order(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("-2011") || lower.contains("-2013") || lower.contains("unknown order")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Connection reset by peer", ErrorCategory::Network, true)]
    #[test_case("request timed out", ErrorCategory::Timeout, true)]
    #[test_case("HTTP 429 Too Many Requests", ErrorCategory::RateLimit, true)]
    #[test_case("code=-1015 too many new orders", ErrorCategory::RateLimit, true)]
    #[test_case("code=-2022 ReduceOnly Order is rejected", ErrorCategory::Temporary, true)]
    #[test_case("503 Service Unavailable", ErrorCategory::ServerError, true)]
    #[test_case("code=-2019 Margin is insufficient", ErrorCategory::InsufficientFunds, false)]
    #[test_case("code=-4164 Order's notional must be no smaller", ErrorCategory::InvalidOrder, false)]
    #[test_case("Invalid API-key, IP, or permissions", ErrorCategory::Authentication, false)]
    #[test_case("something entirely novel", ErrorCategory::Unknown, false)]
    fn classification_table(message: &str, category: ErrorCategory, retriable: bool) {
        let c = classify(message);
        assert_eq!(c.category, category);
        assert_eq!(c.retriable, retriable);
    }

    #[test]
    fn rate_limit_suggests_long_delay() {
        let c = classify("rate limit exceeded");
        assert_eq!(c.retry_delay, Some(Duration::from_secs(60)));
    }

    #[test]
    fn unknown_is_conservatively_fatal() {
        assert!(!classify("").retriable);
    }

    #[test]
    fn reduce_only_rejection_detection() {
        assert!(is_reduce_only_rejection("code=-2022 order rejected"));
        assert!(is_reduce_only_rejection("ReduceOnly Order is rejected"));
        assert!(!is_reduce_only_rejection("insufficient margin"));
    }

    #[test]
    fn unknown_order_detection() {
        assert!(is_unknown_order("code=-2011 Unknown order sent"));
        assert!(is_unknown_order("Order does not exist -2013"));
        assert!(!is_unknown_order("rate limit"));
    }
}
