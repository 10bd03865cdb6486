//! OHLC candle input for exit checks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLC candle for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Candle close timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    /// Builds a candle from OHLC values stamped now. Test and demo helper.
    #[must_use]
    pub fn new(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
        Self {
            open,
            high,
            low,
            close,
            timestamp: Utc::now(),
        }
    }

    /// True when `price` falls within this candle's range.
    #[must_use]
    pub fn contains(&self, price: Decimal) -> bool {
        price >= self.low && price <= self.high
    }
}
