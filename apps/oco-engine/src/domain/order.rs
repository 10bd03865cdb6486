//! Normalized order views exchanged with the connector.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order direction on the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy side.
    Buy,
    /// Sell side.
    Sell,
}

impl OrderSide {
    /// The opposite book side.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type specifying execution behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    /// Market order - execute at best available price.
    Market,
    /// Limit order - execute at specified price or better.
    Limit,
    /// Stop-market order - triggers a market order at the stop price.
    StopMarket,
    /// Take-profit market order - triggers at the profit target.
    TakeProfitMarket,
}

impl OrderKind {
    /// Returns true if this order triggers on a stop price.
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        matches!(self, Self::StopMarket | Self::TakeProfitMarket)
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopMarket => write!(f, "STOP_MARKET"),
            Self::TakeProfitMarket => write!(f, "TAKE_PROFIT_MARKET"),
        }
    }
}

/// Exchange-reported order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Resting on the book (or trigger armed).
    Open,
    /// Completely executed.
    Filled,
    /// Canceled before completion.
    Canceled,
    /// Rejected by the exchange.
    Rejected,
    /// Expired without executing.
    Expired,
    /// Status could not be determined; requires verification.
    Unknown,
}

impl OrderStatus {
    /// Terminal statuses never change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }
}

/// Normalized view of an order as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    /// Exchange-assigned order id.
    pub order_id: String,
    /// Client order id, when the exchange echoes it back.
    pub client_order_id: Option<String>,
    /// Trading symbol.
    pub symbol: String,
    /// Book side.
    pub side: OrderSide,
    /// Order type.
    pub kind: OrderKind,
    /// Requested quantity in contracts.
    pub amount: Decimal,
    /// Limit price, if any.
    pub price: Option<Decimal>,
    /// Trigger price for stop / take-profit orders.
    pub stop_price: Option<Decimal>,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Executed quantity.
    pub filled_amount: Decimal,
    /// Volume-weighted fill price, when known.
    pub average_price: Option<Decimal>,
    /// Whether the order may only reduce an open position.
    pub reduce_only: bool,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

impl ExchangeOrder {
    /// Best known execution price: average fill, then limit, then trigger.
    #[must_use]
    pub fn effective_price(&self) -> Option<Decimal> {
        self.average_price
            .filter(|p| !p.is_zero())
            .or(self.price)
            .or(self.stop_price)
    }
}

/// Normalized view of a live position on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Trading symbol.
    pub symbol: String,
    /// Position direction: positive contracts = long.
    pub contracts: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Leverage in effect.
    pub leverage: u32,
    /// Margin currently allocated, when reported.
    pub initial_margin: Option<Decimal>,
    /// Unrealized profit and loss, when reported.
    pub unrealized_pnl: Option<Decimal>,
}

impl ExchangePosition {
    /// Absolute position size in contracts.
    #[must_use]
    pub fn size(&self) -> Decimal {
        self.contracts.abs()
    }

    /// True when the exchange reports no exposure for this symbol.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.contracts.is_zero()
    }
}

/// An order request submitted to the connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Trading symbol.
    pub symbol: String,
    /// Book side.
    pub side: OrderSide,
    /// Order type.
    pub kind: OrderKind,
    /// Quantity in contracts. Zero is permitted only with `close_position`.
    pub amount: Decimal,
    /// Limit price for limit orders.
    pub price: Option<Decimal>,
    /// Trigger price for stop / take-profit orders.
    pub stop_price: Option<Decimal>,
    /// Only reduce an existing position, never open or flip one.
    pub reduce_only: bool,
    /// Close the whole position at trigger (size-independent).
    pub close_position: bool,
    /// Client order id; carries the semantic leg tag.
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// A plain market order.
    #[must_use]
    pub fn market(symbol: impl Into<String>, side: OrderSide, amount: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Market,
            amount,
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
            client_order_id: None,
        }
    }

    /// A reduce-only stop-market order (stop-loss leg).
    #[must_use]
    pub fn stop_market(
        symbol: impl Into<String>,
        side: OrderSide,
        amount: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::StopMarket,
            amount,
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
            close_position: false,
            client_order_id: None,
        }
    }

    /// A reduce-only take-profit market order (take-profit leg).
    #[must_use]
    pub fn take_profit(
        symbol: impl Into<String>,
        side: OrderSide,
        amount: Decimal,
        trigger_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::TakeProfitMarket,
            amount,
            price: None,
            stop_price: Some(trigger_price),
            reduce_only: true,
            close_position: false,
            client_order_id: None,
        }
    }

    /// Attach a client order id.
    #[must_use]
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Result of an accepted order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    /// Exchange-assigned order id.
    pub order_id: String,
    /// Client order id echoed back.
    pub client_order_id: Option<String>,
    /// Lifecycle status at acceptance time.
    pub status: OrderStatus,
    /// Executed quantity so far.
    pub filled_amount: Decimal,
    /// Volume-weighted fill price, when known.
    pub average_price: Option<Decimal>,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Push update for an order, delivered by the connector's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// Exchange-assigned order id.
    pub order_id: String,
    /// Client order id, when known.
    pub client_order_id: Option<String>,
    /// Trading symbol.
    pub symbol: String,
    /// New lifecycle status.
    pub status: OrderStatus,
    /// Executed quantity.
    pub filled_amount: Decimal,
    /// Volume-weighted fill price, when known.
    pub average_price: Option<Decimal>,
    /// Exchange timestamp of the update.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn order_kind_is_triggered() {
        assert!(!OrderKind::Market.is_triggered());
        assert!(!OrderKind::Limit.is_triggered());
        assert!(OrderKind::StopMarket.is_triggered());
        assert!(OrderKind::TakeProfitMarket.is_triggered());
    }

    #[test]
    fn order_status_terminal() {
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::Unknown.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
    }

    #[test]
    fn effective_price_prefers_average_fill() {
        let order = ExchangeOrder {
            order_id: "1".into(),
            client_order_id: None,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Sell,
            kind: OrderKind::TakeProfitMarket,
            amount: dec!(1),
            price: Some(dec!(101)),
            stop_price: Some(dec!(102)),
            status: OrderStatus::Filled,
            filled_amount: dec!(1),
            average_price: Some(dec!(101.5)),
            reduce_only: true,
            timestamp: Utc::now(),
        };
        assert_eq!(order.effective_price(), Some(dec!(101.5)));
    }

    #[test]
    fn effective_price_skips_zero_average() {
        let order = ExchangeOrder {
            order_id: "1".into(),
            client_order_id: None,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Sell,
            kind: OrderKind::StopMarket,
            amount: dec!(1),
            price: None,
            stop_price: Some(dec!(99)),
            status: OrderStatus::Filled,
            filled_amount: dec!(1),
            average_price: Some(Decimal::ZERO),
            reduce_only: true,
            timestamp: Utc::now(),
        };
        assert_eq!(order.effective_price(), Some(dec!(99)));
    }

    #[test]
    fn exchange_position_flat() {
        let pos = ExchangePosition {
            symbol: "ETH/USDT".into(),
            contracts: Decimal::ZERO,
            entry_price: dec!(2000),
            leverage: 5,
            initial_margin: None,
            unrealized_pnl: None,
        };
        assert!(pos.is_flat());
        assert_eq!(pos.size(), Decimal::ZERO);
    }

    #[test]
    fn request_builders_set_leg_flags() {
        let sl = OrderRequest::stop_market("BTC/USDT", OrderSide::Sell, dec!(0.5), dec!(99));
        assert!(sl.reduce_only);
        assert_eq!(sl.kind, OrderKind::StopMarket);
        assert_eq!(sl.stop_price, Some(dec!(99)));

        let tp = OrderRequest::take_profit("BTC/USDT", OrderSide::Sell, dec!(0.5), dec!(102))
            .with_client_id("OCO-TP-abc");
        assert!(tp.reduce_only);
        assert_eq!(tp.client_order_id.as_deref(), Some("OCO-TP-abc"));
    }
}
