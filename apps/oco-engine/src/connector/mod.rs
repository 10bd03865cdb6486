//! Exchange connector boundary.
//!
//! [`Connector`] is the only seam between the engine and a venue. The
//! engine never talks HTTP or websockets itself; a connector implements
//! this trait and normalizes every response into the domain types. The
//! crate ships [`SimConnector`], a deterministic in-memory venue used by
//! the demo binary and the test suite.

mod sim;

pub use sim::SimConnector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::{ExchangeOrder, ExchangePosition, OrderRequest, OrderResult, OrderSide, OrderUpdate};
use crate::error::EngineError;
use crate::resilience::classifier;

/// Connector-level failures, classified later by the resilience layer.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// The venue rejected the request.
    #[error("exchange rejected request: {0}")]
    Rejected(String),

    /// Transport-level failure (connection, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The referenced order does not exist on the venue.
    #[error("unknown order: {0}")]
    OrderNotFound(String),

    /// The referenced symbol is not tradable on the venue.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
}

impl From<ConnectorError> for EngineError {
    fn from(err: ConnectorError) -> Self {
        let message = err.to_string();
        let classification = classifier::classify(&message);
        Self::Exchange {
            category: classification.category,
            message,
        }
    }
}

/// Account balance as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Total equity including unrealized PnL.
    pub total: Decimal,
    /// Balance available for new positions.
    pub available: Decimal,
}

/// One executed trade from the venue's fill history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFill {
    /// Venue trade id.
    pub trade_id: String,
    /// Order that produced this fill, when known.
    pub order_id: Option<String>,
    /// Trading symbol.
    pub symbol: String,
    /// Book side of the fill.
    pub side: OrderSide,
    /// Fill price.
    pub price: Decimal,
    /// Fill quantity.
    pub amount: Decimal,
    /// Fill timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Exchange connector interface.
///
/// Implementations must be safe to call concurrently and must normalize
/// venue responses into the domain types. Cancel operations should map a
/// venue-side "order already gone" response to
/// [`ConnectorError::OrderNotFound`] so callers can treat it as success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Submit an order.
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ConnectorError>;

    /// Cancel one order.
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ConnectorError>;

    /// Cancel every open order for a symbol. Returns the cancel count.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, ConnectorError>;

    /// Fetch one order by exchange or client id.
    async fn fetch_order(&self, order_id: &str, symbol: &str)
    -> Result<ExchangeOrder, ConnectorError>;

    /// Fetch open orders, optionally filtered by symbol.
    async fn fetch_open_orders<'a>(
        &self,
        symbol: Option<&'a str>,
    ) -> Result<Vec<ExchangeOrder>, ConnectorError>;

    /// Fetch all non-flat positions.
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ConnectorError>;

    /// Fetch the position for one symbol, `None` when flat.
    async fn fetch_position(&self, symbol: &str)
    -> Result<Option<ExchangePosition>, ConnectorError>;

    /// Fetch account balance.
    async fn fetch_balance(&self) -> Result<AccountBalance, ConnectorError>;

    /// Fetch the current mark price for a symbol.
    async fn fetch_current_price(&self, symbol: &str) -> Result<Decimal, ConnectorError>;

    /// Fetch recent fills for a symbol, newest last.
    async fn fetch_recent_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<TradeFill>, ConnectorError>;

    /// Round a price to the venue's tick size for the symbol.
    fn price_to_precision(&self, symbol: &str, price: Decimal) -> Decimal;

    /// Round an amount to the venue's step size for the symbol.
    fn amount_to_precision(&self, symbol: &str, amount: Decimal) -> Decimal;

    /// Subscribe to the push stream of order updates.
    fn subscribe_updates(&self) -> broadcast::Receiver<OrderUpdate>;
}
