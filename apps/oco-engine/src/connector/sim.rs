//! Deterministic in-memory venue.
//!
//! Fills market orders instantly at the posted mark price, rests
//! triggered orders until [`SimConnector::trigger_order`] is called, and
//! enforces reduce-only semantics the way a futures venue does. Used by
//! the demo binary and throughout the test suite.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::domain::{
    ExchangeOrder, ExchangePosition, OrderKind, OrderRequest, OrderResult, OrderSide, OrderStatus,
    OrderUpdate,
};

use super::{AccountBalance, Connector, ConnectorError, TradeFill};

#[derive(Debug)]
struct SimState {
    prices: HashMap<String, Decimal>,
    orders: HashMap<String, ExchangeOrder>,
    positions: HashMap<String, ExchangePosition>,
    trades: Vec<TradeFill>,
    balance: Decimal,
    next_order_id: u64,
    next_trade_id: u64,
    fail_create: VecDeque<String>,
    fail_matching: Option<(String, String)>,
}

/// In-memory simulated exchange.
#[derive(Debug)]
pub struct SimConnector {
    state: Mutex<SimState>,
    updates: broadcast::Sender<OrderUpdate>,
}

impl SimConnector {
    /// Create a venue with the given account balance.
    #[must_use]
    pub fn new(balance: Decimal) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(SimState {
                prices: HashMap::new(),
                orders: HashMap::new(),
                positions: HashMap::new(),
                trades: Vec::new(),
                balance,
                next_order_id: 1,
                next_trade_id: 1,
                fail_create: VecDeque::new(),
                fail_matching: None,
            }),
            updates,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post a mark price for a symbol.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    /// Queue a rejection message for the next `create_order` call.
    pub fn fail_next_create(&self, message: &str) {
        self.lock().fail_create.push_back(message.to_string());
    }

    /// Reject every `create_order` whose client id starts with `prefix`,
    /// until cleared with an empty prefix.
    pub fn fail_create_matching(&self, prefix: &str, message: &str) {
        self.lock().fail_matching = if prefix.is_empty() {
            None
        } else {
            Some((prefix.to_string(), message.to_string()))
        };
    }

    /// Signed contract count for a symbol, zero when flat.
    #[must_use]
    pub fn position_size(&self, symbol: &str) -> Decimal {
        self.lock()
            .positions
            .get(symbol)
            .map_or(Decimal::ZERO, |pos| pos.contracts)
    }

    /// Delete a position without a trade, simulating an externally closed
    /// (ghost) position.
    pub fn vanish_position(&self, symbol: &str) {
        self.lock().positions.remove(symbol);
    }

    /// Seed a position directly, simulating one opened outside the engine.
    pub fn seed_position(&self, position: ExchangePosition) {
        self.lock()
            .positions
            .insert(position.symbol.clone(), position);
    }

    /// Fill a resting triggered order at its trigger price.
    ///
    /// # Errors
    ///
    /// Returns `OrderNotFound` when the order is not resting.
    pub fn trigger_order(&self, order_id: &str) -> Result<(), ConnectorError> {
        let update = {
            let mut state = self.lock();
            let order = state
                .orders
                .get(order_id)
                .filter(|o| o.status == OrderStatus::Open)
                .cloned()
                .ok_or_else(|| ConnectorError::OrderNotFound(order_id.to_string()))?;

            let price = order
                .stop_price
                .ok_or_else(|| ConnectorError::Rejected("order has no trigger price".into()))?;

            Self::apply_fill(&mut state, &order.symbol, order.side, order.amount, price, Some(order.order_id.clone()));

            let stored = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| ConnectorError::OrderNotFound(order_id.to_string()))?;
            stored.status = OrderStatus::Filled;
            stored.filled_amount = stored.amount;
            stored.average_price = Some(price);

            OrderUpdate {
                order_id: stored.order_id.clone(),
                client_order_id: stored.client_order_id.clone(),
                symbol: stored.symbol.clone(),
                status: OrderStatus::Filled,
                filled_amount: stored.amount,
                average_price: Some(price),
                timestamp: Utc::now(),
            }
        };
        let _ = self.updates.send(update);
        Ok(())
    }

    /// Number of resting (open) orders across all symbols.
    #[must_use]
    pub fn open_order_count(&self) -> usize {
        self.lock()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .count()
    }

    /// Apply a fill to the venue position and realize PnL into balance.
    fn apply_fill(
        state: &mut SimState,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
        order_id: Option<String>,
    ) {
        let signed = match side {
            OrderSide::Buy => amount,
            OrderSide::Sell => -amount,
        };

        let entry = state.positions.get(symbol).cloned();
        match entry {
            Some(mut pos) => {
                let reduces = (pos.contracts > Decimal::ZERO) != (signed > Decimal::ZERO);
                if reduces {
                    let closed = amount.min(pos.contracts.abs());
                    let direction = if pos.contracts > Decimal::ZERO {
                        Decimal::ONE
                    } else {
                        -Decimal::ONE
                    };
                    let pnl = (price - pos.entry_price) * closed * direction;
                    state.balance += pnl;
                }
                pos.contracts += signed;
                if pos.contracts.is_zero() {
                    state.positions.remove(symbol);
                } else {
                    state.positions.insert(symbol.to_string(), pos);
                }
            }
            None => {
                state.positions.insert(
                    symbol.to_string(),
                    ExchangePosition {
                        symbol: symbol.to_string(),
                        contracts: signed,
                        entry_price: price,
                        leverage: 1,
                        initial_margin: None,
                        unrealized_pnl: None,
                    },
                );
            }
        }

        let trade_id = format!("F-{}", state.next_trade_id);
        state.next_trade_id += 1;
        state.trades.push(TradeFill {
            trade_id,
            order_id,
            symbol: symbol.to_string(),
            side,
            price,
            amount,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ConnectorError> {
        let (result, update) = {
            let mut state = self.lock();

            if let Some(message) = state.fail_create.pop_front() {
                return Err(ConnectorError::Rejected(message));
            }
            if let Some((prefix, message)) = &state.fail_matching {
                let hit = request
                    .client_order_id
                    .as_deref()
                    .is_some_and(|id| id.starts_with(prefix.as_str()));
                if hit {
                    return Err(ConnectorError::Rejected(message.clone()));
                }
            }

            let price = *state
                .prices
                .get(&request.symbol)
                .ok_or_else(|| ConnectorError::InvalidSymbol(request.symbol.clone()))?;

            // Reduce-only orders need live exposure on the opposite side.
            if request.reduce_only || request.close_position {
                let ok = state.positions.get(&request.symbol).is_some_and(|pos| {
                    let closes_long = pos.contracts > Decimal::ZERO && request.side == OrderSide::Sell;
                    let closes_short = pos.contracts < Decimal::ZERO && request.side == OrderSide::Buy;
                    closes_long || closes_short
                });
                if !ok {
                    return Err(ConnectorError::Rejected(
                        "code=-2022 ReduceOnly Order is rejected".into(),
                    ));
                }
            }

            let order_id = format!("SIM-{}", state.next_order_id);
            state.next_order_id += 1;
            let now = Utc::now();

            let (status, filled, average) = match request.kind {
                OrderKind::Market => {
                    let amount = if request.close_position {
                        state
                            .positions
                            .get(&request.symbol)
                            .map_or(Decimal::ZERO, ExchangePosition::size)
                    } else {
                        request.amount
                    };
                    Self::apply_fill(
                        &mut state,
                        &request.symbol,
                        request.side,
                        amount,
                        price,
                        Some(order_id.clone()),
                    );
                    (OrderStatus::Filled, amount, Some(price))
                }
                OrderKind::Limit | OrderKind::StopMarket | OrderKind::TakeProfitMarket => {
                    (OrderStatus::Open, Decimal::ZERO, None)
                }
            };

            state.orders.insert(
                order_id.clone(),
                ExchangeOrder {
                    order_id: order_id.clone(),
                    client_order_id: request.client_order_id.clone(),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    kind: request.kind,
                    amount: request.amount,
                    price: request.price,
                    stop_price: request.stop_price,
                    status,
                    filled_amount: filled,
                    average_price: average,
                    reduce_only: request.reduce_only,
                    timestamp: now,
                },
            );

            let result = OrderResult {
                order_id: order_id.clone(),
                client_order_id: request.client_order_id.clone(),
                status,
                filled_amount: filled,
                average_price: average,
                timestamp: now,
            };
            let update = OrderUpdate {
                order_id,
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                status,
                filled_amount: filled,
                average_price: average,
                timestamp: now,
            };
            (result, update)
        };

        let _ = self.updates.send(update);
        Ok(result)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), ConnectorError> {
        let update = {
            let mut state = self.lock();
            let order = state
                .orders
                .values_mut()
                .find(|o| {
                    o.status == OrderStatus::Open
                        && (o.order_id == order_id
                            || o.client_order_id.as_deref() == Some(order_id))
                })
                .ok_or_else(|| ConnectorError::OrderNotFound(order_id.to_string()))?;
            order.status = OrderStatus::Canceled;
            OrderUpdate {
                order_id: order.order_id.clone(),
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                status: OrderStatus::Canceled,
                filled_amount: order.filled_amount,
                average_price: order.average_price,
                timestamp: Utc::now(),
            }
        };
        let _ = self.updates.send(update);
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, ConnectorError> {
        let mut state = self.lock();
        let mut count = 0;
        for order in state.orders.values_mut() {
            if order.symbol == symbol && order.status == OrderStatus::Open {
                order.status = OrderStatus::Canceled;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        _symbol: &str,
    ) -> Result<ExchangeOrder, ConnectorError> {
        self.lock()
            .orders
            .values()
            .find(|o| o.order_id == order_id || o.client_order_id.as_deref() == Some(order_id))
            .cloned()
            .ok_or_else(|| ConnectorError::OrderNotFound(order_id.to_string()))
    }

    async fn fetch_open_orders<'a>(
        &self,
        symbol: Option<&'a str>,
    ) -> Result<Vec<ExchangeOrder>, ConnectorError> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ConnectorError> {
        Ok(self
            .lock()
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect())
    }

    async fn fetch_position(
        &self,
        symbol: &str,
    ) -> Result<Option<ExchangePosition>, ConnectorError> {
        Ok(self.lock().positions.get(symbol).filter(|p| !p.is_flat()).cloned())
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, ConnectorError> {
        let state = self.lock();
        Ok(AccountBalance {
            total: state.balance,
            available: state.balance,
        })
    }

    async fn fetch_current_price(&self, symbol: &str) -> Result<Decimal, ConnectorError> {
        self.lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ConnectorError::InvalidSymbol(symbol.to_string()))
    }

    async fn fetch_recent_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<TradeFill>, ConnectorError> {
        let state = self.lock();
        let mut fills: Vec<TradeFill> = state
            .trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect();
        let skip = fills.len().saturating_sub(limit);
        Ok(fills.split_off(skip))
    }

    fn price_to_precision(&self, _symbol: &str, price: Decimal) -> Decimal {
        price.round_dp(8)
    }

    fn amount_to_precision(&self, _symbol: &str, amount: Decimal) -> Decimal {
        amount.round_dp(8)
    }

    fn subscribe_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> SimConnector {
        let sim = SimConnector::new(dec!(10000));
        sim.set_price("BTC/USDT", dec!(100));
        sim
    }

    #[tokio::test]
    async fn market_order_fills_and_opens_position() {
        let sim = venue();
        let result = sim
            .create_order(&OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(2)))
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.average_price, Some(dec!(100)));

        let pos = sim.fetch_position("BTC/USDT").await.unwrap().unwrap();
        assert_eq!(pos.contracts, dec!(2));
    }

    #[tokio::test]
    async fn reduce_only_without_position_is_rejected() {
        let sim = venue();
        let err = sim
            .create_order(&OrderRequest::stop_market(
                "BTC/USDT",
                OrderSide::Sell,
                dec!(1),
                dec!(99),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("-2022"));
    }

    #[tokio::test]
    async fn triggered_order_rests_until_triggered() {
        let sim = venue();
        sim.create_order(&OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        let sl = sim
            .create_order(&OrderRequest::stop_market(
                "BTC/USDT",
                OrderSide::Sell,
                dec!(1),
                dec!(99),
            ))
            .await
            .unwrap();
        assert_eq!(sl.status, OrderStatus::Open);
        assert_eq!(sim.open_order_count(), 1);

        sim.trigger_order(&sl.order_id).unwrap();
        assert!(sim.fetch_position("BTC/USDT").await.unwrap().is_none());
        // Long 1 @ 100 stopped at 99: realized -1.
        assert_eq!(sim.fetch_balance().await.unwrap().total, dec!(9999));
    }

    #[tokio::test]
    async fn close_position_mode_flattens_whole_position() {
        let sim = venue();
        sim.create_order(&OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(3)))
            .await
            .unwrap();

        let mut close = OrderRequest::market("BTC/USDT", OrderSide::Sell, Decimal::ZERO);
        close.close_position = true;
        close.reduce_only = true;
        sim.create_order(&close).await.unwrap();

        assert!(sim.fetch_position("BTC/USDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failure_rejects_next_create() {
        let sim = venue();
        sim.fail_next_create("503 Service Unavailable");
        let err = sim
            .create_order(&OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));

        // Next call succeeds.
        assert!(
            sim.create_order(&OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn updates_are_broadcast() {
        let sim = venue();
        let mut rx = sim.subscribe_updates();
        sim.create_order(
            &OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1))
                .with_client_id("OCO-ENTRY-test"),
        )
        .await
        .unwrap();

        let update = rx.try_recv().unwrap();
        assert_eq!(update.client_order_id.as_deref(), Some("OCO-ENTRY-test"));
        assert_eq!(update.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn recent_trades_respect_limit_and_symbol() {
        let sim = venue();
        sim.set_price("ETH/USDT", dec!(2000));
        for _ in 0..3 {
            sim.create_order(&OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1)))
                .await
                .unwrap();
        }
        sim.create_order(&OrderRequest::market("ETH/USDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();

        let fills = sim.fetch_recent_trades("BTC/USDT", 2).await.unwrap();
        assert_eq!(fills.len(), 2);
        assert!(fills.iter().all(|f| f.symbol == "BTC/USDT"));
    }
}
