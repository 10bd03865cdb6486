//! OCO bracket orchestration.
//!
//! One bracket is three orders: a market entry, a reduce-only
//! take-profit trigger and a reduce-only stop-market trigger. The entry
//! must be confirmed filled before either leg is placed, and either both
//! legs end up resting or the whole operation is rolled back, including
//! an emergency close of the naked position. The engine is never left
//! holding exposure without a stop.
//!
//! ```text
//!   entry (market) ──fill──▶ register OPENING
//!                              │
//!                              ├─▶ TP leg ──▶ SL leg ──▶ ACTIVE
//!                              │
//!                              └─▶ any failure: cancel legs,
//!                                  emergency close, remove, error
//! ```

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OcoConfig;
use crate::connector::{Connector, ConnectorError};
use crate::domain::{
    BracketLeg, CloseReason, OrderRequest, OrderStatus, OrderUpdate, Position, PositionStatus,
    PriceSpec, Side,
};
use crate::error::{EngineError, EngineResult};
use crate::position::{OpenPositionRequest, PositionTracker};
use crate::resilience::{IntentTracker, ResilientExecutor, RetryPolicy, classifier};

/// Request to open a bracketed position.
#[derive(Debug, Clone)]
pub struct BracketRequest {
    /// Trading symbol.
    pub symbol: String,
    /// Position direction.
    pub side: Side,
    /// Size in contracts.
    pub amount: Decimal,
    /// Leverage in effect.
    pub leverage: u32,
    /// Take-profit target.
    pub tp: PriceSpec,
    /// Stop-loss target.
    pub sl: PriceSpec,
}

/// Manages the atomic lifecycle of OCO brackets.
pub struct OcoManager {
    connector: Arc<dyn Connector>,
    executor: Arc<ResilientExecutor>,
    intents: Arc<IntentTracker>,
    tracker: Arc<PositionTracker>,
    config: OcoConfig,
    /// Symbols with a bracket operation in flight. Reconciliation skips
    /// these to avoid fighting a half-built bracket.
    in_flight: RwLock<HashSet<String>>,
}

/// Poll interval for the REST side of the fill race.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl OcoManager {
    /// Build a manager over the shared engine plumbing.
    pub fn new(
        connector: Arc<dyn Connector>,
        executor: Arc<ResilientExecutor>,
        intents: Arc<IntentTracker>,
        tracker: Arc<PositionTracker>,
        config: OcoConfig,
    ) -> Self {
        Self {
            connector,
            executor,
            intents,
            tracker,
            config,
            in_flight: RwLock::new(HashSet::new()),
        }
    }

    /// Symbols that currently have a bracket operation in flight.
    #[must_use]
    pub fn pending_symbols(&self) -> HashSet<String> {
        self.in_flight
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open a position with both bracket legs, atomically.
    ///
    /// The whole operation runs under a hard deadline; on expiry or on
    /// any unrecoverable step the rollback path cancels placed legs and
    /// force-closes any naked exposure before the error is returned.
    ///
    /// # Errors
    ///
    /// [`EngineError::OcoAtomicity`] when the bracket could not be
    /// completed and rollback ran, or a validation error before any
    /// order was sent.
    pub async fn create_bracket(&self, req: &BracketRequest) -> EngineResult<Position> {
        if req.amount <= Decimal::ZERO {
            return Err(EngineError::validation("bracket amount must be positive"));
        }
        self.prevalidate_levels(req).await?;

        self.mark_in_flight(&req.symbol);
        let result = tokio::time::timeout(
            self.config.operation_timeout(),
            self.create_bracket_inner(req),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EngineError::Timeout {
                operation: format!("bracket creation for {}", req.symbol),
                elapsed: self.config.operation_timeout(),
            })
        });
        self.clear_in_flight(&req.symbol);

        match result {
            Ok(position) => Ok(position),
            Err(EngineError::Timeout { operation, elapsed }) => {
                // Deadline fired mid-operation; the inner future was
                // dropped, so sweep up whatever it left behind.
                error!(symbol = %req.symbol, ?elapsed, "bracket deadline expired, rolling back");
                self.rollback_symbol(&req.symbol).await;
                Err(EngineError::OcoAtomicity {
                    symbol: req.symbol.clone(),
                    stage: "deadline",
                    message: format!("timeout after {elapsed:?} in {operation}"),
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Resolve both levels against the current mark before any order is
    /// sent. Catches specs that round to zero or cross to the wrong side
    /// of the market while the entry is still abortable for free.
    async fn prevalidate_levels(&self, req: &BracketRequest) -> EngineResult<()> {
        let mark = self.connector.fetch_current_price(&req.symbol).await?;
        for (leg, spec) in [
            (BracketLeg::TakeProfit, req.tp),
            (BracketLeg::StopLoss, req.sl),
        ] {
            let level = self
                .connector
                .price_to_precision(&req.symbol, spec.resolve(req.side, mark, leg));
            if level <= Decimal::ZERO {
                return Err(EngineError::validation(format!(
                    "{leg:?} level {level} is not a tradable price for {}",
                    req.symbol
                )));
            }
        }
        Ok(())
    }

    async fn create_bracket_inner(&self, req: &BracketRequest) -> EngineResult<Position> {
        let op_id = short_id();
        let entry_id = format!("OCO-ENTRY-{op_id}");
        let tp_id = format!("OCO-TP-{op_id}");
        let sl_id = format!("OCO-SL-{op_id}");

        // Subscribe before the entry goes out so its fill cannot slip
        // past between submission and subscription.
        let mut updates = self.connector.subscribe_updates();

        let amount = self.connector.amount_to_precision(&req.symbol, req.amount);
        let entry = OrderRequest::market(&req.symbol, req.side.entry_side(), amount)
            .with_client_id(&entry_id);

        self.intents.register(&entry_id, &entry);
        let submit = self
            .executor
            .call_with_policy(
                &format!("create_order:{}", req.symbol),
                &RetryPolicy::aggressive(),
                || async { Ok(self.connector.create_order(&entry).await?) },
            )
            .await;

        let entry_result = match submit {
            Ok(result) => {
                self.intents.mark_submitted(&entry_id, &result.order_id);
                result
            }
            Err(err) => {
                self.intents.mark_failed(&entry_id, &err.to_string());
                return Err(EngineError::OcoAtomicity {
                    symbol: req.symbol.clone(),
                    stage: "entry",
                    message: err.to_string(),
                });
            }
        };

        let (fill_price, fill_amount) = match self
            .wait_for_fill(&mut updates, &entry_id, &entry_result.order_id, &req.symbol)
            .await
        {
            Ok(fill) => fill,
            Err(err) => {
                warn!(symbol = %req.symbol, %err, "entry fill unconfirmed, rolling back");
                self.cancel_silently(&entry_result.order_id, &req.symbol).await;
                self.rollback_symbol(&req.symbol).await;
                return Err(EngineError::OcoAtomicity {
                    symbol: req.symbol.clone(),
                    stage: "fill-wait",
                    message: err.to_string(),
                });
            }
        };

        let position = match self.tracker.open_position(&OpenPositionRequest {
            symbol: req.symbol.clone(),
            side: req.side,
            entry_price: fill_price,
            amount: fill_amount,
            leverage: req.leverage,
            tp: req.tp,
            sl: req.sl,
            entry_order_id: Some(entry_id.clone()),
        }) {
            Ok(position) => position,
            Err(err) => {
                // The entry already filled; never leave it naked.
                self.emergency_close(&req.symbol, req.side, fill_amount).await;
                return Err(EngineError::OcoAtomicity {
                    symbol: req.symbol.clone(),
                    stage: "validate",
                    message: err.to_string(),
                });
            }
        };

        info!(
            trade_id = %position.trade_id,
            symbol = %req.symbol,
            entry = %fill_price,
            "entry filled, placing bracket legs"
        );

        let tp_request = OrderRequest::take_profit(
            &req.symbol,
            req.side.exit_side(),
            fill_amount,
            self.connector.price_to_precision(&req.symbol, position.tp_level),
        )
        .with_client_id(&tp_id);

        let tp_result = match self.place_leg(&tp_request).await {
            Ok(result) => result,
            Err(err) => {
                self.rollback_bracket(&position, None, &err.to_string()).await;
                return Err(EngineError::OcoAtomicity {
                    symbol: req.symbol.clone(),
                    stage: "tp-leg",
                    message: err.to_string(),
                });
            }
        };

        let sl_request = OrderRequest::stop_market(
            &req.symbol,
            req.side.exit_side(),
            fill_amount,
            self.connector.price_to_precision(&req.symbol, position.sl_level),
        )
        .with_client_id(&sl_id);

        let sl_result = match self.place_leg(&sl_request).await {
            Ok(result) => result,
            Err(err) => {
                self.rollback_bracket(&position, Some((&tp_id, &tp_result.order_id)), &err.to_string())
                    .await;
                return Err(EngineError::OcoAtomicity {
                    symbol: req.symbol.clone(),
                    stage: "sl-leg",
                    message: err.to_string(),
                });
            }
        };

        self.tracker.link_bracket(
            &position.trade_id,
            &tp_id,
            &sl_id,
            Some(&tp_result.order_id),
            Some(&sl_result.order_id),
        )?;
        self.tracker.activate(&position.trade_id)?;

        info!(trade_id = %position.trade_id, symbol = %req.symbol, "bracket active");
        self.tracker
            .get(&position.trade_id)
            .ok_or_else(|| EngineError::Position(format!("position vanished: {}", position.trade_id)))
    }

    /// Place one bracket leg with the leg retry policy. A reduce-only
    /// rejection triggers a single live-size refresh and retry, covering
    /// the case where the venue reports a slightly different fill size
    /// than the entry did.
    async fn place_leg(
        &self,
        request: &OrderRequest,
    ) -> EngineResult<crate::domain::OrderResult> {
        let client_id = request
            .client_order_id
            .clone()
            .ok_or_else(|| EngineError::validation("bracket leg requires a client id"))?;
        let policy = RetryPolicy {
            max_attempts: self.config.leg_retry_attempts,
            initial_backoff: Duration::from_millis(self.config.leg_backoff_ms),
            ..RetryPolicy::bracket_leg()
        };

        self.intents.register(&client_id, request);
        let first = self
            .executor
            .call_with_policy(
                &format!("create_order:{}", request.symbol),
                &policy,
                || async { Ok(self.connector.create_order(request).await?) },
            )
            .await;

        let result = match first {
            Ok(result) => Ok(result),
            Err(err) if classifier::is_reduce_only_rejection(&err.to_string()) => {
                warn!(
                    symbol = %request.symbol,
                    "reduce-only rejection, refreshing live size and retrying once"
                );
                let live = self
                    .connector
                    .fetch_position(&request.symbol)
                    .await
                    .map_err(EngineError::from)?
                    .ok_or(err)?;
                let mut resized = request.clone();
                resized.amount = self
                    .connector
                    .amount_to_precision(&request.symbol, live.size());
                Ok(self.connector.create_order(&resized).await?)
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(result) => {
                self.intents.mark_submitted(&client_id, &result.order_id);
                Ok(result)
            }
            Err(err) => {
                self.intents.mark_failed(&client_id, &err.to_string());
                Err(err)
            }
        }
    }

    /// Race the push stream against REST polling until the entry is
    /// confirmed filled or the fill timeout expires.
    async fn wait_for_fill(
        &self,
        updates: &mut broadcast::Receiver<OrderUpdate>,
        client_id: &str,
        exchange_id: &str,
        symbol: &str,
    ) -> EngineResult<(Decimal, Decimal)> {
        let deadline = Instant::now() + self.config.fill_timeout();
        let mut next_poll = Instant::now() + FILL_POLL_INTERVAL;

        loop {
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout {
                    operation: format!("entry fill wait for {symbol}"),
                    elapsed: self.config.fill_timeout(),
                });
            }

            tokio::select! {
                received = updates.recv() => match received {
                    Ok(update) => {
                        let matches = update.client_order_id.as_deref() == Some(client_id)
                            || update.order_id == exchange_id;
                        if matches && update.status == OrderStatus::Filled {
                            let price = update
                                .average_price
                                .filter(|p| !p.is_zero())
                                .ok_or_else(|| EngineError::Position(
                                    format!("fill without price for {client_id}"),
                                ))?;
                            return Ok((price, update.filled_amount));
                        }
                        if matches && update.status.is_terminal() {
                            return Err(EngineError::exchange(
                                crate::resilience::ErrorCategory::InvalidOrder,
                                format!(
                                    "entry order {client_id} ended {:?} without filling",
                                    update.status
                                ),
                            ));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "order update stream lagged during fill wait");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Stream gone; the REST poll below still covers us.
                        tokio::time::sleep_until(next_poll).await;
                    }
                },
                () = tokio::time::sleep_until(next_poll) => {
                    next_poll = Instant::now() + FILL_POLL_INTERVAL;
                    match self.connector.fetch_order(exchange_id, symbol).await {
                        Ok(order) if order.status == OrderStatus::Filled => {
                            let price = order.effective_price().ok_or_else(|| {
                                EngineError::Position(format!(
                                    "filled order {exchange_id} has no usable price"
                                ))
                            })?;
                            let amount = if order.filled_amount.is_zero() {
                                order.amount
                            } else {
                                order.filled_amount
                            };
                            return Ok((price, amount));
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "fill poll failed, relying on push stream");
                        }
                    }
                }
            }
        }
    }

    /// Move one bracket leg to a new trigger level.
    ///
    /// The position is parked in `Modifying` for the duration so candle
    /// checks and reconciliation leave it alone. A level that rounds to
    /// the current one is a no-op.
    ///
    /// # Errors
    ///
    /// Fails when the position is missing, busy, or the replacement
    /// order cannot be placed.
    pub async fn modify_leg(
        &self,
        trade_id: &str,
        leg: BracketLeg,
        new_level: Decimal,
    ) -> EngineResult<()> {
        let position = self
            .tracker
            .get(trade_id)
            .ok_or_else(|| EngineError::Position(format!("position not found: {trade_id}")))?;

        let rounded = self.connector.price_to_precision(&position.symbol, new_level);
        let (current_level, old_client_id) = match leg {
            BracketLeg::TakeProfit => (position.tp_level, position.tp_order_id.clone()),
            BracketLeg::StopLoss => (position.sl_level, position.sl_order_id.clone()),
        };
        if rounded == current_level {
            return Ok(());
        }
        let old_client_id = old_client_id
            .ok_or_else(|| EngineError::Position(format!("{trade_id} has no {leg:?} leg")))?;

        self.tracker.set_status(trade_id, PositionStatus::Modifying)?;
        self.mark_in_flight(&position.symbol);
        let outcome = self
            .replace_leg(&position, leg, &old_client_id, rounded)
            .await;
        self.clear_in_flight(&position.symbol);

        // Restore the advisory lock whether or not the swap worked; a
        // failure leaves the old leg state recorded in the tracker.
        if let Err(restore) = self.tracker.set_status(trade_id, PositionStatus::Active) {
            warn!(trade_id, %restore, "could not restore ACTIVE after modify");
        }
        outcome
    }

    async fn replace_leg(
        &self,
        position: &Position,
        leg: BracketLeg,
        old_client_id: &str,
        new_level: Decimal,
    ) -> EngineResult<()> {
        self.cancel_silently(old_client_id, &position.symbol).await;
        self.intents.stop_tracking(old_client_id);

        let new_client_id = match leg {
            BracketLeg::TakeProfit => format!("OCO-TP-{}", short_id()),
            BracketLeg::StopLoss => format!("OCO-SL-{}", short_id()),
        };
        let request = match leg {
            BracketLeg::TakeProfit => OrderRequest::take_profit(
                &position.symbol,
                position.side.exit_side(),
                position.amount,
                new_level,
            ),
            BracketLeg::StopLoss => OrderRequest::stop_market(
                &position.symbol,
                position.side.exit_side(),
                position.amount,
                new_level,
            ),
        }
        .with_client_id(&new_client_id);

        let result = self.place_leg(&request).await?;
        self.tracker.relink_leg(
            &position.trade_id,
            leg,
            &new_client_id,
            Some(&result.order_id),
            new_level,
        )?;

        info!(
            trade_id = %position.trade_id,
            ?leg,
            level = %new_level,
            "bracket leg moved"
        );
        Ok(())
    }

    /// Cancel both legs of a position's bracket. Orders already gone on
    /// the venue count as cancelled.
    pub async fn cancel_bracket(&self, position: &Position) {
        for client_id in [position.tp_order_id.as_deref(), position.sl_order_id.as_deref()]
            .into_iter()
            .flatten()
        {
            self.cancel_silently(client_id, &position.symbol).await;
            self.intents.stop_tracking(client_id);
        }
    }

    /// Roll a partially built bracket back: cancel the placed leg, close
    /// the naked position, drop it from the tracker.
    async fn rollback_bracket(
        &self,
        position: &Position,
        placed_tp: Option<(&str, &str)>,
        cause: &str,
    ) {
        error!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            cause,
            "bracket incomplete, rolling back"
        );
        if let Some((client_id, exchange_id)) = placed_tp {
            self.cancel_silently(exchange_id, &position.symbol).await;
            self.intents.stop_tracking(client_id);
        }
        self.emergency_close(&position.symbol, position.side, position.amount)
            .await;
        if let Err(err) = self
            .tracker
            .remove_position(&position.trade_id, crate::domain::CloseReason::Error)
        {
            error!(trade_id = %position.trade_id, %err, "rollback could not remove position");
        }
    }

    /// Best-effort sweep for a symbol after a dropped operation: cancel
    /// resting orders and flatten any exposure.
    async fn rollback_symbol(&self, symbol: &str) {
        if let Err(err) = self.connector.cancel_all_orders(symbol).await {
            warn!(%symbol, %err, "rollback cancel-all failed");
        }
        match self.connector.fetch_position(symbol).await {
            Ok(Some(live)) if !live.is_flat() => {
                let side = if live.contracts > Decimal::ZERO {
                    Side::Long
                } else {
                    Side::Short
                };
                self.emergency_close(symbol, side, live.size()).await;
            }
            Ok(_) => {}
            Err(err) => {
                error!(%symbol, %err, "rollback could not inspect live position");
            }
        }

        // A dropped creation future may have registered the position
        // before it got as far as the bracket legs. Sweep those out so
        // their margin is released with the exposure.
        for position in self.tracker.positions_for(symbol) {
            if position.status == PositionStatus::Opening {
                match self.tracker.remove_position(&position.trade_id, CloseReason::Error) {
                    Ok(_) => {
                        warn!(
                            trade_id = %position.trade_id,
                            %symbol,
                            "tentative position removed during rollback"
                        );
                    }
                    Err(err) => {
                        error!(trade_id = %position.trade_id, %err, "rollback removal failed");
                    }
                }
            }
        }
    }

    /// Flatten a position with a reduce-only market order, falling back
    /// to a close-position order. Talks to the connector directly: this
    /// path must run even when the symbol's breaker is open.
    async fn emergency_close(&self, symbol: &str, side: Side, amount: Decimal) {
        let mut exit = OrderRequest::market(symbol, side.exit_side(), amount);
        exit.reduce_only = true;

        for attempt in 1..=3u32 {
            match self.connector.create_order(&exit).await {
                Ok(_) => {
                    warn!(%symbol, %amount, "emergency close executed");
                    return;
                }
                Err(err) => {
                    error!(%symbol, attempt, %err, "emergency close attempt failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        // Last resort: let the venue close the whole position.
        let mut close_all = OrderRequest::market(symbol, side.exit_side(), Decimal::ZERO);
        close_all.reduce_only = true;
        close_all.close_position = true;
        if let Err(err) = self.connector.create_order(&close_all).await {
            error!(%symbol, %err, "close-position fallback failed, manual intervention needed");
        }
    }

    /// Cancel an order, treating "already gone" as success.
    async fn cancel_silently(&self, order_id: &str, symbol: &str) {
        match self.connector.cancel_order(order_id, symbol).await {
            Ok(()) | Err(ConnectorError::OrderNotFound(_)) => {}
            Err(err) => {
                warn!(%order_id, %symbol, %err, "cancel failed");
            }
        }
    }

    /// Pin a symbol as in flight, for tests that need reconciliation to
    /// observe a half-built bracket.
    #[cfg(test)]
    pub(crate) fn hold_in_flight(&self, symbol: &str) {
        self.mark_in_flight(symbol);
    }

    fn mark_in_flight(&self, symbol: &str) {
        self.in_flight
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string());
    }

    fn clear_in_flight(&self, symbol: &str) {
        self.in_flight
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(symbol);
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SimConnector;
    use crate::resilience::CircuitBreakerConfig;
    use rust_decimal_macros::dec;

    fn manager(connector: Arc<SimConnector>) -> OcoManager {
        let tracker = Arc::new(PositionTracker::new(dec!(10000), 10, 0));
        OcoManager::new(
            connector,
            Arc::new(ResilientExecutor::new(CircuitBreakerConfig::order_flow())),
            Arc::new(IntentTracker::default()),
            tracker,
            OcoConfig {
                fill_timeout_secs: 2,
                operation_timeout_secs: 10,
                leg_retry_attempts: 2,
                leg_backoff_ms: 10,
            },
        )
    }

    fn long_request() -> BracketRequest {
        BracketRequest {
            symbol: "BTC/USDT".into(),
            side: Side::Long,
            amount: dec!(2),
            leverage: 10,
            tp: PriceSpec::Relative(dec!(0.02)),
            sl: PriceSpec::Relative(dec!(0.01)),
        }
    }

    #[tokio::test]
    async fn untradable_level_aborts_before_any_order() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let oco = manager(Arc::clone(&connector));

        let mut req = long_request();
        req.sl = PriceSpec::Absolute(dec!(0));

        let err = oco.create_bracket(&req).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(connector.open_order_count(), 0);
        assert!(connector.position_size("BTC/USDT").is_zero());
    }

    #[tokio::test]
    async fn create_bracket_places_entry_and_both_legs() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let manager = manager(Arc::clone(&connector));

        let position = manager.create_bracket(&long_request()).await.unwrap();

        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!(position.entry_price, dec!(100));
        assert_eq!(position.tp_level, dec!(102));
        assert_eq!(position.sl_level, dec!(99));
        assert!(position.tp_order_id.as_deref().unwrap().starts_with("OCO-TP-"));
        assert!(position.sl_order_id.as_deref().unwrap().starts_with("OCO-SL-"));
        // Two triggers resting on the venue.
        assert_eq!(connector.open_order_count(), 2);
        assert!(manager.pending_symbols().is_empty());
    }

    #[tokio::test]
    async fn failed_leg_rolls_back_and_flattens() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let manager = manager(Arc::clone(&connector));

        // Entry succeeds; every TP leg attempt fails, forcing rollback.
        connector.fail_create_matching("OCO-TP-", "exchange internal error");

        let err = manager.create_bracket(&long_request()).await.unwrap_err();
        match err {
            EngineError::OcoAtomicity { stage, symbol, .. } => {
                assert_eq!(stage, "tp-leg");
                assert_eq!(symbol, "BTC/USDT");
            }
            other => panic!("unexpected {other:?}"),
        }

        // Rollback closed the naked position and dropped the tracker entry.
        assert_eq!(manager.tracker.open_count(), 0);
        let live = connector.position_size("BTC/USDT");
        assert!(live.is_zero());
        assert!(manager.pending_symbols().is_empty());
    }

    #[tokio::test]
    async fn deadline_rollback_drops_tentative_position_and_margin() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let tracker = Arc::new(PositionTracker::new(dec!(10000), 10, 0));
        let manager = OcoManager::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(ResilientExecutor::new(CircuitBreakerConfig::order_flow())),
            Arc::new(IntentTracker::default()),
            Arc::clone(&tracker),
            OcoConfig {
                fill_timeout_secs: 1,
                operation_timeout_secs: 1,
                leg_retry_attempts: 5,
                leg_backoff_ms: 2000,
            },
        );

        // Entry fills, then every TP attempt fails retriably: the leg
        // retry loop outlives the bracket deadline mid-backoff.
        connector.fail_create_matching("OCO-TP-", "503 service unavailable");

        let err = manager.create_bracket(&long_request()).await.unwrap_err();
        match err {
            EngineError::OcoAtomicity { stage, symbol, .. } => {
                assert_eq!(stage, "deadline");
                assert_eq!(symbol, "BTC/USDT");
            }
            other => panic!("unexpected {other:?}"),
        }

        // The sweep removed the half-registered position with its margin,
        // not just the venue-side exposure.
        assert_eq!(tracker.open_count(), 0);
        assert!(tracker.balance().blocked.is_zero());
        assert!(connector.position_size("BTC/USDT").is_zero());
        assert_eq!(connector.open_order_count(), 0);
        assert!(manager.pending_symbols().is_empty());
    }

    #[tokio::test]
    async fn sl_leg_failure_cancels_placed_tp() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let manager = manager(Arc::clone(&connector));
        connector.fail_create_matching("OCO-SL-", "exchange internal error");

        let err = manager.create_bracket(&long_request()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::OcoAtomicity { stage: "sl-leg", .. }
        ));
        // The TP trigger was cancelled during rollback.
        assert_eq!(connector.open_order_count(), 0);
        assert_eq!(manager.tracker.open_count(), 0);
    }

    #[tokio::test]
    async fn modify_leg_replaces_order_and_restores_active() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let manager = manager(Arc::clone(&connector));

        let position = manager.create_bracket(&long_request()).await.unwrap();
        let old_sl = position.sl_order_id.clone().unwrap();

        manager
            .modify_leg(&position.trade_id, BracketLeg::StopLoss, dec!(99.5))
            .await
            .unwrap();

        let updated = manager.tracker.get(&position.trade_id).unwrap();
        assert_eq!(updated.status, PositionStatus::Active);
        assert_eq!(updated.sl_level, dec!(99.5));
        assert_ne!(updated.sl_order_id.unwrap(), old_sl);
        // Still exactly two triggers resting.
        assert_eq!(connector.open_order_count(), 2);
    }

    #[tokio::test]
    async fn modify_to_same_level_is_noop() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let manager = manager(Arc::clone(&connector));

        let position = manager.create_bracket(&long_request()).await.unwrap();
        let old_tp = position.tp_order_id.clone().unwrap();

        manager
            .modify_leg(&position.trade_id, BracketLeg::TakeProfit, dec!(102))
            .await
            .unwrap();

        let updated = manager.tracker.get(&position.trade_id).unwrap();
        assert_eq!(updated.tp_order_id.unwrap(), old_tp);
    }

    #[tokio::test]
    async fn cancel_bracket_tolerates_missing_orders() {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let manager = manager(Arc::clone(&connector));

        let position = manager.create_bracket(&long_request()).await.unwrap();
        manager.cancel_bracket(&position).await;
        // Second cancel hits OrderNotFound on both legs and stays quiet.
        manager.cancel_bracket(&position).await;
        assert_eq!(connector.open_order_count(), 0);
    }
}
