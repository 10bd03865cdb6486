//! State reconciliation against the exchange.
//!
//! The tracker is a shadow copy; the exchange is the truth. Each pass
//! fetches live positions and open orders in one batch, then repairs
//! four divergence classes:
//!
//! * ghost: tracked locally, gone on the exchange. Investigated through
//!   the TP order, then the SL order, then a deep trade search; only a
//!   position whose exit genuinely cannot be found is dropped without a
//!   trade record.
//! * naked: tracked and live, but missing a bracket leg. Force-closed;
//!   exposure without a stop is never left standing.
//! * unknown: live on the exchange with no local counterpart. Adopted
//!   when it carries exactly one take-profit and one stop-loss order,
//!   force-closed otherwise.
//! * orphan: a reduce-only order whose position is gone. Cancelled.
//!
//! A safety valve guards the pathological case where the exchange
//! reports nothing while many positions are tracked locally: the pass
//! re-fetches a few times, then halts trading rather than mass-deleting
//! state that is probably fine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ReconciliationConfig;
use crate::connector::{Connector, ConnectorError};
use crate::domain::{
    CloseOutcome, CloseReason, ExchangeOrder, ExchangePosition, OrderKind, OrderRequest,
    OrderStatus, Position, PositionStatus, Side, liquidation_level,
};
use crate::error::{EngineError, EngineResult};
use crate::oco::OcoManager;
use crate::position::PositionTracker;

/// Outcome counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconReport {
    /// Local positions examined.
    pub checked: usize,
    /// Ghosts whose exit was found and confirmed.
    pub ghosts_resolved: usize,
    /// Ghosts dropped without a discoverable exit.
    pub ghosts_removed: usize,
    /// Positions force-closed for a missing bracket leg.
    pub naked_closed: usize,
    /// Unknown exchange positions adopted into tracking.
    pub unknowns_adopted: usize,
    /// Unknown exchange positions force-closed as unhealthy.
    pub unknowns_closed: usize,
    /// Orphan reduce-only orders cancelled.
    pub orphans_canceled: usize,
    /// Repairs that themselves failed.
    pub errors: usize,
    /// Whether this pass tripped the safety valve.
    pub halted: bool,
}

impl ReconReport {
    /// True when the pass changed nothing.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.ghosts_resolved == 0
            && self.ghosts_removed == 0
            && self.naked_closed == 0
            && self.unknowns_adopted == 0
            && self.unknowns_closed == 0
            && self.orphans_canceled == 0
            && self.errors == 0
            && !self.halted
    }
}

/// Client id prefix carried by take-profit legs.
const TP_PREFIX: &str = "OCO-TP-";
/// Client id prefix carried by stop-loss legs.
const SL_PREFIX: &str = "OCO-SL-";
/// Delay between safety valve re-fetches.
const SAFETY_REFETCH_DELAY: Duration = Duration::from_millis(500);

/// Reconciles tracked state against the exchange.
pub struct ReconciliationService {
    connector: Arc<dyn Connector>,
    tracker: Arc<PositionTracker>,
    oco: Arc<OcoManager>,
    config: ReconciliationConfig,
    halted: AtomicBool,
}

impl ReconciliationService {
    /// Build a service over the shared engine plumbing.
    pub fn new(
        connector: Arc<dyn Connector>,
        tracker: Arc<PositionTracker>,
        oco: Arc<OcoManager>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            connector,
            tracker,
            oco,
            config,
            halted: AtomicBool::new(false),
        }
    }

    /// Whether a past pass halted trading.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Clear a halt after manual review.
    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
        info!("reconciliation halt cleared");
    }

    /// Run one full reconciliation pass.
    ///
    /// # Errors
    ///
    /// [`EngineError::Halted`] when trading is already halted, or an
    /// exchange error when the initial batched fetch fails. Individual
    /// repair failures are counted in the report, not returned.
    pub async fn run(&self) -> EngineResult<ReconReport> {
        if self.is_halted() {
            return Err(EngineError::Halted);
        }

        let mut report = ReconReport::default();
        let local = self.tracker.positions();
        report.checked = local.len();

        let mut exchange_positions = self.connector.fetch_positions().await?;

        // Safety valve: many tracked positions against an empty exchange
        // snapshot smells like a bad API response, not twelve
        // simultaneous closes. Re-fetch before believing it.
        if local.len() >= self.config.safety_threshold && exchange_positions.is_empty() {
            let mut confirmed_empty = true;
            for attempt in 1..=self.config.safety_retries {
                tokio::time::sleep(SAFETY_REFETCH_DELAY).await;
                match self.connector.fetch_positions().await {
                    Ok(refetched) if refetched.is_empty() => {
                        warn!(attempt, "safety valve re-fetch still empty");
                    }
                    Ok(refetched) => {
                        exchange_positions = refetched;
                        confirmed_empty = false;
                        break;
                    }
                    Err(err) => {
                        warn!(attempt, %err, "safety valve re-fetch failed");
                    }
                }
            }
            if confirmed_empty {
                error!(
                    local = local.len(),
                    threshold = self.config.safety_threshold,
                    "exchange reports no positions, halting instead of mass-deleting"
                );
                self.halted.store(true, Ordering::SeqCst);
                report.halted = true;
                return Ok(report);
            }
        }

        let open_orders = self.connector.fetch_open_orders(None).await?;
        let in_flight = self.oco.pending_symbols();
        let window = self.config.protection_window();
        let now = Utc::now();

        for position in &local {
            if in_flight.contains(&position.symbol) {
                continue;
            }
            if now - position.entry_time < window {
                continue;
            }
            if position.status.is_transitional() {
                continue;
            }

            let live = exchange_positions
                .iter()
                .find(|p| p.symbol == position.symbol && !p.is_flat());

            match live {
                None => {
                    if let Err(err) = self.handle_ghost(position, &mut report).await {
                        error!(trade_id = %position.trade_id, %err, "ghost repair failed");
                        report.errors += 1;
                    }
                }
                Some(_) => {
                    if !self.has_live_bracket(position, &open_orders) {
                        if let Err(err) = self.handle_naked(position, &mut report).await {
                            error!(trade_id = %position.trade_id, %err, "naked repair failed");
                            report.errors += 1;
                        }
                    }
                }
            }
        }

        for live in &exchange_positions {
            if live.is_flat()
                || in_flight.contains(&live.symbol)
                || self
                    .tracker
                    .positions_for(&live.symbol)
                    .iter()
                    .any(|p| !p.status.is_transitional())
            {
                continue;
            }
            if let Err(err) = self.handle_unknown(live, &open_orders, &mut report).await {
                error!(symbol = %live.symbol, %err, "unknown position repair failed");
                report.errors += 1;
            }
        }

        self.cancel_orphans(&open_orders, &exchange_positions, &mut report)
            .await;

        if !report.is_clean() {
            info!(?report, "reconciliation pass repaired divergences");
        }
        Ok(report)
    }

    /// A position is gone on the exchange. Find out how before deciding
    /// what to record: filled TP, filled SL, then the trade history.
    async fn handle_ghost(&self, position: &Position, report: &mut ReconReport) -> EngineResult<()> {
        warn!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            "position tracked locally but gone on exchange"
        );

        let exit = self.investigate_ghost(position).await;
        self.cancel_position_legs(position).await;

        match exit {
            Some((reason, price)) => {
                let pnl = (price - position.entry_price) * position.amount * position.side.direction();
                match self
                    .tracker
                    .confirm_close(&position.trade_id, price, reason, pnl, Decimal::ZERO)?
                {
                    CloseOutcome::Closed(_) => report.ghosts_resolved += 1,
                    CloseOutcome::AlreadyClosed => {}
                }
            }
            None => {
                self.tracker
                    .remove_position(&position.trade_id, CloseReason::Ghost)?;
                report.ghosts_removed += 1;
            }
        }
        Ok(())
    }

    async fn investigate_ghost(&self, position: &Position) -> Option<(CloseReason, Decimal)> {
        // TP leg first: the common happy path for a vanished position.
        if let Some(price) = self
            .leg_fill_price(position, position.exchange_tp_id.as_deref(), position.tp_order_id.as_deref())
            .await
        {
            return Some((CloseReason::TakeProfit, price.unwrap_or(position.tp_level)));
        }
        if let Some(price) = self
            .leg_fill_price(position, position.exchange_sl_id.as_deref(), position.sl_order_id.as_deref())
            .await
        {
            return Some((CloseReason::StopLoss, price.unwrap_or(position.sl_level)));
        }

        // Deep search: newest exit-side trade at or after entry.
        match self
            .connector
            .fetch_recent_trades(&position.symbol, self.config.deep_search_limit)
            .await
        {
            Ok(trades) => trades
                .iter()
                .rev()
                .find(|t| t.side == position.side.exit_side() && t.timestamp >= position.entry_time)
                .map(|t| (CloseReason::Ghost, t.price)),
            Err(err) => {
                warn!(symbol = %position.symbol, %err, "deep trade search failed");
                None
            }
        }
    }

    /// Fetch one leg and report whether it filled. `Ok(Some(None))`
    /// means filled at an unknown price.
    async fn leg_fill_price(
        &self,
        position: &Position,
        exchange_id: Option<&str>,
        client_id: Option<&str>,
    ) -> Option<Option<Decimal>> {
        let id = exchange_id.or(client_id)?;
        match self.connector.fetch_order(id, &position.symbol).await {
            Ok(order) if order.status == OrderStatus::Filled => Some(order.effective_price()),
            Ok(_) => None,
            Err(ConnectorError::OrderNotFound(_)) => None,
            Err(err) => {
                warn!(%id, %err, "leg lookup failed during ghost investigation");
                None
            }
        }
    }

    fn has_live_bracket(&self, position: &Position, open_orders: &[ExchangeOrder]) -> bool {
        let leg_open = |client: Option<&str>, exchange: Option<&str>| {
            open_orders.iter().any(|o| {
                o.status == OrderStatus::Open
                    && (o.client_order_id.as_deref() == client && client.is_some()
                        || Some(o.order_id.as_str()) == exchange)
            })
        };
        leg_open(position.tp_order_id.as_deref(), position.exchange_tp_id.as_deref())
            && leg_open(position.sl_order_id.as_deref(), position.exchange_sl_id.as_deref())
    }

    /// A live position is missing at least one bracket leg. Running
    /// unprotected exposure is worse than taking the exit, so close it.
    async fn handle_naked(&self, position: &Position, report: &mut ReconReport) -> EngineResult<()> {
        warn!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            "bracket leg missing on exchange, force closing"
        );
        self.cancel_position_legs(position).await;
        let price = self.force_close(&position.symbol, position.side, position.amount).await?;
        let pnl = (price - position.entry_price) * position.amount * position.side.direction();
        self.tracker
            .confirm_close(&position.trade_id, price, CloseReason::Forced, pnl, Decimal::ZERO)?;
        report.naked_closed += 1;
        Ok(())
    }

    /// An exchange position nobody tracks. Healthy means exactly one TP
    /// and one SL order protecting it; anything else gets closed.
    async fn handle_unknown(
        &self,
        live: &ExchangePosition,
        open_orders: &[ExchangeOrder],
        report: &mut ReconReport,
    ) -> EngineResult<()> {
        let side = if live.contracts > Decimal::ZERO {
            Side::Long
        } else {
            Side::Short
        };
        let brackets = classify_bracket_orders(live, side, open_orders);

        // A limit TP carries its level in `price`, not `stop_price`.
        let resolved = brackets.and_then(|(tp, sl)| {
            let tp_level = tp.stop_price.or(tp.price)?;
            let sl_level = sl.stop_price.or(sl.price)?;
            (tp_level > Decimal::ZERO && sl_level > Decimal::ZERO)
                .then_some((tp, sl, tp_level, sl_level))
        });

        match resolved {
            Some((tp, sl, tp_level, sl_level)) => {
                let amount = live.size();
                let notional = amount * live.entry_price;
                let leverage = live.leverage.max(1);

                let position = Position {
                    trade_id: format!("REC-{}", &Uuid::new_v4().simple().to_string()[..12]),
                    symbol: live.symbol.clone(),
                    side,
                    entry_price: live.entry_price,
                    amount,
                    notional,
                    margin_used: notional / Decimal::from(leverage),
                    leverage,
                    tp_level,
                    sl_level,
                    liquidation_level: liquidation_level(side, live.entry_price, leverage),
                    entry_time: Utc::now(),
                    bars_held: 0,
                    status: PositionStatus::Active,
                    entry_order_id: None,
                    tp_order_id: tp.client_order_id.clone(),
                    sl_order_id: sl.client_order_id.clone(),
                    exchange_tp_id: Some(tp.order_id.clone()),
                    exchange_sl_id: Some(sl.order_id.clone()),
                    pending_exit: None,
                    recovered: true,
                };
                let adopted = self.tracker.adopt_position(position)?;
                info!(
                    trade_id = %adopted.trade_id,
                    symbol = %live.symbol,
                    "healthy unknown position adopted"
                );
                report.unknowns_adopted += 1;
            }
            None => {
                warn!(
                    symbol = %live.symbol,
                    "unknown position without a clean bracket, force closing"
                );
                for order in open_orders.iter().filter(|o| {
                    o.symbol == live.symbol && o.reduce_only && o.status == OrderStatus::Open
                }) {
                    self.cancel_silently(&order.order_id, &order.symbol).await;
                }
                self.force_close(&live.symbol, side, live.size()).await?;
                report.unknowns_closed += 1;
            }
        }
        Ok(())
    }

    /// Cancel reduce-only orders whose position is gone everywhere.
    async fn cancel_orphans(
        &self,
        open_orders: &[ExchangeOrder],
        exchange_positions: &[ExchangePosition],
        report: &mut ReconReport,
    ) {
        for order in open_orders {
            if order.status != OrderStatus::Open || !order.reduce_only {
                continue;
            }
            let has_exchange = exchange_positions
                .iter()
                .any(|p| p.symbol == order.symbol && !p.is_flat());
            let has_local = !self.tracker.positions_for(&order.symbol).is_empty();
            if has_exchange || has_local {
                continue;
            }
            warn!(
                order_id = %order.order_id,
                symbol = %order.symbol,
                "orphan reduce-only order, cancelling"
            );
            self.cancel_silently(&order.order_id, &order.symbol).await;
            report.orphans_canceled += 1;
        }
    }

    async fn cancel_position_legs(&self, position: &Position) {
        for id in [
            position.exchange_tp_id.as_deref().or(position.tp_order_id.as_deref()),
            position.exchange_sl_id.as_deref().or(position.sl_order_id.as_deref()),
        ]
        .into_iter()
        .flatten()
        {
            self.cancel_silently(id, &position.symbol).await;
        }
    }

    async fn cancel_silently(&self, order_id: &str, symbol: &str) {
        match self.connector.cancel_order(order_id, symbol).await {
            Ok(()) | Err(ConnectorError::OrderNotFound(_)) => {}
            Err(err) => {
                warn!(%order_id, %symbol, %err, "cancel failed during reconciliation");
            }
        }
    }

    /// Flatten exposure with a reduce-only market order and report the
    /// fill price (mark price when the venue does not echo one).
    async fn force_close(&self, symbol: &str, side: Side, amount: Decimal) -> EngineResult<Decimal> {
        let mut request = OrderRequest::market(symbol, side.exit_side(), amount);
        request.reduce_only = true;
        let result = self.connector.create_order(&request).await?;
        match result.average_price.filter(|p| !p.is_zero()) {
            Some(price) => Ok(price),
            None => Ok(self.connector.fetch_current_price(symbol).await?),
        }
    }
}

/// Identify exactly one TP and one SL order protecting a position.
///
/// Semantic client id prefixes are authoritative; positions opened by
/// another tool fall back to a side/kind/price heuristic.
fn classify_bracket_orders<'a>(
    live: &ExchangePosition,
    side: Side,
    open_orders: &'a [ExchangeOrder],
) -> Option<(&'a ExchangeOrder, &'a ExchangeOrder)> {
    let relevant: Vec<&ExchangeOrder> = open_orders
        .iter()
        .filter(|o| {
            o.symbol == live.symbol
                && o.status == OrderStatus::Open
                && o.reduce_only
                && o.side == side.exit_side()
        })
        .collect();

    let tagged_tp: Vec<&&ExchangeOrder> = relevant
        .iter()
        .filter(|o| o.client_order_id.as_deref().is_some_and(|id| id.starts_with(TP_PREFIX)))
        .collect();
    let tagged_sl: Vec<&&ExchangeOrder> = relevant
        .iter()
        .filter(|o| o.client_order_id.as_deref().is_some_and(|id| id.starts_with(SL_PREFIX)))
        .collect();
    if tagged_tp.len() == 1 && tagged_sl.len() == 1 && relevant.len() == 2 {
        return Some((*tagged_tp[0], *tagged_sl[0]));
    }
    if !tagged_tp.is_empty() || !tagged_sl.is_empty() {
        // Tagged but not exactly one of each: not a clean bracket.
        return None;
    }

    // Untagged heuristic: a take-profit sits on the profitable side of
    // entry, a stop on the losing side.
    if relevant.len() != 2 {
        return None;
    }
    let is_tp = |o: &ExchangeOrder| {
        let trigger = o.stop_price.or(o.price)?;
        let profitable = match side {
            Side::Long => trigger > live.entry_price,
            Side::Short => trigger < live.entry_price,
        };
        Some(profitable || o.kind == OrderKind::TakeProfitMarket)
    };
    match (is_tp(relevant[0]), is_tp(relevant[1])) {
        (Some(true), Some(false)) => Some((relevant[0], relevant[1])),
        (Some(false), Some(true)) => Some((relevant[1], relevant[0])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OcoConfig;
    use crate::connector::SimConnector;
    use crate::domain::{Candle, PriceSpec};
    use crate::resilience::{CircuitBreakerConfig, IntentTracker, ResilientExecutor};
    use rust_decimal_macros::dec;

    fn recon_config() -> ReconciliationConfig {
        ReconciliationConfig {
            interval_secs: 300,
            safety_threshold: 5,
            safety_retries: 2,
            protection_window_secs: 0,
            deep_search_limit: 20,
            drift_threshold: dec!(0.1),
            ..ReconciliationConfig::default()
        }
    }

    struct Harness {
        connector: Arc<SimConnector>,
        tracker: Arc<PositionTracker>,
        oco: Arc<OcoManager>,
        recon: ReconciliationService,
    }

    fn harness() -> Harness {
        let connector = Arc::new(SimConnector::new(dec!(100000)));
        connector.set_price("BTC/USDT", dec!(100));
        let tracker = Arc::new(PositionTracker::new(dec!(10000), 20, 0));
        let oco = Arc::new(OcoManager::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(ResilientExecutor::new(CircuitBreakerConfig::order_flow())),
            Arc::new(IntentTracker::default()),
            Arc::clone(&tracker),
            OcoConfig {
                fill_timeout_secs: 2,
                operation_timeout_secs: 10,
                leg_retry_attempts: 2,
                leg_backoff_ms: 10,
            },
        ));
        let recon = ReconciliationService::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&tracker),
            Arc::clone(&oco),
            recon_config(),
        );
        Harness {
            connector,
            tracker,
            oco,
            recon,
        }
    }

    async fn open_long(h: &Harness) -> Position {
        h.oco
            .create_bracket(&crate::oco::BracketRequest {
                symbol: "BTC/USDT".into(),
                side: Side::Long,
                amount: dec!(2),
                leverage: 10,
                tp: PriceSpec::Relative(dec!(0.02)),
                sl: PriceSpec::Relative(dec!(0.01)),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn batched_fetch_failure_propagates() {
        use crate::connector::MockConnector;

        let mut mock = MockConnector::new();
        mock.expect_fetch_positions()
            .returning(|| Err(ConnectorError::Transport("connection reset by peer".into())));
        let connector: Arc<dyn Connector> = Arc::new(mock);

        let tracker = Arc::new(PositionTracker::new(dec!(10000), 20, 0));
        let oco = Arc::new(OcoManager::new(
            Arc::clone(&connector),
            Arc::new(ResilientExecutor::new(CircuitBreakerConfig::order_flow())),
            Arc::new(IntentTracker::default()),
            Arc::clone(&tracker),
            OcoConfig::default(),
        ));
        let recon =
            ReconciliationService::new(connector, tracker, oco, recon_config());

        let err = recon.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Exchange { .. }));
        // A failed fetch never halts trading on its own.
        assert!(!recon.is_halted());
    }

    #[tokio::test]
    async fn clean_state_reconciles_clean() {
        let h = harness();
        open_long(&h).await;
        let report = h.recon.run().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.checked, 1);
    }

    #[tokio::test]
    async fn ghost_resolved_through_filled_tp() {
        let h = harness();
        let position = open_long(&h).await;

        // TP triggers on the venue: position flattens, SL keeps resting.
        h.connector
            .trigger_order(position.exchange_tp_id.as_deref().unwrap())
            .unwrap();

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.ghosts_resolved, 1);
        assert_eq!(report.ghosts_removed, 0);
        assert_eq!(h.tracker.open_count(), 0);
        // SL was cancelled during repair.
        assert_eq!(h.connector.open_order_count(), 0);

        let history = h.tracker.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, CloseReason::TakeProfit);
        assert_eq!(history[0].exit_price, dec!(102));
        assert_eq!(history[0].pnl, dec!(4));
    }

    #[tokio::test]
    async fn unexplained_ghost_is_removed_without_history() {
        let h = harness();
        let position = open_long(&h).await;

        // Position disappears with both legs cancelled server-side and no
        // trade trail.
        h.connector.vanish_position("BTC/USDT");
        h.connector
            .cancel_order(position.exchange_tp_id.as_deref().unwrap(), "BTC/USDT")
            .await
            .unwrap();
        h.connector
            .cancel_order(position.exchange_sl_id.as_deref().unwrap(), "BTC/USDT")
            .await
            .unwrap();

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.ghosts_removed, 1);
        assert_eq!(h.tracker.open_count(), 0);
        assert!(h.tracker.history().is_empty());
        assert_eq!(h.tracker.stats().errors, 1);
    }

    #[tokio::test]
    async fn safety_valve_halts_instead_of_mass_deleting() {
        let h = harness();
        for _ in 0..6 {
            open_long(&h).await;
        }
        // All venue positions vanish at once: a bad snapshot, not six
        // real closes.
        h.connector.vanish_position("BTC/USDT");

        // vanish removes the single netted position; local count is 6.
        let report = h.recon.run().await.unwrap();
        assert!(report.halted);
        assert_eq!(report.ghosts_removed, 0);
        assert_eq!(h.tracker.open_count(), 6);
        assert!(h.recon.is_halted());

        // A halted service refuses further passes until cleared.
        assert!(matches!(h.recon.run().await, Err(EngineError::Halted)));
        h.recon.clear_halt();
        assert!(!h.recon.is_halted());
    }

    #[tokio::test]
    async fn naked_position_is_force_closed() {
        let h = harness();
        let position = open_long(&h).await;

        // Both legs vanish but the position survives.
        h.connector
            .cancel_order(position.exchange_tp_id.as_deref().unwrap(), "BTC/USDT")
            .await
            .unwrap();
        h.connector
            .cancel_order(position.exchange_sl_id.as_deref().unwrap(), "BTC/USDT")
            .await
            .unwrap();

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.naked_closed, 1);
        assert_eq!(h.tracker.open_count(), 0);
        assert!(h.connector.position_size("BTC/USDT").is_zero());
        assert_eq!(h.tracker.history()[0].reason, CloseReason::Forced);
    }

    #[tokio::test]
    async fn healthy_unknown_position_is_adopted() {
        let h = harness();
        h.connector.seed_position(ExchangePosition {
            symbol: "BTC/USDT".into(),
            contracts: dec!(2),
            entry_price: dec!(100),
            leverage: 10,
            initial_margin: None,
            unrealized_pnl: None,
        });
        let tp = OrderRequest::take_profit("BTC/USDT", crate::domain::OrderSide::Sell, dec!(2), dec!(102))
            .with_client_id("OCO-TP-external1");
        let sl = OrderRequest::stop_market("BTC/USDT", crate::domain::OrderSide::Sell, dec!(2), dec!(99))
            .with_client_id("OCO-SL-external1");
        h.connector.create_order(&tp).await.unwrap();
        h.connector.create_order(&sl).await.unwrap();

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.unknowns_adopted, 1);
        assert_eq!(h.tracker.open_count(), 1);

        let adopted = &h.tracker.positions()[0];
        assert!(adopted.recovered);
        assert_eq!(adopted.tp_level, dec!(102));
        assert_eq!(adopted.sl_level, dec!(99));
        assert_eq!(adopted.side, Side::Long);
        assert_eq!(h.tracker.stats().recovered, 1);
    }

    #[tokio::test]
    async fn adoption_reads_limit_leg_level_from_price() {
        let h = harness();
        h.connector.seed_position(ExchangePosition {
            symbol: "BTC/USDT".into(),
            contracts: dec!(2),
            entry_price: dec!(100),
            leverage: 10,
            initial_margin: None,
            unrealized_pnl: None,
        });
        // A TP resting as a plain limit order: level in `price`, no
        // trigger price at all.
        let tp = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: crate::domain::OrderSide::Sell,
            kind: crate::domain::OrderKind::Limit,
            amount: dec!(2),
            price: Some(dec!(102)),
            stop_price: None,
            reduce_only: true,
            close_position: false,
            client_order_id: Some("OCO-TP-limitleg1".into()),
        };
        let sl = OrderRequest::stop_market("BTC/USDT", crate::domain::OrderSide::Sell, dec!(2), dec!(99))
            .with_client_id("OCO-SL-limitleg1");
        h.connector.create_order(&tp).await.unwrap();
        h.connector.create_order(&sl).await.unwrap();

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.unknowns_adopted, 1);

        let adopted = &h.tracker.positions()[0];
        assert_eq!(adopted.tp_level, dec!(102));
        assert_eq!(adopted.sl_level, dec!(99));
        // A zero TP level would make any candle high look like a touch.
        assert!(h
            .tracker
            .check_candle("BTC/USDT", &Candle::new(dec!(100), dec!(101), dec!(100), dec!(101)))
            .is_empty());
    }

    #[tokio::test]
    async fn unhealthy_unknown_position_is_closed() {
        let h = harness();
        h.connector.seed_position(ExchangePosition {
            symbol: "BTC/USDT".into(),
            contracts: dec!(2),
            entry_price: dec!(100),
            leverage: 10,
            initial_margin: None,
            unrealized_pnl: None,
        });
        // Only a stop: not a full bracket, so not adoptable.
        let sl = OrderRequest::stop_market("BTC/USDT", crate::domain::OrderSide::Sell, dec!(2), dec!(99))
            .with_client_id("OCO-SL-external2");
        h.connector.create_order(&sl).await.unwrap();

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.unknowns_closed, 1);
        assert_eq!(report.unknowns_adopted, 0);
        assert_eq!(h.tracker.open_count(), 0);
        assert!(h.connector.position_size("BTC/USDT").is_zero());
        assert_eq!(h.connector.open_order_count(), 0);
    }

    #[tokio::test]
    async fn orphan_reduce_only_order_is_cancelled() {
        let h = harness();
        h.connector.seed_position(ExchangePosition {
            symbol: "BTC/USDT".into(),
            contracts: dec!(1),
            entry_price: dec!(100),
            leverage: 1,
            initial_margin: None,
            unrealized_pnl: None,
        });
        let sl = OrderRequest::stop_market("BTC/USDT", crate::domain::OrderSide::Sell, dec!(1), dec!(95));
        h.connector.create_order(&sl).await.unwrap();
        h.connector.vanish_position("BTC/USDT");

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.orphans_canceled, 1);
        assert_eq!(h.connector.open_order_count(), 0);
    }

    #[tokio::test]
    async fn in_flight_symbols_are_left_alone() {
        let h = harness();
        h.connector.seed_position(ExchangePosition {
            symbol: "BTC/USDT".into(),
            contracts: dec!(2),
            entry_price: dec!(100),
            leverage: 10,
            initial_margin: None,
            unrealized_pnl: None,
        });
        // Simulate a bracket mid-build for the symbol.
        h.oco.hold_in_flight("BTC/USDT");

        let report = h.recon.run().await.unwrap();
        assert_eq!(report.unknowns_closed, 0);
        assert_eq!(report.unknowns_adopted, 0);
        assert!(!h.connector.position_size("BTC/USDT").is_zero());
    }
}
