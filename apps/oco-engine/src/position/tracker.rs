//! Position tracker: the engine's shadow copy of exchange state.
//!
//! The tracker is the sole owner of open positions, realized statistics
//! and the balance ledger; everything mutates under one lock so the
//! blocked-capital invariant holds at every observable point.
//!
//! `confirm_close` is the only place realized stats change, and it is
//! idempotent: double confirmation of the same trade is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::PoisonError;
use std::sync::RwLock;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::balance::{BalanceManager, BalanceSnapshot};
use crate::domain::{
    BracketLeg, Candle, CloseOutcome, CloseReason, ClosedTrade, ExitSignal, OrderUpdate,
    PendingExit, Position, PositionStatus, PriceSpec, Side, liquidation_level,
};
use crate::error::{EngineError, EngineResult};

/// Request to register a freshly filled entry as a position.
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    /// Trading symbol.
    pub symbol: String,
    /// Position direction.
    pub side: Side,
    /// Confirmed entry fill price.
    pub entry_price: Decimal,
    /// Size in contracts.
    pub amount: Decimal,
    /// Leverage in effect.
    pub leverage: u32,
    /// Take-profit target.
    pub tp: PriceSpec,
    /// Stop-loss target.
    pub sl: PriceSpec,
    /// Client id of the entry order, when available.
    pub entry_order_id: Option<String>,
}

/// Realized statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TrackerStats {
    /// Currently open positions.
    pub open_positions: usize,
    /// Positions ever opened this session.
    pub total_opened: u64,
    /// Confirmed closes.
    pub total_closed: u64,
    /// Profitable closes.
    pub wins: u64,
    /// Losing closes.
    pub losses: u64,
    /// Time-based closes.
    pub timeouts: u64,
    /// Error-bucket closes (forced, safety, ghost).
    pub errors: u64,
    /// Positions adopted from the exchange.
    pub recovered: u64,
    /// Long entries this session.
    pub new_longs: u64,
    /// Short entries this session.
    pub new_shorts: u64,
}

/// A bracket leg fill routed back to its position.
#[derive(Debug, Clone)]
pub struct BracketFill {
    /// Position the fill belongs to.
    pub trade_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Which leg filled.
    pub leg: BracketLeg,
    /// Fill price reported by the venue.
    pub fill_price: Decimal,
    /// The surviving sibling leg's client id, to be cancelled.
    pub sibling_order_id: Option<String>,
}

#[derive(Debug)]
struct Inner {
    positions: HashMap<String, Position>,
    /// client order id -> trade id, for O(1) fill routing.
    order_index: HashMap<String, String>,
    balance: BalanceManager,
    history: Vec<ClosedTrade>,
    closed_ids: HashSet<String>,
    total_opened: u64,
    total_closed: u64,
    wins: u64,
    losses: u64,
    timeouts: u64,
    errors: u64,
    recovered: u64,
    new_longs: u64,
    new_shorts: u64,
}

impl Inner {
    fn index_position_orders(&mut self, position: &Position) {
        for id in [
            position.entry_order_id.as_ref(),
            position.tp_order_id.as_ref(),
            position.sl_order_id.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            self.order_index.insert(id.clone(), position.trade_id.clone());
        }
    }

    fn unindex_position_orders(&mut self, position: &Position) {
        for id in [
            position.entry_order_id.as_ref(),
            position.tp_order_id.as_ref(),
            position.sl_order_id.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            self.order_index.remove(id);
        }
    }

    fn blocked_by_positions(&self) -> Decimal {
        self.positions.values().map(|p| p.margin_used).sum()
    }
}

/// Shadow-state tracker for open positions.
#[derive(Debug)]
pub struct PositionTracker {
    inner: RwLock<Inner>,
    max_positions: usize,
    max_hold_bars: u32,
}

impl PositionTracker {
    /// Create a tracker with a fresh balance ledger.
    #[must_use]
    pub fn new(initial_balance: Decimal, max_positions: usize, max_hold_bars: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                positions: HashMap::new(),
                order_index: HashMap::new(),
                balance: BalanceManager::new(initial_balance),
                history: Vec::new(),
                closed_ids: HashSet::new(),
                total_opened: 0,
                total_closed: 0,
                wins: 0,
                losses: 0,
                timeouts: 0,
                errors: 0,
                recovered: 0,
                new_longs: 0,
                new_shorts: 0,
            }),
            max_positions,
            max_hold_bars,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a filled entry as an `Opening` position and reserve its
    /// margin.
    ///
    /// # Errors
    ///
    /// Fails on validation problems, the position cap, or insufficient
    /// available balance.
    pub fn open_position(&self, req: &OpenPositionRequest) -> EngineResult<Position> {
        if req.amount <= Decimal::ZERO {
            return Err(EngineError::validation("amount must be positive"));
        }
        if req.entry_price <= Decimal::ZERO {
            return Err(EngineError::validation("entry price must be positive"));
        }
        if req.leverage == 0 {
            return Err(EngineError::validation("leverage must be at least 1"));
        }

        let tp_level = req.tp.resolve(req.side, req.entry_price, BracketLeg::TakeProfit);
        let sl_level = req.sl.resolve(req.side, req.entry_price, BracketLeg::StopLoss);
        if tp_level <= Decimal::ZERO || sl_level <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "non-positive bracket level (tp={tp_level}, sl={sl_level})"
            )));
        }

        let notional = req.amount * req.entry_price;
        let margin_used = notional / Decimal::from(req.leverage);

        let mut inner = self.write();
        if inner.positions.len() >= self.max_positions {
            return Err(EngineError::Position(format!(
                "max concurrent positions reached ({})",
                self.max_positions
            )));
        }
        inner.balance.reserve_margin(margin_used)?;

        let trade_id = req
            .entry_order_id
            .clone()
            .unwrap_or_else(|| format!("T-{}", &Uuid::new_v4().simple().to_string()[..12]));

        let position = Position {
            trade_id: trade_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            entry_price: req.entry_price,
            amount: req.amount,
            notional,
            margin_used,
            leverage: req.leverage,
            tp_level,
            sl_level,
            liquidation_level: liquidation_level(req.side, req.entry_price, req.leverage),
            entry_time: Utc::now(),
            bars_held: 0,
            status: PositionStatus::Opening,
            entry_order_id: req.entry_order_id.clone(),
            tp_order_id: None,
            sl_order_id: None,
            exchange_tp_id: None,
            exchange_sl_id: None,
            pending_exit: None,
            recovered: false,
        };

        inner.index_position_orders(&position);
        inner.positions.insert(trade_id.clone(), position.clone());
        inner.total_opened += 1;
        match req.side {
            Side::Long => inner.new_longs += 1,
            Side::Short => inner.new_shorts += 1,
        }

        info!(
            trade_id = %trade_id,
            symbol = %req.symbol,
            side = %req.side,
            entry = %req.entry_price,
            tp = %tp_level,
            sl = %sl_level,
            "position registered"
        );
        Ok(position)
    }

    /// Link bracket leg order ids to a position.
    ///
    /// # Errors
    ///
    /// Fails when the position does not exist.
    pub fn link_bracket(
        &self,
        trade_id: &str,
        tp_order_id: &str,
        sl_order_id: &str,
        exchange_tp_id: Option<&str>,
        exchange_sl_id: Option<&str>,
    ) -> EngineResult<()> {
        let mut inner = self.write();
        let position = inner
            .positions
            .get_mut(trade_id)
            .ok_or_else(|| EngineError::Position(format!("position not found: {trade_id}")))?;
        position.tp_order_id = Some(tp_order_id.to_string());
        position.sl_order_id = Some(sl_order_id.to_string());
        position.exchange_tp_id = exchange_tp_id.map(ToString::to_string);
        position.exchange_sl_id = exchange_sl_id.map(ToString::to_string);
        let position = position.clone();
        inner.index_position_orders(&position);
        Ok(())
    }

    /// Replace one bracket leg's order ids after a modify.
    ///
    /// # Errors
    ///
    /// Fails when the position does not exist.
    pub fn relink_leg(
        &self,
        trade_id: &str,
        leg: BracketLeg,
        order_id: &str,
        exchange_id: Option<&str>,
        new_level: Decimal,
    ) -> EngineResult<()> {
        let mut inner = self.write();
        let position = inner
            .positions
            .get_mut(trade_id)
            .ok_or_else(|| EngineError::Position(format!("position not found: {trade_id}")))?;

        let old = match leg {
            BracketLeg::TakeProfit => {
                let old = position.tp_order_id.replace(order_id.to_string());
                position.exchange_tp_id = exchange_id.map(ToString::to_string);
                position.tp_level = new_level;
                old
            }
            BracketLeg::StopLoss => {
                let old = position.sl_order_id.replace(order_id.to_string());
                position.exchange_sl_id = exchange_id.map(ToString::to_string);
                position.sl_level = new_level;
                old
            }
        };
        let trade_id = position.trade_id.clone();
        if let Some(old_id) = old {
            inner.order_index.remove(&old_id);
        }
        inner.order_index.insert(order_id.to_string(), trade_id);
        Ok(())
    }

    /// Transition a position's status, validating the edge.
    ///
    /// # Errors
    ///
    /// Fails when the position does not exist or the transition is
    /// illegal.
    pub fn set_status(&self, trade_id: &str, to: PositionStatus) -> EngineResult<PositionStatus> {
        let mut inner = self.write();
        let position = inner
            .positions
            .get_mut(trade_id)
            .ok_or_else(|| EngineError::Position(format!("position not found: {trade_id}")))?;
        let from = position.status;
        if !from.can_transition(to) {
            return Err(EngineError::Position(format!(
                "illegal status transition {from} -> {to} for {trade_id}"
            )));
        }
        position.status = to;
        Ok(from)
    }

    /// Flip an `Opening` position to `Active` once both legs exist.
    ///
    /// # Errors
    ///
    /// Fails when the position does not exist or is not `Opening`.
    pub fn activate(&self, trade_id: &str) -> EngineResult<()> {
        self.set_status(trade_id, PositionStatus::Active).map(|_| ())
    }

    /// Examine a candle against all positions of a symbol.
    ///
    /// Returns exit signals in trigger priority: liquidation beats stop
    /// loss beats take profit. Non-`Active` positions and positions with
    /// a pending exit are skipped; every matching position's `bars_held`
    /// advances.
    pub fn check_candle(&self, symbol: &str, candle: &Candle) -> Vec<ExitSignal> {
        let mut signals = Vec::new();
        let mut inner = self.write();

        for position in inner.positions.values_mut() {
            if position.symbol != symbol {
                continue;
            }
            position.bars_held += 1;

            if position.status != PositionStatus::Active || position.pending_exit.is_some() {
                continue;
            }

            let triggered = evaluate_candle(position, candle).or_else(|| {
                (self.max_hold_bars > 0 && position.bars_held >= self.max_hold_bars)
                    .then_some((CloseReason::TimeExit, candle.close))
            });

            if let Some((reason, price)) = triggered {
                position.pending_exit = Some(PendingExit {
                    reason,
                    price,
                    requested_at: Utc::now(),
                });
                signals.push(ExitSignal {
                    trade_id: position.trade_id.clone(),
                    symbol: position.symbol.clone(),
                    reason,
                    price,
                });
            }
        }

        signals
    }

    /// Route a push fill to the bracket leg it belongs to.
    ///
    /// Returns `None` for updates that are not terminal fills of a
    /// tracked TP or SL leg.
    #[must_use]
    pub fn route_fill(&self, update: &OrderUpdate) -> Option<BracketFill> {
        if update.status != crate::domain::OrderStatus::Filled {
            return None;
        }
        let client_id = update.client_order_id.as_deref()?;

        let inner = self.read();
        let trade_id = inner.order_index.get(client_id)?;
        let position = inner.positions.get(trade_id)?;

        let (leg, sibling) = if position.tp_order_id.as_deref() == Some(client_id) {
            (BracketLeg::TakeProfit, position.sl_order_id.clone())
        } else if position.sl_order_id.as_deref() == Some(client_id) {
            (BracketLeg::StopLoss, position.tp_order_id.clone())
        } else {
            return None;
        };

        let fill_price = update.average_price.filter(|p| !p.is_zero()).unwrap_or(match leg {
            BracketLeg::TakeProfit => position.tp_level,
            BracketLeg::StopLoss => position.sl_level,
        });

        Some(BracketFill {
            trade_id: position.trade_id.clone(),
            symbol: position.symbol.clone(),
            leg,
            fill_price,
            sibling_order_id: sibling,
        })
    }

    /// Confirm a close and update realized stats exactly once.
    ///
    /// # Errors
    ///
    /// Fails when the trade id was never tracked at all.
    pub fn confirm_close(
        &self,
        trade_id: &str,
        exit_price: Decimal,
        reason: CloseReason,
        pnl: Decimal,
        fee: Decimal,
    ) -> EngineResult<CloseOutcome> {
        let mut inner = self.write();

        let Some(position) = inner.positions.remove(trade_id) else {
            if inner.closed_ids.contains(trade_id) {
                return Ok(CloseOutcome::AlreadyClosed);
            }
            return Err(EngineError::Position(format!(
                "cannot confirm close of unknown position {trade_id}"
            )));
        };

        inner.unindex_position_orders(&position);
        inner.balance.release_margin(position.margin_used);
        inner.balance.apply_pnl(pnl, fee);

        inner.total_closed += 1;
        if reason.counts_as_error() {
            inner.errors += 1;
        } else if reason.counts_as_timeout() {
            inner.timeouts += 1;
        } else if pnl > Decimal::ZERO {
            inner.wins += 1;
        } else {
            inner.losses += 1;
        }

        let trade = ClosedTrade {
            trade_id: position.trade_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            amount: position.amount,
            pnl,
            fee,
            reason,
            opened_at: position.entry_time,
            closed_at: Utc::now(),
        };
        inner.history.push(trade.clone());
        inner.closed_ids.insert(trade_id.to_string());

        info!(
            trade_id = %trade_id,
            symbol = %trade.symbol,
            reason = %reason,
            pnl = %pnl,
            "close confirmed"
        );
        debug_assert!(inner.balance.verify_blocked(inner.blocked_by_positions()));
        Ok(CloseOutcome::Closed(Box::new(trade)))
    }

    /// Remove a position that no longer exists on the exchange and for
    /// which no exit trade could be found. Releases margin and counts an
    /// error close, but records no trade history.
    ///
    /// # Errors
    ///
    /// Fails when the position does not exist.
    pub fn remove_position(&self, trade_id: &str, reason: CloseReason) -> EngineResult<Position> {
        let mut inner = self.write();
        let position = inner
            .positions
            .remove(trade_id)
            .ok_or_else(|| EngineError::Position(format!("position not found: {trade_id}")))?;

        inner.unindex_position_orders(&position);
        inner.balance.release_margin(position.margin_used);
        inner.total_closed += 1;
        inner.errors += 1;
        inner.closed_ids.insert(trade_id.to_string());

        warn!(
            trade_id = %trade_id,
            symbol = %position.symbol,
            reason = %reason,
            "position removed without trade history"
        );
        Ok(position)
    }

    /// Adopt a position discovered on the exchange. Margin is blocked
    /// unconditionally; adopted exposure exists whether or not local
    /// capital accounting agrees.
    ///
    /// # Errors
    ///
    /// Fails when the trade id is already tracked.
    pub fn adopt_position(&self, mut position: Position) -> EngineResult<Position> {
        let mut inner = self.write();
        if inner.positions.contains_key(&position.trade_id) {
            return Err(EngineError::Position(format!(
                "duplicate trade id: {}",
                position.trade_id
            )));
        }
        position.recovered = true;
        inner.balance.force_block(position.margin_used);
        inner.index_position_orders(&position);
        inner
            .positions
            .insert(position.trade_id.clone(), position.clone());
        inner.recovered += 1;
        inner.total_opened += 1;

        info!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            "position adopted from exchange"
        );
        Ok(position)
    }

    /// Restore positions, balance and history from a persisted snapshot.
    /// Replaces the in-memory state wholesale; callers reconcile
    /// afterwards.
    pub fn restore(
        &self,
        positions: Vec<Position>,
        balance: BalanceManager,
        stats: TrackerStats,
        history: Vec<ClosedTrade>,
    ) {
        let mut inner = self.write();
        inner.positions.clear();
        inner.order_index.clear();
        for position in positions {
            inner.index_position_orders(&position);
            inner.positions.insert(position.trade_id.clone(), position);
        }
        inner.closed_ids = history.iter().map(|t| t.trade_id.clone()).collect();
        inner.history = history;
        inner.balance = balance;
        inner.total_opened = stats.total_opened;
        inner.total_closed = stats.total_closed;
        inner.wins = stats.wins;
        inner.losses = stats.losses;
        inner.timeouts = stats.timeouts;
        inner.errors = stats.errors;
        inner.recovered = stats.recovered;
        inner.new_longs = stats.new_longs;
        inner.new_shorts = stats.new_shorts;
    }

    /// Look up one position.
    #[must_use]
    pub fn get(&self, trade_id: &str) -> Option<Position> {
        self.read().positions.get(trade_id).cloned()
    }

    /// All open positions.
    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        self.read().positions.values().cloned().collect()
    }

    /// Open positions for one symbol.
    #[must_use]
    pub fn positions_for(&self, symbol: &str) -> Vec<Position> {
        self.read()
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Number of open positions.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.read().positions.len()
    }

    /// Realized statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        let inner = self.read();
        TrackerStats {
            open_positions: inner.positions.len(),
            total_opened: inner.total_opened,
            total_closed: inner.total_closed,
            wins: inner.wins,
            losses: inner.losses,
            timeouts: inner.timeouts,
            errors: inner.errors,
            recovered: inner.recovered,
            new_longs: inner.new_longs,
            new_shorts: inner.new_shorts,
        }
    }

    /// Balance snapshot.
    #[must_use]
    pub fn balance(&self) -> BalanceSnapshot {
        self.read().balance.snapshot()
    }

    /// Session starting capital.
    #[must_use]
    pub fn initial_balance(&self) -> Decimal {
        self.read().balance.initial_balance()
    }

    /// Correct the balance total to an externally observed value.
    pub fn correct_balance(&self, total: Decimal) {
        self.write().balance.set_total(total);
    }

    /// Closed trade history.
    #[must_use]
    pub fn history(&self) -> Vec<ClosedTrade> {
        self.read().history.clone()
    }

    /// Verify blocked capital against open position margins.
    #[must_use]
    pub fn verify_balance_invariant(&self) -> bool {
        let inner = self.read();
        inner.balance.verify_blocked(inner.blocked_by_positions())
    }
}

/// Evaluate one candle against one position: liquidation > SL > TP.
fn evaluate_candle(position: &Position, candle: &Candle) -> Option<(CloseReason, Decimal)> {
    match position.side {
        Side::Long => {
            if let Some(liq) = position.liquidation_level {
                if candle.low <= liq {
                    return Some((CloseReason::Liquidation, liq));
                }
            }
            if candle.low <= position.sl_level {
                return Some((CloseReason::StopLoss, position.sl_level));
            }
            if candle.high >= position.tp_level {
                return Some((CloseReason::TakeProfit, position.tp_level));
            }
        }
        Side::Short => {
            if let Some(liq) = position.liquidation_level {
                if candle.high >= liq {
                    return Some((CloseReason::Liquidation, liq));
                }
            }
            if candle.high >= position.sl_level {
                return Some((CloseReason::StopLoss, position.sl_level));
            }
            if candle.low <= position.tp_level {
                return Some((CloseReason::TakeProfit, position.tp_level));
            }
        }
    }
    None
}
