//! Engine facade wiring every subsystem together.
//!
//! ```text
//!               ┌────────────┐
//!   entries ───▶│            │──▶ OcoManager ───▶ Connector
//!   candles ───▶│   Engine   │──▶ PositionTracker
//!   updates ───▶│            │──▶ ReconciliationService
//!               └────────────┘──▶ StateStore
//! ```
//!
//! The engine owns the background tasks: a reconciliation loop, a
//! debounced snapshot flusher and the order update pump. Callers drive
//! it with entries, candles and an eventual shutdown; everything else is
//! reaction.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};

use rust_decimal::Decimal;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::balance::{BalanceManager, BalanceSnapshot};
use crate::config::{EngineConfig, SizingMode};
use crate::connector::Connector;
use crate::domain::{
    BracketLeg, Candle, CloseOutcome, CloseReason, ClosedTrade, OrderRequest, OrderUpdate,
    Position, PositionStatus, PriceSpec, Side,
};
use crate::error::{EngineError, EngineResult};
use crate::oco::{BracketRequest, OcoManager};
use crate::persistence::{BalanceRecord, PersistedState, STATE_VERSION, StateStore};
use crate::position::{PositionTracker, TrackerStats};
use crate::reconciliation::{ReconReport, ReconciliationService};
use crate::resilience::{IntentTracker, ResilientExecutor};

/// Request to open a position, sized as a fraction of equity.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    /// Trading symbol.
    pub symbol: String,
    /// Position direction.
    pub side: Side,
    /// Fraction of available equity committed (0.1 = 10%).
    pub equity_fraction: Decimal,
    /// Leverage; zero falls back to the configured default.
    pub leverage: u32,
    /// Take-profit target.
    pub tp: PriceSpec,
    /// Stop-loss target.
    pub sl: PriceSpec,
}

/// End-of-session report.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Session id of the store.
    pub session_id: String,
    /// Realized statistics.
    pub stats: TrackerStats,
    /// Final balance.
    pub balance: BalanceSnapshot,
    /// Total realized PnL net of fees.
    pub realized_pnl: Decimal,
}

/// Orchestrates entries, exits, reconciliation and persistence.
pub struct Engine {
    connector: Arc<dyn Connector>,
    tracker: Arc<PositionTracker>,
    oco: Arc<OcoManager>,
    recon: Arc<ReconciliationService>,
    executor: Arc<ResilientExecutor>,
    intents: Arc<IntentTracker>,
    store: StateStore,
    config: EngineConfig,
    drain: AtomicBool,
    dirty: Notify,
    feed_seen: StdMutex<std::time::Instant>,
    feed_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wire up an engine over a connector.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the state directory cannot
    /// be created.
    pub fn new(connector: Arc<dyn Connector>, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let store = StateStore::open(&config.persistence)?;
        let tracker = Arc::new(PositionTracker::new(
            config.trading.initial_balance,
            config.trading.max_positions,
            config.trading.max_hold_bars,
        ));
        let executor = Arc::new(ResilientExecutor::new(
            config.circuit_breaker.to_breaker_config(),
        ));
        let intents = Arc::new(IntentTracker::default());
        let oco = Arc::new(OcoManager::new(
            Arc::clone(&connector),
            Arc::clone(&executor),
            Arc::clone(&intents),
            Arc::clone(&tracker),
            config.oco.clone(),
        ));
        let recon = Arc::new(ReconciliationService::new(
            Arc::clone(&connector),
            Arc::clone(&tracker),
            Arc::clone(&oco),
            config.reconciliation.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            connector,
            tracker,
            oco,
            recon,
            executor,
            intents,
            store,
            config,
            drain: AtomicBool::new(false),
            dirty: Notify::new(),
            feed_seen: StdMutex::new(std::time::Instant::now()),
            feed_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Recover persisted state, reconcile it against the exchange, and
    /// start the background tasks.
    ///
    /// A recovered snapshot is last known state, not the truth, so the
    /// first reconciliation pass runs before any trading happens.
    ///
    /// # Errors
    ///
    /// Propagates failures from the initial reconciliation pass.
    pub async fn startup(self: &Arc<Self>) -> EngineResult<ReconReport> {
        if let Some(state) = self.store.recover() {
            info!(
                session_id = %self.store.session_id(),
                positions = state.positions.len(),
                "restoring persisted state"
            );
            self.tracker.restore(
                state.positions,
                BalanceManager::restore(
                    state.balance.initial_balance,
                    state.balance.available,
                    state.balance.blocked,
                ),
                state.stats,
                state.closed_trades,
            );
        }

        let report = self.recon.run().await?;
        self.save_now()?;
        self.spawn_background();
        Ok(report)
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let interval = engine.config.reconciliation.interval();
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        if let Err(err) = engine.reconcile().await {
                            warn!(%err, "background reconciliation failed");
                        }
                        engine.correct_balance_drift().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let debounce = engine.config.persistence.flush_debounce();
            loop {
                tokio::select! {
                    () = engine.dirty.notified() => {
                        tokio::time::sleep(debounce).await;
                        if let Err(err) = engine.save_now() {
                            error!(%err, "state flush failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut updates = self.connector.subscribe_updates();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = updates.recv() => match received {
                        Ok(update) => {
                            engine.note_feed_event();
                            engine.on_order_update(&update).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "order update pump lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));

        // Feed health loop: a quiet feed is fine while flat, but silence
        // with open positions means leg fills may be going unseen. REST
        // reconciliation is the fallback until events flow again.
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let base = engine.config.reconciliation.feed_check_interval();
            let timeout = engine.config.reconciliation.feed_timeout();
            let mut delay = base;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        if engine.feed_is_stale(timeout) {
                            if !engine.feed_down.swap(true, Ordering::SeqCst) {
                                warn!(?timeout, "order update feed stale, falling back to polling");
                            }
                            if let Err(err) = engine.reconcile().await {
                                warn!(%err, "feed fallback reconciliation failed");
                            }
                            delay = (delay * 2).min(timeout.max(base));
                        } else {
                            delay = base;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    fn note_feed_event(&self) {
        *self.feed_seen.lock().unwrap_or_else(PoisonError::into_inner) =
            std::time::Instant::now();
        if self.feed_down.swap(false, Ordering::SeqCst) {
            info!("order update feed recovered");
        }
    }

    fn feed_is_stale(&self, timeout: std::time::Duration) -> bool {
        if self.tracker.open_count() == 0 {
            return false;
        }
        self.feed_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
            > timeout
    }

    /// Whether the realtime update feed is currently considered down.
    #[must_use]
    pub fn feed_is_down(&self) -> bool {
        self.feed_down.load(Ordering::SeqCst)
    }

    /// Open a bracketed position sized from current equity.
    ///
    /// # Errors
    ///
    /// Rejected during drain or halt, on validation failure, or when the
    /// bracket cannot be completed atomically.
    pub async fn execute_entry(&self, req: &EntryRequest) -> EngineResult<Position> {
        if self.recon.is_halted() {
            return Err(EngineError::Halted);
        }
        if self.drain.load(Ordering::SeqCst) {
            return Err(EngineError::validation("drain mode active, entries rejected"));
        }
        if req.equity_fraction <= Decimal::ZERO {
            return Err(EngineError::validation("equity fraction must be positive"));
        }

        let leverage = if req.leverage == 0 {
            self.config.trading.default_leverage
        } else {
            req.leverage
        };
        let price = self.connector.fetch_current_price(&req.symbol).await?;
        let amount = self.size_entry(req, price, leverage)?;

        let position = self
            .oco
            .create_bracket(&BracketRequest {
                symbol: req.symbol.clone(),
                side: req.side,
                amount,
                leverage,
                tp: req.tp,
                sl: req.sl,
            })
            .await?;
        self.mark_dirty();
        Ok(position)
    }

    fn size_entry(&self, req: &EntryRequest, price: Decimal, _leverage: u32) -> EngineResult<Decimal> {
        let equity = self.tracker.balance().available;
        let committed = equity * req.equity_fraction;
        if committed <= Decimal::ZERO {
            return Err(EngineError::Balance("no equity available for entry".into()));
        }

        let notional = match self.config.trading.sizing_mode {
            SizingMode::FixedNotional => committed,
            SizingMode::FixedRisk => {
                let sl_level = req.sl.resolve(req.side, price, BracketLeg::StopLoss);
                let distance = (price - sl_level).abs();
                if distance.is_zero() {
                    return Err(EngineError::validation(
                        "stop distance of zero cannot size a risk-based entry",
                    ));
                }
                committed * price / distance
            }
        };

        let amount = self.connector.amount_to_precision(&req.symbol, notional / price);
        if amount.is_zero() {
            return Err(EngineError::validation(
                "sized amount rounds to zero at venue precision",
            ));
        }
        Ok(amount)
    }

    /// Close a position with a reduce-only market order and confirm it.
    ///
    /// When the venue reports no fill price the current mark price is
    /// used, and `trigger_price` is the final fallback.
    ///
    /// # Errors
    ///
    /// Fails when the position is missing or already being closed, or
    /// when the close order is rejected for a reason other than the
    /// position already being flat.
    pub async fn close_position(
        &self,
        trade_id: &str,
        reason: CloseReason,
        trigger_price: Option<Decimal>,
    ) -> EngineResult<ClosedTrade> {
        let position = self
            .tracker
            .get(trade_id)
            .ok_or_else(|| EngineError::Position(format!("position not found: {trade_id}")))?;
        self.tracker.set_status(trade_id, PositionStatus::Closing)?;

        self.oco.cancel_bracket(&position).await;

        let mut request =
            OrderRequest::market(&position.symbol, position.side.exit_side(), position.amount);
        request.reduce_only = true;

        let fill_price = match self.connector.create_order(&request).await {
            Ok(result) => match result.average_price.filter(|p| !p.is_zero()) {
                Some(price) => price,
                None => self.mark_or_trigger(&position.symbol, trigger_price).await,
            },
            Err(err) if crate::resilience::classifier::is_reduce_only_rejection(&err.to_string()) => {
                // Already flat on the venue; the exit happened without us.
                warn!(trade_id, "close rejected reduce-only, position already flat");
                self.mark_or_trigger(&position.symbol, trigger_price).await
            }
            Err(err) => {
                if let Err(restore) = self.tracker.set_status(trade_id, PositionStatus::Active) {
                    warn!(trade_id, %restore, "could not restore status after failed close");
                }
                return Err(err.into());
            }
        };

        let pnl = (fill_price - position.entry_price) * position.amount * position.side.direction();
        let outcome = self
            .tracker
            .confirm_close(trade_id, fill_price, reason, pnl, Decimal::ZERO)?;
        self.mark_dirty();

        match outcome {
            CloseOutcome::Closed(trade) => Ok(*trade),
            CloseOutcome::AlreadyClosed => Err(EngineError::Position(format!(
                "position already closed: {trade_id}"
            ))),
        }
    }

    async fn mark_or_trigger(&self, symbol: &str, trigger_price: Option<Decimal>) -> Decimal {
        match self.connector.fetch_current_price(symbol).await {
            Ok(price) => price,
            Err(err) => {
                warn!(%symbol, %err, "mark price unavailable, using trigger price");
                trigger_price.unwrap_or_default()
            }
        }
    }

    /// Feed a closed candle through every position on the symbol and
    /// execute the exits it triggers.
    pub async fn on_candle(&self, symbol: &str, candle: &Candle) {
        for signal in self.tracker.check_candle(symbol, candle) {
            info!(
                trade_id = %signal.trade_id,
                reason = %signal.reason,
                price = %signal.price,
                "candle exit triggered"
            );
            if let Err(err) = self
                .close_position(&signal.trade_id, signal.reason, Some(signal.price))
                .await
            {
                error!(trade_id = %signal.trade_id, %err, "candle exit failed");
            }
        }
    }

    /// React to a pushed order update: keep intents current and confirm
    /// bracket leg fills, cancelling the surviving sibling.
    pub async fn on_order_update(&self, update: &OrderUpdate) {
        self.intents.apply_update(update);

        let Some(fill) = self.tracker.route_fill(update) else {
            return;
        };
        let Some(position) = self.tracker.get(&fill.trade_id) else {
            return;
        };

        let reason = match fill.leg {
            BracketLeg::TakeProfit => CloseReason::TakeProfit,
            BracketLeg::StopLoss => CloseReason::StopLoss,
        };
        let pnl =
            (fill.fill_price - position.entry_price) * position.amount * position.side.direction();

        match self
            .tracker
            .confirm_close(&fill.trade_id, fill.fill_price, reason, pnl, Decimal::ZERO)
        {
            Ok(CloseOutcome::Closed(trade)) => {
                info!(
                    trade_id = %trade.trade_id,
                    reason = %trade.reason,
                    pnl = %trade.pnl,
                    "bracket leg filled, position closed"
                );
                if let Some(sibling) = fill.sibling_order_id {
                    if let Err(err) = self.connector.cancel_order(&sibling, &fill.symbol).await {
                        warn!(%sibling, %err, "sibling cancel after leg fill failed");
                    }
                    self.intents.stop_tracking(&sibling);
                }
                self.mark_dirty();
            }
            Ok(CloseOutcome::AlreadyClosed) => {}
            Err(err) => {
                error!(trade_id = %fill.trade_id, %err, "leg fill confirmation failed");
            }
        }
    }

    /// Run one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Propagates halt and fetch failures from the service.
    pub async fn reconcile(&self) -> EngineResult<ReconReport> {
        let report = self.recon.run().await?;
        if !report.is_clean() {
            self.mark_dirty();
        }
        Ok(report)
    }

    async fn correct_balance_drift(&self) {
        match self.connector.fetch_balance().await {
            Ok(remote) => {
                let local = self.tracker.balance().total;
                let drift = (remote.total - local).abs();
                if drift > self.config.reconciliation.drift_threshold {
                    warn!(%local, remote = %remote.total, %drift, "balance drift, correcting");
                    self.tracker.correct_balance(remote.total);
                    self.mark_dirty();
                }
            }
            Err(err) => {
                warn!(%err, "balance drift check failed");
            }
        }
    }

    /// Enable or disable drain mode. Draining rejects new entries while
    /// exits, updates and reconciliation keep running.
    pub fn set_drain(&self, enabled: bool) {
        self.drain.store(enabled, Ordering::SeqCst);
        info!(enabled, "drain mode changed");
    }

    /// Whether drain mode is active.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.drain.load(Ordering::SeqCst)
    }

    /// Drain, sweep every open position closed, persist the final
    /// snapshot and stop the background tasks.
    ///
    /// Circuit breakers are bypassed for the sweep: refusing to close
    /// positions during shutdown is worse than hammering a flaky venue.
    pub async fn shutdown(&self) -> SessionSummary {
        info!("engine shutdown starting");
        self.set_drain(true);
        self.executor.set_shutdown_mode(true);

        for position in self.tracker.positions() {
            match self
                .close_position(&position.trade_id, CloseReason::Shutdown, None)
                .await
            {
                Ok(trade) => {
                    info!(trade_id = %trade.trade_id, pnl = %trade.pnl, "position swept");
                }
                Err(err) => {
                    error!(trade_id = %position.trade_id, %err, "shutdown sweep close failed");
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }

        for intent in self.intents.pending_verification() {
            warn!(
                client_order_id = %intent.client_order_id,
                status = ?intent.status,
                "order intent unresolved at shutdown"
            );
        }

        if let Err(err) = self.save_now() {
            error!(%err, "final snapshot save failed");
        }

        let summary = self.session_summary();
        info!(
            session_id = %summary.session_id,
            trades = summary.stats.total_closed,
            pnl = %summary.realized_pnl,
            "engine shutdown complete"
        );
        summary
    }

    /// Snapshot the session so far.
    #[must_use]
    pub fn session_summary(&self) -> SessionSummary {
        let stats = self.tracker.stats();
        let balance = self.tracker.balance();
        let realized_pnl = self
            .tracker
            .history()
            .iter()
            .map(|t| t.pnl - t.fee)
            .sum();
        SessionSummary {
            session_id: self.store.session_id().to_string(),
            stats,
            balance,
            realized_pnl,
        }
    }

    /// Write a snapshot immediately, bypassing the debounce.
    ///
    /// # Errors
    ///
    /// Fails on serialization or filesystem errors.
    pub fn save_now(&self) -> EngineResult<()> {
        let balance = self.tracker.balance();
        let state = PersistedState {
            version: STATE_VERSION.to_string(),
            session_id: self.store.session_id().to_string(),
            saved_at: chrono::Utc::now(),
            positions: self.tracker.positions(),
            balance: BalanceRecord {
                initial_balance: self.tracker.initial_balance(),
                available: balance.available,
                blocked: balance.blocked,
            },
            stats: self.tracker.stats(),
            closed_trades: self.tracker.history(),
        };
        self.store.save(&state)
    }

    fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    /// Shared position tracker, for read access by callers.
    #[must_use]
    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    /// Reconciliation service, for halt inspection and clearing.
    #[must_use]
    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.recon
    }
}
