//! Position shadow state and its lifecycle.
//!
//! Status transitions:
//!
//! ```text
//!   Opening ──▶ Active ◀──▶ Modifying
//!                 │
//!                 ▼
//!              Closing ──▶ (removed on confirm_close / remove_position)
//! ```
//!
//! Under the single-threaded async model the status doubles as a
//! cooperative advisory lock: a position in a transitional status is
//! skipped by candle exits and by reconciliation repairs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::order::OrderSide;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Long exposure: profits when price rises.
    Long,
    /// Short exposure: profits when price falls.
    Short,
}

impl Side {
    /// Book side of the entry order.
    #[must_use]
    pub const fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Book side of any exit order (TP, SL, market close).
    #[must_use]
    pub const fn exit_side(self) -> OrderSide {
        self.entry_side().opposite()
    }

    /// PnL sign multiplier: +1 for long, -1 for short.
    #[must_use]
    pub fn direction(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => -Decimal::ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Position lifecycle status; see the module diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    /// Entry filled, bracket legs not yet confirmed.
    Opening,
    /// Fully bracketed and monitored.
    Active,
    /// A bracket leg is being swapped out.
    Modifying,
    /// A close has been initiated and awaits confirmation.
    Closing,
}

impl PositionStatus {
    /// Whether a transition to `to` is legal.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Opening, Self::Active)
                | (Self::Opening, Self::Closing)
                | (Self::Active, Self::Modifying)
                | (Self::Active, Self::Closing)
                | (Self::Modifying, Self::Active)
                | (Self::Modifying, Self::Closing)
        )
    }

    /// Transitional statuses are skipped by automated exits and repairs.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => write!(f, "OPENING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Modifying => write!(f, "MODIFYING"),
            Self::Closing => write!(f, "CLOSING"),
        }
    }
}

/// How a TP or SL target is expressed in an entry request.
///
/// `Relative` values below [`PERCENTAGE_THRESHOLD`] are percentage
/// distances from entry (0.02 = 2%); values at or above it are price
/// multipliers (1.02 = entry * 1.02, with the multiplier mirrored around
/// 1 for shorts). `Absolute` bypasses the heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSpec {
    /// Percentage distance or multiplier, disambiguated by magnitude.
    Relative(Decimal),
    /// An exact price.
    Absolute(Decimal),
}

/// Relative values below this are percentage distances, not multipliers.
pub const PERCENTAGE_THRESHOLD: Decimal = dec!(0.5);

/// Which bracket leg a price spec resolves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketLeg {
    /// Take-profit leg.
    TakeProfit,
    /// Stop-loss leg.
    StopLoss,
}

impl PriceSpec {
    /// Resolve to an absolute price level for the given side and leg.
    #[must_use]
    pub fn resolve(self, side: Side, entry_price: Decimal, leg: BracketLeg) -> Decimal {
        match self {
            Self::Absolute(price) => price,
            Self::Relative(value) if value < PERCENTAGE_THRESHOLD => {
                let offset = entry_price * value;
                match (side, leg) {
                    (Side::Long, BracketLeg::TakeProfit) | (Side::Short, BracketLeg::StopLoss) => {
                        entry_price + offset
                    }
                    (Side::Long, BracketLeg::StopLoss) | (Side::Short, BracketLeg::TakeProfit) => {
                        entry_price - offset
                    }
                }
            }
            Self::Relative(multiplier) => {
                let effective = match side {
                    Side::Long => multiplier,
                    // Mirror the multiplier around 1: a 1.02 target on a
                    // short means price falling to entry * 0.98.
                    Side::Short => dec!(2) - multiplier,
                };
                entry_price * effective
            }
        }
    }
}

/// Approximate liquidation level with a 0.5% maintenance buffer.
///
/// Returns `None` at leverage <= 1, where liquidation is unreachable in
/// practice.
#[must_use]
pub fn liquidation_level(side: Side, entry_price: Decimal, leverage: u32) -> Option<Decimal> {
    if leverage <= 1 {
        return None;
    }
    let inverse = Decimal::ONE / Decimal::from(leverage);
    let buffer = dec!(0.005);
    let level = match side {
        Side::Long => entry_price * (Decimal::ONE - inverse + buffer),
        Side::Short => entry_price * (Decimal::ONE + inverse - buffer),
    };
    Some(level)
}

/// Why a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// Take-profit level reached.
    TakeProfit,
    /// Stop-loss level reached.
    StopLoss,
    /// Liquidation level breached.
    Liquidation,
    /// Held past the maximum number of bars.
    TimeExit,
    /// An operation deadline expired.
    Timeout,
    /// Operator-requested close.
    Manual,
    /// Closed during shutdown drain.
    Shutdown,
    /// Force-closed by a repair (broken bracket, unhealthy unknown).
    Forced,
    /// Closed by the reconciliation safety path.
    Safety,
    /// Position vanished from the exchange with no exit trade found.
    Ghost,
    /// Closed due to an unrecoverable error.
    Error,
}

impl CloseReason {
    /// Reasons counted in the error bucket of realized stats.
    #[must_use]
    pub const fn counts_as_error(self) -> bool {
        matches!(self, Self::Forced | Self::Safety | Self::Ghost | Self::Error)
    }

    /// Reasons counted in the timeout bucket of realized stats.
    #[must_use]
    pub const fn counts_as_timeout(self) -> bool {
        matches!(self, Self::Timeout | Self::TimeExit)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TakeProfit => "TAKE_PROFIT",
            Self::StopLoss => "STOP_LOSS",
            Self::Liquidation => "LIQUIDATION",
            Self::TimeExit => "TIME_EXIT",
            Self::Timeout => "TIMEOUT",
            Self::Manual => "MANUAL",
            Self::Shutdown => "SHUTDOWN",
            Self::Forced => "FORCED",
            Self::Safety => "SAFETY",
            Self::Ghost => "GHOST",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// A close that was requested but not yet confirmed by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingExit {
    /// Why the exit was requested.
    pub reason: CloseReason,
    /// Price at which the trigger was observed.
    pub price: Decimal,
    /// When the exit was requested.
    pub requested_at: DateTime<Utc>,
}

/// An exit decision produced by a candle check, to be executed by the
/// engine facade.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    /// Position to close.
    pub trade_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Why the exit fired.
    pub reason: CloseReason,
    /// Trigger price observed in the candle.
    pub price: Decimal,
}

/// Shadow state for one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Engine-local trade id.
    pub trade_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Position direction.
    pub side: Side,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Size in contracts.
    pub amount: Decimal,
    /// Position value: `amount * entry_price`.
    pub notional: Decimal,
    /// Margin reserved for this position: `notional / leverage`.
    pub margin_used: Decimal,
    /// Leverage in effect.
    pub leverage: u32,
    /// Take-profit price level.
    pub tp_level: Decimal,
    /// Stop-loss price level.
    pub sl_level: Decimal,
    /// Approximate liquidation price, when leverage > 1.
    pub liquidation_level: Option<Decimal>,
    /// When the entry filled.
    pub entry_time: DateTime<Utc>,
    /// Candles observed since entry.
    pub bars_held: u32,
    /// Lifecycle status; doubles as the advisory lock.
    pub status: PositionStatus,
    /// Client id of the entry order.
    pub entry_order_id: Option<String>,
    /// Client id of the take-profit leg.
    pub tp_order_id: Option<String>,
    /// Client id of the stop-loss leg.
    pub sl_order_id: Option<String>,
    /// Exchange id of the take-profit leg.
    pub exchange_tp_id: Option<String>,
    /// Exchange id of the stop-loss leg.
    pub exchange_sl_id: Option<String>,
    /// A close that was requested but not yet confirmed.
    pub pending_exit: Option<PendingExit>,
    /// True when this position was adopted from the exchange rather than
    /// opened by this engine.
    pub recovered: bool,
}

impl Position {
    /// Unrealized PnL at the given mark price.
    #[must_use]
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        (mark_price - self.entry_price) * self.amount * self.side.direction()
    }

    /// True when both bracket legs are linked.
    #[must_use]
    pub fn has_full_bracket(&self) -> bool {
        self.tp_order_id.is_some() && self.sl_order_id.is_some()
    }
}

/// A fully realized trade, produced exactly once per position by
/// `confirm_close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    /// Engine-local trade id.
    pub trade_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Position direction.
    pub side: Side,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Confirmed exit price.
    pub exit_price: Decimal,
    /// Size in contracts.
    pub amount: Decimal,
    /// Realized profit and loss, fees excluded.
    pub pnl: Decimal,
    /// Fees paid on the exit.
    pub fee: Decimal,
    /// Why the position closed.
    pub reason: CloseReason,
    /// When the entry filled.
    pub opened_at: DateTime<Utc>,
    /// When the close was confirmed.
    pub closed_at: DateTime<Utc>,
}

/// Result of a close confirmation.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    /// The close was recorded; realized stats were updated once.
    Closed(Box<ClosedTrade>),
    /// The position was already confirmed closed; nothing changed.
    AlreadyClosed,
}
