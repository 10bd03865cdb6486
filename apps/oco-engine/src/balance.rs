//! Capital accounting.
//!
//! Tracks available versus blocked capital. Invariant: `blocked` equals
//! the sum of `margin_used` over open positions; `PositionTracker` calls
//! `verify_blocked` after every mutation batch to catch drift.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Point-in-time balance snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Total capital: available + blocked.
    pub total: Decimal,
    /// Capital free for new positions.
    pub available: Decimal,
    /// Capital reserved as position margin.
    pub blocked: Decimal,
}

/// Available/blocked capital ledger.
#[derive(Debug, Clone)]
pub struct BalanceManager {
    initial_balance: Decimal,
    available: Decimal,
    blocked: Decimal,
}

impl BalanceManager {
    /// Start a ledger with the full balance available.
    #[must_use]
    pub const fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            available: initial_balance,
            blocked: Decimal::ZERO,
        }
    }

    /// Restore a ledger from persisted state.
    #[must_use]
    pub const fn restore(initial_balance: Decimal, available: Decimal, blocked: Decimal) -> Self {
        Self {
            initial_balance,
            available,
            blocked,
        }
    }

    /// Starting capital of the session.
    #[must_use]
    pub const fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    /// Capital free for new positions.
    #[must_use]
    pub const fn available(&self) -> Decimal {
        self.available
    }

    /// Capital reserved as margin.
    #[must_use]
    pub const fn blocked(&self) -> Decimal {
        self.blocked
    }

    /// Total capital (realized; unrealized PnL is not tracked here).
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.available + self.blocked
    }

    /// Whether `margin` can be reserved right now.
    #[must_use]
    pub fn can_reserve(&self, margin: Decimal) -> bool {
        margin > Decimal::ZERO && margin <= self.available
    }

    /// Move `margin` from available to blocked.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Balance` when the margin is non-positive or
    /// exceeds available capital.
    pub fn reserve_margin(&mut self, margin: Decimal) -> EngineResult<()> {
        if margin <= Decimal::ZERO {
            return Err(EngineError::Balance(format!(
                "cannot reserve non-positive margin {margin}"
            )));
        }
        if margin > self.available {
            return Err(EngineError::Balance(format!(
                "insufficient available balance: need {margin}, have {}",
                self.available
            )));
        }
        self.available -= margin;
        self.blocked += margin;
        debug!(%margin, available = %self.available, blocked = %self.blocked, "margin reserved");
        Ok(())
    }

    /// Move `margin` back from blocked to available.
    pub fn release_margin(&mut self, margin: Decimal) {
        let released = margin.min(self.blocked);
        if released < margin {
            warn!(
                requested = %margin,
                blocked = %self.blocked,
                "margin release exceeds blocked capital, clamping"
            );
        }
        self.blocked -= released;
        self.available += released;
    }

    /// Block `margin` without an availability check. Adopted exchange
    /// exposure is real whether or not the local ledger can cover it;
    /// `available` may go negative until drift correction runs.
    pub fn force_block(&mut self, margin: Decimal) {
        self.available -= margin;
        self.blocked += margin;
        if self.available < Decimal::ZERO {
            warn!(available = %self.available, %margin, "forced block drove available negative");
        }
    }

    /// Apply a realized trade result to available capital.
    pub fn apply_pnl(&mut self, pnl: Decimal, fee: Decimal) {
        self.available += pnl - fee;
    }

    /// Correct the ledger to an externally observed total, keeping the
    /// blocked portion intact. Used by balance drift correction.
    pub fn set_total(&mut self, total: Decimal) {
        self.available = total - self.blocked;
    }

    /// Check the blocked-capital invariant against the tracker's view.
    #[must_use]
    pub fn verify_blocked(&self, expected_blocked: Decimal) -> bool {
        let ok = self.blocked == expected_blocked;
        if !ok {
            warn!(
                ledger = %self.blocked,
                positions = %expected_blocked,
                "blocked capital diverged from open position margins"
            );
        }
        ok
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            total: self.total(),
            available: self.available,
            blocked: self.blocked,
        }
    }
}
