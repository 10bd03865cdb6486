//! Core domain types shared across the engine.
//!
//! Everything here is plain data: no IO, no locks, no connector calls.
//! Services in `position`, `oco` and `reconciliation` own the behavior.

pub mod candle;
pub mod order;
pub mod position;

pub use candle::Candle;
pub use order::{
    ExchangeOrder, ExchangePosition, OrderKind, OrderRequest, OrderResult, OrderSide, OrderStatus,
    OrderUpdate,
};
pub use position::{
    BracketLeg, CloseOutcome, CloseReason, ClosedTrade, ExitSignal, PERCENTAGE_THRESHOLD,
    PendingExit, Position, PositionStatus, PriceSpec, Side, liquidation_level,
};
