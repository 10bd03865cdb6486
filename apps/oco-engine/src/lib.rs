// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Order execution and reconciliation engine for leveraged futures.
//!
//! Every position this engine opens is bracketed: a market entry, a
//! take-profit trigger and a stop-loss trigger, created atomically or
//! not at all. The engine keeps a shadow copy of exchange state, repairs
//! divergence on a schedule, and persists everything crash-safely.
//!
//! # Architecture
//!
//! - **domain**: positions, orders, candles, bracket price resolution
//! - **position**: the shadow-state tracker and balance ledger
//! - **oco**: atomic bracket creation, modification and rollback
//! - **reconciliation**: ghost / naked / unknown / orphan repair with a
//!   safety valve against bad exchange snapshots
//! - **resilience**: error classification, retries, circuit breakers and
//!   order intent tracking
//! - **persistence**: atomic JSON snapshots with backup rotation and
//!   prior-session recovery
//! - **connector**: the exchange seam, with a deterministic in-memory
//!   venue for the demo binary and tests
//! - **engine**: the facade tying it all together

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod config;
pub mod connector;
pub mod domain;
pub mod engine;
pub mod error;
pub mod oco;
pub mod persistence;
pub mod position;
pub mod reconciliation;
pub mod resilience;

pub use config::{EngineConfig, load_config};
pub use engine::{Engine, EntryRequest, SessionSummary};
pub use error::{EngineError, EngineResult};
