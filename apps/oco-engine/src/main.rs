//! OCO Engine demo binary.
//!
//! Runs the engine against the in-memory simulated venue: opens a
//! bracketed position, walks the price through a few candles, lets the
//! bracket do its job and shuts down cleanly.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin oco-engine -- [config.yaml]
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use rust_decimal_macros::dec;

use oco_engine::connector::{Connector, SimConnector};
use oco_engine::domain::{Candle, PriceSpec, Side};
use oco_engine::engine::EntryRequest;
use oco_engine::{Engine, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).context("loading configuration")?;

    let connector = Arc::new(SimConnector::new(config.trading.initial_balance));
    connector.set_price("BTC/USDT", dec!(50000));

    let engine = Arc::new(Engine::new(
        Arc::clone(&connector) as Arc<dyn Connector>,
        config,
    )?);
    let report = engine.startup().await?;
    tracing::info!(?report, "startup reconciliation complete");

    let position = engine
        .execute_entry(&EntryRequest {
            symbol: "BTC/USDT".into(),
            side: Side::Long,
            equity_fraction: dec!(0.1),
            leverage: 5,
            tp: PriceSpec::Relative(dec!(0.02)),
            sl: PriceSpec::Relative(dec!(0.01)),
        })
        .await?;
    tracing::info!(
        trade_id = %position.trade_id,
        tp = %position.tp_level,
        sl = %position.sl_level,
        "bracketed position open"
    );

    // Walk the market up through the take-profit.
    for price in [dec!(50200), dec!(50600), dec!(51100)] {
        connector.set_price("BTC/USDT", price);
        let candle = Candle::new(price - dec!(100), price + dec!(50), price - dec!(150), price);
        engine.on_candle("BTC/USDT", &candle).await;
    }

    let summary = engine.shutdown().await;
    tracing::info!(
        session_id = %summary.session_id,
        wins = summary.stats.wins,
        losses = summary.stats.losses,
        pnl = %summary.realized_pnl,
        balance = %summary.balance.total,
        "session finished"
    );
    Ok(())
}

/// Structured logging with env-based filtering.
///
/// Uses static directive strings that are compile-time constants
/// guaranteed to parse.
#[allow(clippy::expect_used)]
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "oco_engine=info"
                    .parse()
                    .expect("static directive 'oco_engine=info' is valid"),
            ),
        )
        .init();
}
