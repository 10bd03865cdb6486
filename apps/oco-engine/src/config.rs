//! Configuration for the engine.
//!
//! Loaded from YAML with serde defaults for every field, so a partial
//! file (or none at all) yields a fully working configuration.
//!
//! # Usage
//!
//! ```rust,ignore
//! use oco_engine::config::{EngineConfig, load_config};
//!
//! let config = load_config(Some("engine.yaml"))?;
//! println!("state dir: {}", config.persistence.state_dir);
//! ```

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("config validation failed: {0}")]
    Validation(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trading parameters.
    #[serde(default)]
    pub trading: TradingConfig,
    /// OCO bracket creation parameters.
    #[serde(default)]
    pub oco: OcoConfig,
    /// Reconciliation parameters.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Circuit breaker parameters.
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    /// State persistence parameters.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Trading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Starting capital when no persisted session exists.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    /// Maximum number of concurrently open positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    /// Default leverage when an entry request carries none.
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    /// Candles after which a position is force-exited. Zero disables.
    #[serde(default = "default_max_hold_bars")]
    pub max_hold_bars: u32,
    /// Position sizing mode.
    #[serde(default)]
    pub sizing_mode: SizingMode,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            max_positions: default_max_positions(),
            default_leverage: default_leverage(),
            max_hold_bars: default_max_hold_bars(),
            sizing_mode: SizingMode::default(),
        }
    }
}

/// Position sizing mode for entries specifying an equity fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// Notional = equity * fraction.
    #[default]
    FixedNotional,
    /// Notional = (equity * fraction) / stop-loss distance.
    FixedRisk,
}

/// OCO bracket creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoConfig {
    /// Seconds to wait for the entry order fill.
    #[serde(default = "default_fill_timeout_secs")]
    pub fill_timeout_secs: u64,
    /// Deadline in seconds for the whole bracket operation.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Retry attempts per bracket leg.
    #[serde(default = "default_leg_retry_attempts")]
    pub leg_retry_attempts: u32,
    /// Initial backoff in milliseconds between leg retries.
    #[serde(default = "default_leg_backoff_ms")]
    pub leg_backoff_ms: u64,
}

impl Default for OcoConfig {
    fn default() -> Self {
        Self {
            fill_timeout_secs: default_fill_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            leg_retry_attempts: default_leg_retry_attempts(),
            leg_backoff_ms: default_leg_backoff_ms(),
        }
    }
}

impl OcoConfig {
    /// Entry fill wait deadline.
    #[must_use]
    pub const fn fill_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_timeout_secs)
    }

    /// Whole-bracket operation deadline.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Reconciliation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between background reconciliation passes.
    #[serde(default = "default_recon_interval_secs")]
    pub interval_secs: u64,
    /// Local position count above which an empty exchange response trips
    /// the safety valve.
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: usize,
    /// Re-fetch attempts before the safety valve aborts a pass.
    #[serde(default = "default_safety_retries")]
    pub safety_retries: u32,
    /// Seconds after entry during which a position is never repaired.
    #[serde(default = "default_protection_window_secs")]
    pub protection_window_secs: u64,
    /// Trades examined per symbol in the deep ghost search.
    #[serde(default = "default_deep_search_limit")]
    pub deep_search_limit: usize,
    /// Balance drift (in quote currency) above which the local balance is
    /// corrected to the exchange's during the background pass.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: Decimal,
    /// Milliseconds without an order update, while positions are open,
    /// before the realtime feed is considered stale.
    #[serde(default = "default_feed_timeout_ms")]
    pub feed_timeout_ms: u64,
    /// Milliseconds between feed liveness checks.
    #[serde(default = "default_feed_check_interval_ms")]
    pub feed_check_interval_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recon_interval_secs(),
            safety_threshold: default_safety_threshold(),
            safety_retries: default_safety_retries(),
            protection_window_secs: default_protection_window_secs(),
            deep_search_limit: default_deep_search_limit(),
            drift_threshold: default_drift_threshold(),
            feed_timeout_ms: default_feed_timeout_ms(),
            feed_check_interval_ms: default_feed_check_interval_ms(),
        }
    }
}

impl ReconciliationConfig {
    /// Background pass interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Repair protection window after entry.
    #[must_use]
    pub fn protection_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.protection_window_secs as i64)
    }

    /// Staleness bound for the realtime order update feed.
    #[must_use]
    pub const fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    /// Interval between feed liveness checks.
    #[must_use]
    pub const fn feed_check_interval(&self) -> Duration {
        Duration::from_millis(self.feed_check_interval_ms)
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open a breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds a breaker stays open before admitting probes.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Probe calls admitted in half-open.
    #[serde(default = "default_probe_limit")]
    pub probe_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            probe_limit: default_probe_limit(),
        }
    }
}

impl BreakerConfig {
    /// Convert to the resilience layer's breaker configuration.
    #[must_use]
    pub const fn to_breaker_config(&self) -> crate::resilience::CircuitBreakerConfig {
        crate::resilience::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            probe_limit: self.probe_limit,
        }
    }
}

/// State persistence parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding session state files.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Backups retained per session.
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
    /// Prior session files retained in the state directory.
    #[serde(default = "default_session_retention")]
    pub session_retention: usize,
    /// Milliseconds the background flusher waits after a dirty mark.
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            backup_count: default_backup_count(),
            session_retention: default_session_retention(),
            flush_debounce_ms: default_flush_debounce_ms(),
        }
    }
}

impl PersistenceConfig {
    /// Debounce window for the background flusher.
    #[must_use]
    pub const fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}

fn default_initial_balance() -> Decimal {
    dec!(10000)
}
const fn default_max_positions() -> usize {
    10
}
const fn default_leverage() -> u32 {
    1
}
const fn default_max_hold_bars() -> u32 {
    0
}
const fn default_fill_timeout_secs() -> u64 {
    10
}
const fn default_operation_timeout_secs() -> u64 {
    180
}
const fn default_leg_retry_attempts() -> u32 {
    6
}
const fn default_leg_backoff_ms() -> u64 {
    1500
}
const fn default_recon_interval_secs() -> u64 {
    300
}
const fn default_safety_threshold() -> usize {
    5
}
const fn default_safety_retries() -> u32 {
    3
}
const fn default_protection_window_secs() -> u64 {
    60
}
const fn default_deep_search_limit() -> usize {
    20
}
fn default_drift_threshold() -> Decimal {
    dec!(0.1)
}
const fn default_feed_timeout_ms() -> u64 {
    60_000
}
const fn default_feed_check_interval_ms() -> u64 {
    15_000
}
const fn default_failure_threshold() -> u32 {
    5
}
const fn default_cooldown_secs() -> u64 {
    60
}
const fn default_probe_limit() -> u32 {
    3
}
fn default_state_dir() -> String {
    "state".to_string()
}
const fn default_backup_count() -> usize {
    3
}
const fn default_session_retention() -> usize {
    20
}
const fn default_flush_debounce_ms() -> u64 {
    500
}

impl EngineConfig {
    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trading.initial_balance <= Decimal::ZERO {
            return Err(ConfigError::Validation(
                "trading.initial_balance must be positive".into(),
            ));
        }
        if self.trading.max_positions == 0 {
            return Err(ConfigError::Validation(
                "trading.max_positions must be at least 1".into(),
            ));
        }
        if self.trading.default_leverage == 0 {
            return Err(ConfigError::Validation(
                "trading.default_leverage must be at least 1".into(),
            ));
        }
        if self.oco.fill_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "oco.fill_timeout_secs must be positive".into(),
            ));
        }
        if self.oco.operation_timeout_secs < self.oco.fill_timeout_secs {
            return Err(ConfigError::Validation(
                "oco.operation_timeout_secs must cover oco.fill_timeout_secs".into(),
            ));
        }
        if self.reconciliation.safety_threshold == 0 {
            return Err(ConfigError::Validation(
                "reconciliation.safety_threshold must be at least 1".into(),
            ));
        }
        if self.reconciliation.feed_check_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "reconciliation.feed_check_interval_ms must be positive".into(),
            ));
        }
        if self.persistence.backup_count == 0 {
            return Err(ConfigError::Validation(
                "persistence.backup_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a YAML file, or defaults when `path` is `None`.
///
/// # Errors
///
/// Returns `ConfigError` when the file is unreadable, unparsable, or
/// fails validation.
pub fn load_config(path: Option<&str>) -> Result<EngineConfig, ConfigError> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            serde_yaml_bw::from_str(&raw)?
        }
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.oco.fill_timeout(), Duration::from_secs(10));
        assert_eq!(config.oco.operation_timeout(), Duration::from_secs(180));
        assert_eq!(config.reconciliation.safety_threshold, 5);
        assert_eq!(config.persistence.backup_count, 3);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r"
trading:
  initial_balance: 5000
reconciliation:
  safety_threshold: 8
";
        let config: EngineConfig = serde_yaml_bw::from_str(yaml).unwrap();
        assert_eq!(config.trading.initial_balance, dec!(5000));
        assert_eq!(config.reconciliation.safety_threshold, 8);
        // Untouched sections keep defaults.
        assert_eq!(config.trading.max_positions, 10);
        assert_eq!(config.oco.leg_retry_attempts, 6);
    }

    #[test]
    fn validation_rejects_zero_balance() {
        let mut config = EngineConfig::default();
        config.trading.initial_balance = Decimal::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn validation_rejects_inverted_timeouts() {
        let mut config = EngineConfig::default();
        config.oco.operation_timeout_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.trading.max_positions, 10);
    }

    #[test]
    fn sizing_mode_parses_snake_case() {
        let yaml = "trading:\n  sizing_mode: fixed_risk\n";
        let config: EngineConfig = serde_yaml_bw::from_str(yaml).unwrap();
        assert_eq!(config.trading.sizing_mode, SizingMode::FixedRisk);
    }
}
