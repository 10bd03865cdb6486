//! Crash-safe state snapshots.
//!
//! Every save writes the full engine state to a temp file, fsyncs it and
//! renames it over the canonical `state.json`, so a crash mid-write
//! never corrupts the previous snapshot. The prior snapshot is rotated
//! into a small backup chain first.
//!
//! ```text
//!   <state_dir>/sessions/<session_id>/
//!       state.json        canonical snapshot
//!       state.json.bak1   previous save
//!       state.json.bak2   ...
//! ```
//!
//! Recovery walks the canonical file, then the backups newest-first,
//! then forks the most recent prior session under the new session id.
//! A recovered snapshot is a cache of last known state, not the truth;
//! callers must reconcile against the exchange before trading on it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::domain::{ClosedTrade, Position};
use crate::error::{EngineError, EngineResult};
use crate::position::TrackerStats;

/// Snapshot format version. Bump on incompatible layout changes.
pub const STATE_VERSION: &str = "2.0.0";

const STATE_FILE: &str = "state.json";

/// Balance ledger fields carried in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Session starting capital.
    pub initial_balance: Decimal,
    /// Capital free for new positions.
    pub available: Decimal,
    /// Capital reserved as margin.
    pub blocked: Decimal,
}

/// Complete engine state as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// Snapshot format version.
    pub version: String,
    /// Session the snapshot belongs to.
    pub session_id: String,
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
    /// Open positions.
    pub positions: Vec<Position>,
    /// Balance ledger.
    pub balance: BalanceRecord,
    /// Realized statistics.
    pub stats: TrackerStats,
    /// Closed trade history.
    pub closed_trades: Vec<ClosedTrade>,
}

/// Atomic file store for engine snapshots, one directory per session.
#[derive(Debug)]
pub struct StateStore {
    sessions_dir: PathBuf,
    session_id: String,
    backup_count: usize,
}

impl StateStore {
    /// Open a store under the configured state directory with a fresh
    /// session id, creating directories as needed and pruning sessions
    /// beyond the retention limit.
    ///
    /// # Errors
    ///
    /// Fails when the session directory cannot be created.
    pub fn open(config: &PersistenceConfig) -> EngineResult<Self> {
        let session_id = new_session_id();
        let store = Self::open_session(config, session_id)?;
        store.prune_sessions(config.session_retention);
        Ok(store)
    }

    fn open_session(config: &PersistenceConfig, session_id: String) -> EngineResult<Self> {
        let sessions_dir = Path::new(&config.state_dir).join("sessions");
        fs::create_dir_all(sessions_dir.join(&session_id))?;
        Ok(Self {
            sessions_dir,
            session_id,
            backup_count: config.backup_count,
        })
    }

    /// This store's session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_dir(&self) -> PathBuf {
        self.sessions_dir.join(&self.session_id)
    }

    /// Write a snapshot atomically, rotating the previous one into the
    /// backup chain.
    ///
    /// # Errors
    ///
    /// Fails on serialization or filesystem errors; the previous
    /// snapshot stays intact in either case.
    pub fn save(&self, state: &PersistedState) -> EngineResult<()> {
        let dir = self.session_dir();
        let canonical = dir.join(STATE_FILE);
        let tmp = dir.join(format!("{STATE_FILE}.tmp"));

        let payload = serde_json::to_vec_pretty(state)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }

        if canonical.exists() {
            self.rotate_backups(&dir);
            // The canonical file becomes the newest backup.
            if let Err(err) = fs::rename(&canonical, dir.join(format!("{STATE_FILE}.bak1"))) {
                warn!(%err, "backup rotation failed, overwriting in place");
            }
        }
        fs::rename(&tmp, &canonical)?;
        Ok(())
    }

    fn rotate_backups(&self, dir: &Path) {
        for slot in (1..self.backup_count).rev() {
            let from = dir.join(format!("{STATE_FILE}.bak{slot}"));
            let to = dir.join(format!("{STATE_FILE}.bak{}", slot + 1));
            if from.exists() {
                if let Err(err) = fs::rename(&from, &to) {
                    warn!(%err, slot, "backup rotation step failed");
                }
            }
        }
    }

    /// Load the best available snapshot for this session: canonical
    /// first, then backups newest-first.
    #[must_use]
    pub fn load(&self) -> Option<PersistedState> {
        Self::load_from_dir(&self.session_dir(), self.backup_count)
    }

    fn load_from_dir(dir: &Path, backup_count: usize) -> Option<PersistedState> {
        let mut candidates = vec![dir.join(STATE_FILE)];
        for slot in 1..=backup_count {
            candidates.push(dir.join(format!("{STATE_FILE}.bak{slot}")));
        }

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match fs::read(&path).map_err(EngineError::from).and_then(|bytes| {
                serde_json::from_slice::<PersistedState>(&bytes).map_err(EngineError::from)
            }) {
                Ok(state) => {
                    if state.version != STATE_VERSION {
                        warn!(
                            found = %state.version,
                            expected = STATE_VERSION,
                            path = %path.display(),
                            "snapshot version mismatch, skipping"
                        );
                        continue;
                    }
                    return Some(state);
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "unreadable snapshot, trying next");
                }
            }
        }
        None
    }

    /// Recover state into this session: this session's own files first,
    /// then a fork of the most recent prior session. A forked snapshot
    /// is re-stamped with the current session id.
    #[must_use]
    pub fn recover(&self) -> Option<PersistedState> {
        if let Some(own) = self.load() {
            return Some(own);
        }

        let previous = self.latest_prior_session()?;
        let mut state = Self::load_from_dir(&previous, self.backup_count)?;
        info!(
            from = %previous.display(),
            session_id = %self.session_id,
            positions = state.positions.len(),
            "forked state from prior session"
        );
        state.session_id.clone_from(&self.session_id);
        state
            .positions
            .iter_mut()
            .for_each(|p| p.recovered = true);
        Some(state)
    }

    fn latest_prior_session(&self) -> Option<PathBuf> {
        let mut sessions: Vec<PathBuf> = fs::read_dir(&self.sessions_dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| p.file_name().is_some_and(|n| n != self.session_id.as_str()))
            .collect();
        // Session ids sort chronologically by construction.
        sessions.sort();
        sessions.pop()
    }

    /// Delete session directories beyond the retention limit, oldest
    /// first. The current session is always kept.
    pub fn prune_sessions(&self, retention: usize) {
        let Ok(entries) = fs::read_dir(&self.sessions_dir) else {
            return;
        };
        let mut sessions: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        sessions.sort();

        while sessions.len() > retention {
            let victim = sessions.remove(0);
            if victim
                .file_name()
                .is_some_and(|n| n == self.session_id.as_str())
            {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(&victim) {
                warn!(path = %victim.display(), %err, "session prune failed");
            }
        }
    }
}

fn new_session_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..6]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PersistenceConfig {
        PersistenceConfig {
            state_dir: dir.path().to_string_lossy().into_owned(),
            backup_count: 3,
            session_retention: 20,
            flush_debounce_ms: 10,
        }
    }

    fn snapshot(session_id: &str) -> PersistedState {
        PersistedState {
            version: STATE_VERSION.to_string(),
            session_id: session_id.to_string(),
            saved_at: Utc::now(),
            positions: Vec::new(),
            balance: BalanceRecord {
                initial_balance: dec!(10000),
                available: dec!(9800),
                blocked: dec!(200),
            },
            stats: TrackerStats::default(),
            closed_trades: Vec::new(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&config(&dir)).unwrap();

        let mut state = snapshot(store.session_id());
        state.balance.blocked = dec!(123.45);
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.session_id, store.session_id());
        assert_eq!(loaded.balance.blocked, dec!(123.45));
        assert_eq!(loaded.version, STATE_VERSION);
    }

    #[test]
    fn saves_rotate_backups() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&config(&dir)).unwrap();

        for i in 1..=5u32 {
            let mut state = snapshot(store.session_id());
            state.balance.available = Decimal::from(i);
            store.save(&state).unwrap();
        }

        let session_dir = dir
            .path()
            .join("sessions")
            .join(store.session_id());
        assert!(session_dir.join("state.json").exists());
        assert!(session_dir.join("state.json.bak1").exists());
        assert!(session_dir.join("state.json.bak3").exists());
        assert!(!session_dir.join("state.json.bak4").exists());

        // Canonical is the newest, bak1 the one before it.
        let canonical: PersistedState =
            serde_json::from_slice(&fs::read(session_dir.join("state.json")).unwrap()).unwrap();
        let bak1: PersistedState =
            serde_json::from_slice(&fs::read(session_dir.join("state.json.bak1")).unwrap()).unwrap();
        assert_eq!(canonical.balance.available, dec!(5));
        assert_eq!(bak1.balance.available, dec!(4));
    }

    #[test]
    fn interrupted_write_leaves_previous_snapshot_readable() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&config(&dir)).unwrap();

        store.save(&snapshot(store.session_id())).unwrap();

        // Simulate a crash after the temp write but before the rename.
        let tmp = dir
            .path()
            .join("sessions")
            .join(store.session_id())
            .join("state.json.tmp");
        fs::write(&tmp, b"{ \"truncat").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.balance.available, dec!(9800));
    }

    #[test]
    fn corrupt_canonical_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&config(&dir)).unwrap();

        store.save(&snapshot(store.session_id())).unwrap();
        let mut second = snapshot(store.session_id());
        second.balance.available = dec!(7777);
        store.save(&second).unwrap();

        let canonical = dir
            .path()
            .join("sessions")
            .join(store.session_id())
            .join("state.json");
        fs::write(&canonical, b"{ not json").unwrap();

        let recovered = store.recover().unwrap();
        // bak1 holds the first save.
        assert_eq!(recovered.balance.available, dec!(9800));
    }

    #[test]
    fn recover_forks_latest_prior_session() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);

        let old =
            StateStore::open_session(&cfg, "20200101-000000-aaaaaa".to_string()).unwrap();
        let mut state = snapshot(old.session_id());
        state.positions.push(sample_position());
        old.save(&state).unwrap();

        let fresh = StateStore::open(&cfg).unwrap();
        let forked = fresh.recover().unwrap();

        assert_eq!(forked.session_id, fresh.session_id());
        assert_eq!(forked.positions.len(), 1);
        assert!(forked.positions[0].recovered);
    }

    #[test]
    fn recover_with_no_history_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&config(&dir)).unwrap();
        assert!(store.recover().is_none());
    }

    #[test]
    fn prune_keeps_newest_sessions_and_self() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.session_retention = 2;

        for i in 0..4 {
            let id = format!("20200101-00000{i}-aaaaaa");
            let s = StateStore::open_session(&cfg, id).unwrap();
            s.save(&snapshot(s.session_id())).unwrap();
        }

        let store = StateStore::open(&cfg).unwrap();
        let remaining: Vec<String> = fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(remaining.contains(&store.session_id().to_string()));
        assert!(remaining.len() <= 3);
        // The oldest synthetic sessions are gone.
        assert!(!remaining.contains(&"20200101-000000-aaaaaa".to_string()));
    }

    fn sample_position() -> Position {
        use crate::domain::{PositionStatus, Side};
        Position {
            trade_id: "T-1".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Long,
            entry_price: dec!(100),
            amount: dec!(2),
            notional: dec!(200),
            margin_used: dec!(20),
            leverage: 10,
            tp_level: dec!(102),
            sl_level: dec!(99),
            liquidation_level: Some(dec!(90.5)),
            entry_time: Utc::now(),
            bars_held: 0,
            status: PositionStatus::Active,
            entry_order_id: None,
            tp_order_id: Some("OCO-TP-x".into()),
            sl_order_id: Some("OCO-SL-x".into()),
            exchange_tp_id: None,
            exchange_sl_id: None,
            pending_exit: None,
            recovered: false,
        }
    }
}
