//! Persistence layer.
//!
//! Saves and loads engine state to/from JSON files under a configurable
//! directory: `portfolio.json` (balance, positions, trade history) and
//! `bets.json` (active bets keyed by id, plus settled history).
//!
//! Both collections of `bets.json` live in one document and every write
//! goes through a temp-file + atomic rename, so a reader never observes a
//! bet in the active set and the history set at the same time, and a
//! crash mid-write leaves the previous file intact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::ledger::Portfolio;
use crate::types::{Bet, BetStatus};

const PORTFOLIO_FILE: &str = "portfolio.json";
const BETS_FILE: &str = "bets.json";

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Filter for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub market_id: Option<String>,
    pub status: Option<BetStatus>,
    pub since: Option<DateTime<Utc>>,
}

/// Durable storage contract consumed by the ledger executor and the bet
/// lifecycle store. Implementations must be crash-safe: a failed write
/// returns an error and leaves the previous state readable.
pub trait DurableStore: Send + Sync {
    fn save_portfolio(&self, portfolio: &Portfolio) -> Result<()>;
    fn load_portfolio(&self) -> Result<Option<Portfolio>>;

    /// Insert or replace an active bet record by id.
    fn upsert_active_bet(&self, bet: &Bet) -> Result<()>;

    /// Atomically remove a bet from the active set and append its settled
    /// record to history.
    fn move_to_history(&self, bet: &Bet) -> Result<()>;

    fn load_active_bets(&self) -> Result<Vec<Bet>>;
    fn load_history(&self, filter: &HistoryFilter) -> Result<Vec<Bet>>;
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// On-disk layout of `bets.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BetsDocument {
    active: BTreeMap<String, Bet>,
    history: Vec<Bet>,
}

/// JSON-file-backed store.
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Open (creating the directory if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Write JSON to `path` via a temp file and atomic rename.
    fn write_atomic<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.path(file);
        let tmp = self.path(&format!("{file}.tmp"));
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialise {file}"))?;
        std::fs::write(&tmp, &json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to commit {}", path.display()))?;
        debug!(file, bytes = json.len(), "State saved");
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Option<T>> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn load_bets_doc(&self) -> Result<BetsDocument> {
        Ok(self.read_json::<BetsDocument>(BETS_FILE)?.unwrap_or_default())
    }
}

impl DurableStore for JsonStore {
    fn save_portfolio(&self, portfolio: &Portfolio) -> Result<()> {
        self.write_atomic(PORTFOLIO_FILE, portfolio)
    }

    fn load_portfolio(&self) -> Result<Option<Portfolio>> {
        let loaded = self.read_json::<Portfolio>(PORTFOLIO_FILE)?;
        match &loaded {
            Some(p) => info!(balance = %p.balance, "Portfolio loaded from disk"),
            None => info!("No saved portfolio found, starting fresh"),
        }
        Ok(loaded)
    }

    fn upsert_active_bet(&self, bet: &Bet) -> Result<()> {
        let mut doc = self.load_bets_doc()?;
        doc.active.insert(bet.id.clone(), bet.clone());
        self.write_atomic(BETS_FILE, &doc)
    }

    fn move_to_history(&self, bet: &Bet) -> Result<()> {
        let mut doc = self.load_bets_doc()?;
        doc.active.remove(&bet.id);
        // Replace rather than duplicate if a retried settlement lands twice.
        doc.history.retain(|b| b.id != bet.id);
        doc.history.push(bet.clone());
        self.write_atomic(BETS_FILE, &doc)
    }

    fn load_active_bets(&self) -> Result<Vec<Bet>> {
        Ok(self.load_bets_doc()?.active.into_values().collect())
    }

    fn load_history(&self, filter: &HistoryFilter) -> Result<Vec<Bet>> {
        let doc = self.load_bets_doc()?;
        Ok(doc
            .history
            .into_iter()
            .filter(|b| {
                filter.market_id.as_ref().map_or(true, |m| &b.market_id == m)
                    && filter.status.map_or(true, |s| b.status == s)
                    && filter.since.map_or(true, |t| b.placed_at >= t)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;
    use rust_decimal_macros::dec;

    fn temp_store() -> JsonStore {
        let mut p = std::env::temp_dir();
        p.push(format!("updown_test_store_{}", uuid::Uuid::new_v4()));
        JsonStore::open(p).unwrap()
    }

    fn make_bet(id: &str) -> Bet {
        Bet {
            id: id.to_string(),
            market_id: "mkt-1".to_string(),
            asset: "BTC".to_string(),
            outcome: Outcome::Yes,
            quantity: dec!(100),
            entry_price: dec!(0.50),
            cost: dec!(50),
            stop_loss: None,
            placed_at: Utc::now(),
            market_start: None,
            market_end: None,
            entry_reference_price: None,
            status: BetStatus::Active,
            resolved_outcome: None,
            payout: None,
            settled_at: None,
        }
    }

    #[test]
    fn test_portfolio_roundtrip() {
        let store = temp_store();
        assert!(store.load_portfolio().unwrap().is_none());

        let portfolio = Portfolio::new(dec!(10000));
        store.save_portfolio(&portfolio).unwrap();

        let loaded = store.load_portfolio().unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(10000));
    }

    #[test]
    fn test_active_bet_upsert_and_load() {
        let store = temp_store();
        store.upsert_active_bet(&make_bet("b1")).unwrap();
        store.upsert_active_bet(&make_bet("b2")).unwrap();

        // Upsert replaces by id rather than duplicating.
        let mut updated = make_bet("b1");
        updated.quantity = dec!(50);
        store.upsert_active_bet(&updated).unwrap();

        let active = store.load_active_bets().unwrap();
        assert_eq!(active.len(), 2);
        let b1 = active.iter().find(|b| b.id == "b1").unwrap();
        assert_eq!(b1.quantity, dec!(50));
    }

    #[test]
    fn test_move_to_history_is_exclusive() {
        let store = temp_store();
        store.upsert_active_bet(&make_bet("b1")).unwrap();

        let mut settled = make_bet("b1");
        settled.status = BetStatus::Won;
        settled.payout = Some(dec!(100));
        store.move_to_history(&settled).unwrap();

        let active = store.load_active_bets().unwrap();
        let history = store.load_history(&HistoryFilter::default()).unwrap();
        assert!(active.is_empty());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BetStatus::Won);

        // A retried move does not duplicate the history record.
        store.move_to_history(&settled).unwrap();
        assert_eq!(store.load_history(&HistoryFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_history_filters() {
        let store = temp_store();

        let mut won = make_bet("b1");
        won.status = BetStatus::Won;
        let mut lost = make_bet("b2");
        lost.status = BetStatus::Lost;
        lost.market_id = "mkt-2".to_string();
        store.move_to_history(&won).unwrap();
        store.move_to_history(&lost).unwrap();

        let only_won = store
            .load_history(&HistoryFilter {
                status: Some(BetStatus::Won),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(only_won.len(), 1);
        assert_eq!(only_won[0].id, "b1");

        let only_mkt2 = store
            .load_history(&HistoryFilter {
                market_id: Some("mkt-2".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(only_mkt2.len(), 1);
        assert_eq!(only_mkt2[0].id, "b2");
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let store = temp_store();
        store.upsert_active_bet(&make_bet("b1")).unwrap();
        assert!(!store.path("bets.json.tmp").exists());
        assert!(store.path("bets.json").exists());
    }
}
