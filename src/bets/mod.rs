//! Bet lifecycle store.
//!
//! The single source of truth for which bets are active and which are
//! settled. A bet id lives in exactly one of the two sets at any time.
//! Every transition is persisted through the `DurableStore` before the
//! in-memory sets change (write-then-commit): a failed durable write
//! leaves the in-memory state untouched and the operation errors out.

pub mod settlement;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::{DurableStore, HistoryFilter};
use crate::types::{Bet, BetStatus, Outcome};

/// Everything known about a wager at entry time. The store assigns the id.
#[derive(Debug, Clone)]
pub struct BetTicket {
    pub market_id: String,
    pub asset: String,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub market_start: Option<DateTime<Utc>>,
    pub market_end: Option<DateTime<Utc>>,
    pub entry_reference_price: Option<f64>,
}

pub struct BetStore {
    active: HashMap<String, Bet>,
    history: Vec<Bet>,
    store: Arc<dyn DurableStore>,
}

impl BetStore {
    /// Restore the store from durable state.
    pub fn load(store: Arc<dyn DurableStore>) -> Result<Self> {
        let active_bets = store.load_active_bets().context("Failed to load active bets")?;
        let history = store
            .load_history(&HistoryFilter::default())
            .context("Failed to load bet history")?;

        info!(
            active = active_bets.len(),
            settled = history.len(),
            "Bet store restored"
        );

        Ok(Self {
            active: active_bets.into_iter().map(|b| (b.id.clone(), b)).collect(),
            history,
            store,
        })
    }

    /// Record a freshly filled entry: assigns a new bet id, persists the
    /// record as ACTIVE, then adds it to the in-memory active set.
    pub fn add_active_bet(&mut self, ticket: BetTicket) -> Result<Bet> {
        let bet = Bet {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: ticket.market_id,
            asset: ticket.asset,
            outcome: ticket.outcome,
            quantity: ticket.quantity,
            entry_price: ticket.entry_price,
            cost: ticket.quantity * ticket.entry_price,
            stop_loss: ticket.stop_loss,
            placed_at: Utc::now(),
            market_start: ticket.market_start,
            market_end: ticket.market_end,
            entry_reference_price: ticket.entry_reference_price,
            status: BetStatus::Active,
            resolved_outcome: None,
            payout: None,
            settled_at: None,
        };

        self.store
            .upsert_active_bet(&bet)
            .context("Failed to persist new bet")?;
        self.active.insert(bet.id.clone(), bet.clone());

        info!(bet_id = %bet.id, bet = %bet, "Bet recorded");
        Ok(bet)
    }

    /// Rewrite an active bet record (partial early exits shrink the
    /// quantity and accumulate proceeds).
    pub fn update_active_bet(&mut self, bet: Bet) -> Result<()> {
        if !self.active.contains_key(&bet.id) {
            anyhow::bail!("Bet {} is not active", bet.id);
        }
        self.store
            .upsert_active_bet(&bet)
            .context("Failed to persist bet update")?;
        debug!(bet_id = %bet.id, quantity = %bet.quantity, "Active bet updated");
        self.active.insert(bet.id.clone(), bet);
        Ok(())
    }

    /// Move a bet from active to history under its terminal status.
    /// Durable first; the in-memory sets only change after the write lands.
    pub fn complete(&mut self, bet: Bet) -> Result<()> {
        debug_assert!(bet.status.is_terminal());

        self.store
            .move_to_history(&bet)
            .context("Failed to persist bet completion")?;

        self.active.remove(&bet.id);
        self.history.retain(|b| b.id != bet.id);
        self.history.push(bet);
        Ok(())
    }

    pub fn get_active(&self, bet_id: &str) -> Option<&Bet> {
        self.active.get(bet_id)
    }

    pub fn is_active(&self, bet_id: &str) -> bool {
        self.active.contains_key(bet_id)
    }

    pub fn active_bets(&self) -> Vec<Bet> {
        self.active.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Total cost of open bets, optionally restricted to one asset.
    pub fn open_cost(&self, asset: Option<&str>) -> Decimal {
        self.active
            .values()
            .filter(|b| asset.map_or(true, |a| b.asset == a))
            .map(|b| b.cost)
            .sum()
    }

    /// Whether any active bet already covers this market+outcome.
    pub fn has_active_on(&self, market_id: &str, outcome: Outcome) -> bool {
        self.active
            .values()
            .any(|b| b.market_id == market_id && b.outcome == outcome)
    }

    pub fn history(&self, filter: &HistoryFilter) -> Vec<Bet> {
        self.history
            .iter()
            .filter(|b| {
                filter.market_id.as_ref().map_or(true, |m| &b.market_id == m)
                    && filter.status.map_or(true, |s| b.status == s)
                    && filter.since.map_or(true, |t| b.placed_at >= t)
            })
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
