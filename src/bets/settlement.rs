//! Settlement engine — resolves concluded bets and early exits.
//!
//! Resolution asks the price oracle for the underlying price at the
//! market's start and end; the market resolves YES exactly when the end
//! price is above the start price. A price-unchanged tie resolves NO,
//! mirroring the venue's observed behaviour.
//!
//! Every transition routes a SELL through the order executor so the
//! ledger stays consistent: settlement sells at $1.00 (won) or $0.00
//! (lost), early exits sell at the market price. Oracle calls happen
//! before any lock is taken; the bet-store lock is only held for the
//! in-memory transition and its durable write.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::bets::BetStore;
use crate::ledger::executor::OrderExecutor;
use crate::oracle::PriceOracle;
use crate::types::{Bet, BetStatus, EngineError, OrderSide, Outcome, Quote};

/// Result of a single settlement attempt. Everything except `Settled`
/// leaves the bet active; a retry next cycle is always safe.
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// The bet resolved and moved to history.
    Settled(Bet),
    /// The settlement buffer has not elapsed yet.
    NotDue { due_at: DateTime<Utc> },
    /// The bet is not in the active set (settled earlier, or unknown).
    AlreadySettled,
    /// Data was missing; left active for the next cycle.
    Deferred(String),
}

pub struct SettlementEngine {
    bets: Arc<Mutex<BetStore>>,
    executor: Arc<OrderExecutor>,
    oracle: Arc<dyn PriceOracle>,
    /// Delay after market end before the oracle is queried.
    buffer: Duration,
}

/// YES exactly when the end price exceeds the start price; ties resolve NO.
pub fn resolve_outcome(start_price: f64, end_price: f64) -> Outcome {
    if end_price > start_price {
        Outcome::Yes
    } else {
        Outcome::No
    }
}

impl SettlementEngine {
    pub fn new(
        bets: Arc<Mutex<BetStore>>,
        executor: Arc<OrderExecutor>,
        oracle: Arc<dyn PriceOracle>,
        buffer: Duration,
    ) -> Self {
        Self {
            bets,
            executor,
            oracle,
            buffer,
        }
    }

    pub fn bets(&self) -> Arc<Mutex<BetStore>> {
        Arc::clone(&self.bets)
    }

    /// Attempt to settle one bet. Idempotent: attempts on already-settled
    /// or not-yet-due bets are safe no-ops.
    pub async fn settle(&self, bet_id: &str) -> Result<SettlementOutcome> {
        // Snapshot under the lock; all network I/O happens after release.
        let bet = {
            let store = self.bets.lock().expect("bet store lock poisoned");
            match store.get_active(bet_id) {
                Some(b) => b.clone(),
                None => return Ok(SettlementOutcome::AlreadySettled),
            }
        };

        let (Some(start), Some(end)) = (bet.market_start, bet.market_end) else {
            warn!(bet_id, "Bet has no market timestamps; cannot settle");
            return Ok(SettlementOutcome::Deferred("missing market timestamps".into()));
        };

        let due_at = end + self.buffer;
        if Utc::now() < due_at {
            return Ok(SettlementOutcome::NotDue { due_at });
        }

        let Some(start_price) = self.oracle.price_at_time(&bet.asset, start).await? else {
            warn!(bet_id, asset = %bet.asset, "Oracle has no start price yet; deferring");
            return Ok(SettlementOutcome::Deferred("no start price".into()));
        };
        let Some(end_price) = self.oracle.price_at_time(&bet.asset, end).await? else {
            warn!(bet_id, asset = %bet.asset, "Oracle has no end price yet; deferring");
            return Ok(SettlementOutcome::Deferred("no end price".into()));
        };

        let resolved = resolve_outcome(start_price, end_price);
        let won = resolved == bet.outcome;
        let settle_price = if won { Decimal::ONE } else { Decimal::ZERO };

        // Route the settlement through the executor so balance, position,
        // and trade history stay consistent.
        match self.executor.place_market_order(
            &bet.market_id,
            bet.outcome,
            OrderSide::Sell,
            bet.quantity,
            settle_price,
        ) {
            Ok(_) => {}
            Err(EngineError::InsufficientPosition { .. }) => {
                // A previous attempt already routed the sell but failed to
                // commit the record move. Resolve the record only.
                warn!(bet_id, "Position already closed; finalizing record only");
            }
            Err(e) => return Err(e.into()),
        }

        let mut settled = bet;
        settled.status = if won { BetStatus::Won } else { BetStatus::Lost };
        settled.resolved_outcome = Some(resolved);
        settled.payout =
            Some(settled.payout.unwrap_or(Decimal::ZERO) + settled.quantity * settle_price);
        settled.settled_at = Some(Utc::now());

        {
            let mut store = self.bets.lock().expect("bet store lock poisoned");
            if !store.is_active(&settled.id) {
                return Ok(SettlementOutcome::AlreadySettled);
            }
            store.complete(settled.clone())?;
        }

        info!(
            bet_id = %settled.id,
            status = %settled.status,
            start_price,
            end_price,
            payout = %settled.payout.unwrap_or(Decimal::ZERO),
            "Bet settled"
        );
        Ok(SettlementOutcome::Settled(settled))
    }

    /// Settle every active bet whose buffer has elapsed. One bad item
    /// never stops the sweep; errors degrade to a deferred result for
    /// that bet.
    pub async fn settle_all_ready(&self) -> Vec<(String, SettlementOutcome)> {
        let now = Utc::now();
        let due: Vec<String> = {
            let store = self.bets.lock().expect("bet store lock poisoned");
            store
                .active_bets()
                .into_iter()
                .filter(|b| match b.settle_due_at(self.buffer) {
                    Some(due_at) => due_at <= now,
                    None => {
                        warn!(bet_id = %b.id, "Skipping bet with no end time");
                        false
                    }
                })
                .map(|b| b.id)
                .collect()
        };

        let mut results = Vec::with_capacity(due.len());
        for bet_id in due {
            match self.settle(&bet_id).await {
                Ok(outcome) => results.push((bet_id, outcome)),
                Err(e) => {
                    error!(bet_id = %bet_id, error = %e, "Settlement attempt failed; will retry");
                    results.push((bet_id, SettlementOutcome::Deferred(e.to_string())));
                }
            }
        }
        results
    }

    // -- Early exit --------------------------------------------------------

    /// Close an active bet entirely at the given share price and move it
    /// to history as EXITED.
    pub fn exit_bet(&self, bet_id: &str, price: Decimal, reason: &str) -> Result<Bet> {
        let bet = {
            let store = self.bets.lock().expect("bet store lock poisoned");
            store
                .get_active(bet_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Bet {bet_id} is not active"))?
        };

        match self.executor.place_market_order(
            &bet.market_id,
            bet.outcome,
            OrderSide::Sell,
            bet.quantity,
            price,
        ) {
            Ok(_) => {}
            Err(EngineError::InsufficientPosition { .. }) => {
                warn!(bet_id, "Position already closed; finalizing record only");
            }
            Err(e) => return Err(e.into()),
        }

        let mut exited = bet;
        exited.status = BetStatus::Exited;
        exited.payout = Some(exited.payout.unwrap_or(Decimal::ZERO) + exited.quantity * price);
        exited.settled_at = Some(Utc::now());

        {
            let mut store = self.bets.lock().expect("bet store lock poisoned");
            if store.is_active(&exited.id) {
                store.complete(exited.clone())?;
            }
        }

        info!(
            bet_id = %exited.id,
            %price,
            reason,
            proceeds = %exited.payout.unwrap_or(Decimal::ZERO),
            "Bet exited early"
        );
        Ok(exited)
    }

    /// Sell part of an active bet at the given price. The record stays
    /// active with the reduced quantity; proceeds accumulate on it.
    pub fn exit_partial(&self, bet_id: &str, quantity: Decimal, price: Decimal) -> Result<Bet> {
        let bet = {
            let store = self.bets.lock().expect("bet store lock poisoned");
            store
                .get_active(bet_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Bet {bet_id} is not active"))?
        };
        if quantity >= bet.quantity {
            return self.exit_bet(bet_id, price, "partial exit covering full size");
        }

        self.executor.place_market_order(
            &bet.market_id,
            bet.outcome,
            OrderSide::Sell,
            quantity,
            price,
        )?;

        let mut reduced = bet;
        reduced.quantity -= quantity;
        reduced.payout = Some(reduced.payout.unwrap_or(Decimal::ZERO) + quantity * price);

        {
            let mut store = self.bets.lock().expect("bet store lock poisoned");
            store.update_active_bet(reduced.clone())?;
        }

        info!(bet_id = %reduced.id, sold = %quantity, %price, "Bet partially exited");
        Ok(reduced)
    }

    /// Emergency liquidation: close every open bet via market SELL at the
    /// best available mark, regardless of profitability. Falls back to the
    /// entry price when no mark exists.
    pub fn liquidate_all(&self, marks: &HashMap<String, Quote>) -> Vec<Bet> {
        let active = {
            let store = self.bets.lock().expect("bet store lock poisoned");
            store.active_bets()
        };

        let mut exited = Vec::new();
        for bet in active {
            let price = marks
                .get(&bet.market_id)
                .map(|q| q.price_for(bet.outcome))
                .unwrap_or(bet.entry_price);
            match self.exit_bet(&bet.id, price, "emergency liquidation") {
                Ok(b) => exited.push(b),
                Err(e) => error!(bet_id = %bet.id, error = %e, "Liquidation failed for bet"),
            }
        }
        exited
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
