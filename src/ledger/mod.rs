//! Portfolio ledger — the virtual account.
//!
//! Holds balance, open positions, and the immutable trade history.
//! Mutated only through the `executor` module; no side effects beyond
//! in-memory state. Callers are responsible for durability via the
//! `storage::DurableStore` collaborator.

pub mod executor;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{EngineError, Outcome, Position, Quote, Trade};

/// The virtual account: balance plus open positions and trade history.
///
/// Sum of all position costs never exceeds the initial balance plus
/// cumulative settlement payouts — money only moves through fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub balance: Decimal,
    /// Highest balance ever observed (drawdown reference).
    pub peak_balance: Decimal,
    pub positions: Vec<Position>,
    pub trades: Vec<Trade>,
}

impl Portfolio {
    /// Create a fresh portfolio with the given starting balance.
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            balance: initial_balance,
            peak_balance: initial_balance,
            positions: Vec::new(),
            trades: Vec::new(),
        }
    }

    /// Apply a signed balance delta and refresh the peak.
    pub fn apply(&mut self, delta: Decimal) {
        self.balance += delta;
        if self.balance > self.peak_balance {
            self.peak_balance = self.balance;
        }
    }

    /// Net holding for one outcome of one market, if any.
    pub fn get_position(&self, market_id: &str, outcome: Outcome) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.market_id == market_id && p.outcome == outcome)
    }

    /// Add quantity at a price, creating the position or averaging into it.
    pub fn add_position(
        &mut self,
        market_id: &str,
        outcome: Outcome,
        quantity: Decimal,
        price: Decimal,
    ) {
        match self
            .positions
            .iter_mut()
            .find(|p| p.market_id == market_id && p.outcome == outcome)
        {
            Some(pos) => {
                let total_cost = pos.cost() + quantity * price;
                pos.quantity += quantity;
                pos.avg_price = total_cost / pos.quantity;
            }
            None => self.positions.push(Position {
                market_id: market_id.to_string(),
                outcome,
                quantity,
                avg_price: price,
            }),
        }
    }

    /// Remove quantity from a position. The position is deleted — never
    /// left at zero — when fully sold.
    pub fn reduce_position(
        &mut self,
        market_id: &str,
        outcome: Outcome,
        quantity: Decimal,
    ) -> Result<(), EngineError> {
        let idx = self
            .positions
            .iter()
            .position(|p| p.market_id == market_id && p.outcome == outcome)
            .ok_or_else(|| EngineError::InsufficientPosition {
                market_id: market_id.to_string(),
                outcome,
                have: Decimal::ZERO,
                want: quantity,
            })?;

        let pos = &mut self.positions[idx];
        if pos.quantity < quantity {
            return Err(EngineError::InsufficientPosition {
                market_id: market_id.to_string(),
                outcome,
                have: pos.quantity,
                want: quantity,
            });
        }

        pos.quantity -= quantity;
        if pos.quantity.is_zero() {
            self.positions.remove(idx);
        }
        Ok(())
    }

    /// Total cost basis of all open positions.
    pub fn total_open_cost(&self) -> Decimal {
        self.positions.iter().map(|p| p.cost()).sum()
    }

    /// Balance plus positions valued at mark prices. A position with no
    /// mark defaults to its cost basis.
    pub fn total_value(&self, marks: &HashMap<String, Quote>) -> Decimal {
        let positions: Decimal = self
            .positions
            .iter()
            .map(|p| match marks.get(&p.market_id) {
                Some(q) => p.market_value(q.price_for(p.outcome)),
                None => p.cost(),
            })
            .sum();
        self.balance + positions
    }

    /// Unrealized P&L across all positions at mark prices. Positions with
    /// no mark contribute zero (marked at cost).
    pub fn unrealized_pnl(&self, marks: &HashMap<String, Quote>) -> Decimal {
        self.positions
            .iter()
            .filter_map(|p| {
                marks
                    .get(&p.market_id)
                    .map(|q| p.unrealized_pnl(q.price_for(p.outcome)))
            })
            .sum()
    }

    /// Drawdown from peak as a fraction (0.0 = at peak).
    pub fn drawdown(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        if self.peak_balance <= Decimal::ZERO {
            return 0.0;
        }
        (Decimal::ONE - self.balance / self.peak_balance)
            .to_f64()
            .unwrap_or(0.0)
            .max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
