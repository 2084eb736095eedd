//! Entry-decision strategy.
//!
//! Value betting: enter a side only when the decision confidence exceeds
//! the current market price by a configured margin and clears an absolute
//! minimum. Arbitrage: when YES + NO trade below the threshold, buying
//! both sides locks in a payout above cost regardless of outcome.
//!
//! The probability source is pluggable behind the `Scorer` trait; the
//! default implementation derives a mild tilt from the oracle's trend and
//! volatility signals. The optional advisory oracle can veto, confirm, or
//! scale an entry.

pub mod risk;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use crate::types::{Advice, AdviceDecision, Market, Outcome, Quote, Trend};

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// A probability/confidence estimate for a market's YES side.
#[derive(Debug, Clone, Copy)]
pub struct Score {
    /// Estimated probability that YES (up) wins.
    pub prob_yes: f64,
    /// Decision confidence for the favoured side (0–1).
    pub confidence: f64,
}

/// Pluggable probability source. Returning `None` means "no opinion";
/// the market is skipped.
pub trait Scorer: Send + Sync {
    fn score(&self, market: &Market, trend: Trend, volatility_pct: f64) -> Option<Score>;
}

/// Default scorer: a trend-following tilt damped by volatility.
///
/// A bullish window nudges the YES probability above 50%, a bearish one
/// below; the nudge shrinks as the asset gets noisier.
pub struct TrendScorer {
    /// Maximum probability tilt away from 50%.
    pub tilt: f64,
}

impl Default for TrendScorer {
    fn default() -> Self {
        Self { tilt: 0.18 }
    }
}

impl Scorer for TrendScorer {
    fn score(&self, _market: &Market, trend: Trend, volatility_pct: f64) -> Option<Score> {
        let direction = match trend {
            Trend::Bullish => 1.0,
            Trend::Bearish => -1.0,
            Trend::Neutral => return None,
        };
        let tilt = self.tilt / (1.0 + volatility_pct.max(0.0));
        let prob_yes = (0.5 + direction * tilt).clamp(0.01, 0.99);
        Some(Score {
            prob_yes,
            confidence: prob_yes.max(1.0 - prob_yes),
        })
    }
}

// ---------------------------------------------------------------------------
// Entry policy
// ---------------------------------------------------------------------------

/// Outcome of evaluating one market for entry.
#[derive(Debug, Clone)]
pub enum EntryDecision {
    Enter {
        outcome: Outcome,
        confidence: f64,
        /// Advisory stake multiplier (1.0 when no advisor weighed in).
        stake_factor: f64,
    },
    Skip {
        reason: String,
    },
}

/// Value-betting entry rule.
pub struct EntryPolicy {
    /// Confidence must exceed the market price by at least this much.
    pub margin: f64,
    /// Absolute confidence floor.
    pub min_confidence: f64,
}

impl EntryPolicy {
    pub fn new(margin: f64, min_confidence: f64) -> Self {
        Self {
            margin,
            min_confidence,
        }
    }

    /// Decide whether to enter a market given a score and optional advice.
    ///
    /// Invalid advice is ignored (the advisor degrades to absent). Valid
    /// advice can veto (SKIP), flip nothing — a disagreeing advisor kills
    /// the entry — or confirm and contribute its stake factor.
    pub fn decide(&self, market: &Market, score: &Score, advice: Option<&Advice>) -> EntryDecision {
        let (outcome, mut confidence) = if score.prob_yes >= 0.5 {
            (Outcome::Yes, score.confidence)
        } else {
            (Outcome::No, score.confidence)
        };
        let mut stake_factor = 1.0;

        if let Some(advice) = advice.filter(|a| a.is_valid()) {
            match advice.decision {
                AdviceDecision::Skip => {
                    return EntryDecision::Skip {
                        reason: "advisor says skip".into(),
                    };
                }
                AdviceDecision::Yes if outcome == Outcome::No => {
                    return EntryDecision::Skip {
                        reason: "advisor disagrees with signal".into(),
                    };
                }
                AdviceDecision::No if outcome == Outcome::Yes => {
                    return EntryDecision::Skip {
                        reason: "advisor disagrees with signal".into(),
                    };
                }
                _ => {
                    confidence = confidence.max(advice.confidence);
                    stake_factor = advice.stake_factor;
                }
            }
        }

        if confidence < self.min_confidence {
            return EntryDecision::Skip {
                reason: format!(
                    "confidence {:.0}% below floor {:.0}%",
                    confidence * 100.0,
                    self.min_confidence * 100.0
                ),
            };
        }

        let price = market
            .quote()
            .price_for(outcome)
            .to_f64()
            .unwrap_or(1.0);
        if confidence <= price + self.margin {
            return EntryDecision::Skip {
                reason: format!(
                    "no edge: confidence {:.0}% vs price {:.0}¢ + margin",
                    confidence * 100.0,
                    price * 100.0
                ),
            };
        }

        debug!(
            market_id = %market.id,
            %outcome,
            confidence = format!("{:.0}%", confidence * 100.0),
            "Entry signal"
        );
        EntryDecision::Enter {
            outcome,
            confidence,
            stake_factor,
        }
    }
}

// ---------------------------------------------------------------------------
// Arbitrage
// ---------------------------------------------------------------------------

/// Whether buying both sides at this quote locks in a risk-free profit:
/// combined price under the threshold and at least `min_profit` per $1
/// payout.
pub fn is_arbitrage(quote: &Quote, threshold: Decimal, min_profit: Decimal) -> bool {
    let combined = quote.combined();
    if combined <= Decimal::ZERO {
        // A zeroed book means no data, not free money.
        return false;
    }
    combined < threshold && (Decimal::ONE - combined) >= min_profit
}

/// Size an arbitrage pair: commit `fraction` of balance (capped), split
/// into an equal share quantity on both sides so the settlement payout is
/// `quantity × $1` whichever side wins.
pub fn arbitrage_quantity(
    balance: Decimal,
    fraction: Decimal,
    cap: Decimal,
    quote: &Quote,
) -> Decimal {
    let combined = quote.combined();
    if combined <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let stake = (balance * fraction).min(cap);
    (stake / combined).round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
