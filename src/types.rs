//! Shared types for the UPDOWN engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that collaborator clients, strategy,
//! and engine modules can depend on them without circular references.
//!
//! Monetary quantities (balances, share prices, costs, payouts) are
//! `rust_decimal::Decimal`. Signal-space quantities (probabilities,
//! confidence, volatility, underlying asset prices) are `f64`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// One of the two complementary sides of a binary Up/Down market.
///
/// YES is the "Up" side (end price above start price), NO the "Down" side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    /// The opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders & trades
// ---------------------------------------------------------------------------

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Execution style of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    TrailingStop,
}

/// Order lifecycle status. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// Whether this status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

/// A request to trade one outcome of one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Limit price for Limit orders.
    pub limit_price: Option<Decimal>,
    /// Trigger price for Stop orders.
    pub stop_price: Option<Decimal>,
    /// Trail distance as a fraction of the watermark (TrailingStop only).
    pub trailing_pct: Option<Decimal>,
    /// Best price seen since placement (TrailingStop only). The trigger
    /// level derived from it only ever moves in the position's favor.
    pub watermark: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Quantity still unfilled.
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Whether the order can still fill.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {} {} x{} [{:?}]",
            self.order_type, self.side, self.outcome, self.market_id, self.quantity, self.status,
        )
    }
}

/// Immutable execution record. Appended to the ledger on every fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub market_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// Gross notional value (quantity × price, before fees).
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} x{} @ {:.2}¢ (fee ${:.4})",
            self.side,
            self.outcome,
            self.market_id,
            self.quantity,
            self.price * Decimal::from(100),
            self.fee,
        )
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Net holding in one outcome of one market.
///
/// Created on the first buy fill for a (market, outcome) pair and
/// quantity-averaged on subsequent buys. Removed — never left at zero —
/// when fully sold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

impl Position {
    /// Cost basis of this position.
    pub fn cost(&self) -> Decimal {
        self.quantity * self.avg_price
    }

    /// Value at a mark price.
    pub fn market_value(&self, mark: Decimal) -> Decimal {
        self.quantity * mark
    }

    /// Unrealized P&L at a mark price.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        self.market_value(mark) - self.cost()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} x{} @ {:.2}¢",
            self.outcome,
            self.market_id,
            self.quantity,
            self.avg_price * Decimal::from(100),
        )
    }
}

// ---------------------------------------------------------------------------
// Market & quotes
// ---------------------------------------------------------------------------

/// Current YES/NO share prices for a market.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub yes_price: Decimal,
    pub no_price: Decimal,
}

impl Quote {
    /// Price of one side.
    pub fn price_for(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes_price,
            Outcome::No => self.no_price,
        }
    }

    /// Combined YES + NO price. Below $1 the pair is underpriced.
    pub fn combined(&self) -> Decimal {
        self.yes_price + self.no_price
    }
}

/// An Up/Down market on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    /// Underlying asset symbol, e.g. "BTC".
    pub asset: String,
    /// Current YES price (0.0–1.0).
    pub yes_price: Decimal,
    /// Current NO price (0.0–1.0).
    pub no_price: Decimal,
    /// Venue instrument id for the YES side (order book subscriptions).
    pub yes_token: String,
    /// Venue instrument id for the NO side.
    pub no_token: String,
    /// Start of the price window the market resolves over.
    pub start_time: Option<DateTime<Utc>>,
    /// End of the price window; resolution reference.
    pub end_time: Option<DateTime<Utc>>,
    /// 24-hour volume in USD equivalent.
    pub volume_24h: Decimal,
}

impl Market {
    /// Current quote for both sides.
    pub fn quote(&self) -> Quote {
        Quote {
            yes_price: self.yes_price,
            no_price: self.no_price,
        }
    }

    /// Whether the market window has not yet ended.
    pub fn is_open(&self) -> bool {
        match self.end_time {
            Some(end) => end > Utc::now(),
            None => false,
        }
    }

    /// Time remaining until the market window ends.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.end_time.map(|end| end - Utc::now())
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (YES: {:.0}¢ | NO: {:.0}¢ | vol: ${:.0})",
            self.asset,
            self.question,
            self.yes_price * Decimal::from(100),
            self.no_price * Decimal::from(100),
            self.volume_24h,
        )
    }
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

/// Lifecycle state of a tracked bet.
///
/// `Active → Won | Lost` via settlement, or `Active → Exited` via the
/// early-close path. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetStatus {
    Active,
    Won,
    Lost,
    Exited,
}

impl BetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BetStatus::Active)
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetStatus::Active => write!(f, "ACTIVE"),
            BetStatus::Won => write!(f, "WON"),
            BetStatus::Lost => write!(f, "LOST"),
            BetStatus::Exited => write!(f, "EXITED"),
        }
    }
}

/// One placed wager, tracked end-to-end from entry fill to resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub market_id: String,
    pub asset: String,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub cost: Decimal,
    /// Share price at which the position is abandoned early.
    pub stop_loss: Option<Decimal>,
    pub placed_at: DateTime<Utc>,
    pub market_start: Option<DateTime<Utc>>,
    pub market_end: Option<DateTime<Utc>>,
    /// Underlying asset price observed at entry time.
    pub entry_reference_price: Option<f64>,
    pub status: BetStatus,
    /// Outcome the market actually resolved to (set at settlement).
    pub resolved_outcome: Option<Outcome>,
    /// Settlement payout or early-exit proceeds.
    pub payout: Option<Decimal>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Bet {
    /// When this bet becomes eligible for settlement: the market's end
    /// time plus the settlement buffer. None if the market never recorded
    /// an end time (such bets are skipped with a logged reason).
    pub fn settle_due_at(&self, buffer: Duration) -> Option<DateTime<Utc>> {
        self.market_end.map(|end| end + buffer)
    }

    /// Realized profit once terminal: payout minus cost.
    pub fn realized_pnl(&self) -> Option<Decimal> {
        self.payout.map(|p| p - self.cost)
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} x{} @ {:.2}¢ cost=${:.2} ({})",
            self.asset,
            self.outcome,
            self.market_id,
            self.quantity,
            self.entry_price * Decimal::from(100),
            self.cost,
            self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Oracle & advisory types
// ---------------------------------------------------------------------------

/// Short-horizon direction of the underlying asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Bullish => write!(f, "bullish"),
            Trend::Bearish => write!(f, "bearish"),
            Trend::Neutral => write!(f, "neutral"),
        }
    }
}

/// Advisory verdict on a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdviceDecision {
    Yes,
    No,
    Skip,
}

/// Output of the advisory oracle. Malformed or unreachable advisors are
/// treated as absent by callers; this type is always well-formed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advice {
    pub decision: AdviceDecision,
    /// Self-reported confidence (0–1).
    pub confidence: f64,
    /// Stake multiplier (0–1.5) applied on top of risk sizing.
    pub stake_factor: f64,
}

impl Advice {
    /// Whether the fields are within their documented bounds.
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence) && (0.0..=1.5).contains(&self.stake_factor)
    }
}

// ---------------------------------------------------------------------------
// Portfolio summary
// ---------------------------------------------------------------------------

/// Point-in-time portfolio snapshot for surrounding tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub balance: Decimal,
    pub peak_balance: Decimal,
    pub total_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: usize,
    pub open_bets: usize,
    pub trades_recorded: usize,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for UPDOWN.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Insufficient balance: need ${needed:.2}, have ${available:.2}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("Insufficient position in {market_id} {outcome}: have {have}, want {want}")]
    InsufficientPosition {
        market_id: String,
        outcome: Outcome,
        have: Decimal,
        want: Decimal,
    },

    #[error("Market not found: {0}")]
    MarketNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order {0} is terminal and cannot change")]
    OrderTerminal(String),

    #[error("Oracle has no price for {asset} at {at}")]
    PriceUnavailable { asset: String, at: String },

    #[error("Risk limit: {0}")]
    RiskLimit(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
