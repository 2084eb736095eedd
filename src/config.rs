//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.
//!
//! Every heuristic business constant (sizing fractions, drawdown
//! thresholds, exposure ceilings, arbitrage thresholds, reconnect policy)
//! lives here rather than in code.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub risk: RiskSettings,
    pub oracle: OracleConfig,
    pub catalog: CatalogConfig,
    pub advisor: AdvisorConfig,
    pub watcher: WatcherConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
    /// Scanning loop period in seconds.
    pub scan_interval_secs: u64,
    /// Delay after a failed cycle before the next one.
    pub error_backoff_secs: u64,
    pub initial_balance: Decimal,
    /// Delay after a market's end time before settlement queries the oracle.
    pub settlement_buffer_secs: u64,
    /// Entry rule: confidence must exceed market price by this margin.
    pub entry_margin: f64,
    /// Entry rule: absolute minimum confidence.
    pub min_confidence: f64,
    /// Combined YES+NO price below which the pair is an arbitrage.
    pub arb_threshold: Decimal,
    /// Minimum arbitrage profit per $1 payout.
    pub arb_min_profit: Decimal,
    /// Fraction of balance committed to a scanning-loop arbitrage entry.
    pub arb_fraction: Decimal,
    /// Take-profit tier 1: gain fraction at which half the position exits.
    pub take_profit_half: Decimal,
    /// Take-profit tier 2: gain fraction at which the rest exits.
    pub take_profit_full: Decimal,
    /// Stop-loss distance as a fraction of entry price.
    pub stop_loss_pct: Decimal,
}

/// Risk circuit-breaker and sizing settings (see strategy::risk).
#[derive(Debug, Deserialize, Clone)]
pub struct RiskSettings {
    /// Drawdown from peak that triggers emergency liquidation.
    pub emergency_drawdown: f64,
    /// Daily drawdown that pauses new entries.
    pub daily_pause_drawdown: f64,
    /// Weekly drawdown that halves position sizing.
    pub weekly_reduce_drawdown: f64,
    /// Base position size as a fraction of balance.
    pub base_fraction: f64,
    /// Hard ceiling on position size as a fraction of balance.
    pub max_fraction: f64,
    /// Absolute stake cap in dollars (scaled by the stake multiplier).
    pub max_stake_usd: Decimal,
    /// Total open cost ceiling as a fraction of balance.
    pub max_total_exposure: f64,
    /// Per-asset open cost ceiling as a fraction of balance.
    pub max_asset_exposure: f64,
    /// Maximum number of concurrently open bets.
    pub max_open_bets: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Window used for trend/volatility queries, in minutes.
    pub signal_window_mins: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Skip markets below this 24h volume.
    pub min_volume_24h: Decimal,
    /// Underlying assets to scan for.
    pub assets: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdvisorConfig {
    pub enabled: bool,
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub ws_url: String,
    /// Base reconnect delay in milliseconds; doubles per failure.
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub reconnect_cap_ms: u64,
    /// Consecutive failures after which the watcher goes terminal.
    pub max_reconnect_attempts: u32,
    /// Fraction of balance committed to a watcher arbitrage entry.
    pub stake_fraction: Decimal,
    /// Absolute cap on a watcher arbitrage stake.
    pub stake_cap_usd: Decimal,
    /// Rolling price-history length per instrument.
    pub history_len: usize,
    /// How often the instrument→market mapping is refreshed, in seconds.
    pub mapping_refresh_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding portfolio.json and bets.json.
    pub dir: String,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
