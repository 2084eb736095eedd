//! Price oracle — reference prices for the underlying assets.
//!
//! Defines the `PriceOracle` trait consumed by settlement and strategy,
//! and a Binance-backed implementation over the public ticker/klines
//! endpoints. Absence of data is signalled distinctly from zero: every
//! price query returns `Option<f64>` and `None` means "no data", which
//! callers treat as "defer, retry later" rather than guessing.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::Trend;

/// Maximum retries on transient errors (timeouts, 429, 5xx).
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 500;

/// Relative move below which a window counts as trendless.
const TREND_THRESHOLD: f64 = 0.001;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the reference price source.
///
/// Implementors must tolerate and signal absence distinctly from zero.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Latest traded price for an asset.
    async fn current_price(&self, asset: &str) -> Result<Option<f64>>;

    /// Price of an asset at a specific historical instant.
    async fn price_at_time(&self, asset: &str, at: DateTime<Utc>) -> Result<Option<f64>>;

    /// Direction of the asset over a trailing window.
    async fn recent_trend(&self, asset: &str, window: Duration) -> Result<Trend>;

    /// Short-horizon volatility over a trailing window, as a percentage.
    async fn volatility(&self, asset: &str, window: Duration) -> Result<f64>;
}

// ---------------------------------------------------------------------------
// Binance implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PriceTicker {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

pub struct BinanceOracle {
    http: Client,
    base_url: String,
}

impl BinanceOracle {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build oracle HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn symbol(asset: &str) -> String {
        format!("{}USDT", asset.to_uppercase())
    }

    /// GET with bounded exponential-backoff retry on transient failures.
    /// Non-retryable HTTP errors surface immediately.
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, url, "Retrying oracle request");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        warn!(%status, attempt, "Retryable oracle error");
                        last_error = Some(anyhow!("HTTP {status}"));
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("Oracle request failed {status}: {body}");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Oracle request failed");
                    last_error = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Oracle request failed")))
    }

    /// Fetch 1-minute kline close prices covering `[start, end)`.
    /// Returns an empty vec when the venue has no data for the range.
    async fn fetch_minute_closes(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&endTime={}&limit=1000",
            self.base_url,
            Self::symbol(asset),
            start.timestamp_millis(),
            end.timestamp_millis(),
        );
        let resp = self.get_with_retry(&url).await?;
        let klines: Vec<Vec<serde_json::Value>> =
            resp.json().await.context("Failed to parse klines response")?;

        // Close price is index 4 of each kline array.
        let closes = klines
            .iter()
            .filter_map(|k| k.get(4).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()))
            .collect();
        Ok(closes)
    }
}

#[async_trait]
impl PriceOracle for BinanceOracle {
    async fn current_price(&self, asset: &str) -> Result<Option<f64>> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            Self::symbol(asset)
        );
        let resp = match self.get_with_retry(&url).await {
            Ok(r) => r,
            // An unknown symbol is absence, not an error worth raising.
            Err(e) if e.to_string().contains("400") => return Ok(None),
            Err(e) => return Err(e),
        };
        let ticker: PriceTicker = resp.json().await.context("Failed to parse price ticker")?;
        Ok(ticker.price.parse::<f64>().ok())
    }

    async fn price_at_time(&self, asset: &str, at: DateTime<Utc>) -> Result<Option<f64>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&endTime={}&limit=1",
            self.base_url,
            Self::symbol(asset),
            at.timestamp_millis(),
            at.timestamp_millis() + 60_000,
        );
        let resp = self.get_with_retry(&url).await?;
        let klines: Vec<Vec<serde_json::Value>> =
            resp.json().await.context("Failed to parse kline response")?;

        if klines.is_empty() {
            return Ok(None);
        }
        // Open price of the candle that started at `at` is index 1.
        Ok(klines[0]
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()))
    }

    async fn recent_trend(&self, asset: &str, window: Duration) -> Result<Trend> {
        let now = Utc::now();
        let closes = self.fetch_minute_closes(asset, now - window, now).await?;
        Ok(compute_trend(&closes))
    }

    async fn volatility(&self, asset: &str, window: Duration) -> Result<f64> {
        let now = Utc::now();
        let closes = self.fetch_minute_closes(asset, now - window, now).await?;
        Ok(compute_volatility(&closes))
    }
}

// ---------------------------------------------------------------------------
// Signal helpers
// ---------------------------------------------------------------------------

/// Classify the direction of a close series. Empty or flat series are
/// neutral.
pub fn compute_trend(closes: &[f64]) -> Trend {
    let (Some(first), Some(last)) = (closes.first(), closes.last()) else {
        return Trend::Neutral;
    };
    if *first <= 0.0 {
        return Trend::Neutral;
    }
    let change = (last - first) / first;
    if change > TREND_THRESHOLD {
        Trend::Bullish
    } else if change < -TREND_THRESHOLD {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

/// Standard deviation of minute-over-minute returns, as a percentage.
/// Fewer than three points yields zero (no meaningful dispersion).
pub fn compute_volatility(closes: &[f64]) -> f64 {
    if closes.len() < 3 {
        return 0.0;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    var.sqrt() * 100.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_mapping() {
        assert_eq!(BinanceOracle::symbol("btc"), "BTCUSDT");
        assert_eq!(BinanceOracle::symbol("ETH"), "ETHUSDT");
    }

    #[test]
    fn test_trend_bullish() {
        let closes = vec![100.0, 100.5, 101.0, 102.0];
        assert_eq!(compute_trend(&closes), Trend::Bullish);
    }

    #[test]
    fn test_trend_bearish() {
        let closes = vec![102.0, 101.0, 100.0];
        assert_eq!(compute_trend(&closes), Trend::Bearish);
    }

    #[test]
    fn test_trend_neutral_small_move() {
        let closes = vec![100.0, 100.01, 100.05];
        assert_eq!(compute_trend(&closes), Trend::Neutral);
    }

    #[test]
    fn test_trend_empty_is_neutral() {
        assert_eq!(compute_trend(&[]), Trend::Neutral);
        assert_eq!(compute_trend(&[100.0]), Trend::Neutral);
    }

    #[test]
    fn test_volatility_flat_series_is_zero() {
        let closes = vec![100.0; 10];
        assert_eq!(compute_volatility(&closes), 0.0);
    }

    #[test]
    fn test_volatility_increases_with_dispersion() {
        let calm = vec![100.0, 100.1, 100.0, 100.1, 100.0, 100.1];
        let wild = vec![100.0, 103.0, 98.0, 104.0, 97.0, 105.0];
        assert!(compute_volatility(&wild) > compute_volatility(&calm));
    }

    #[test]
    fn test_volatility_too_few_points() {
        assert_eq!(compute_volatility(&[100.0, 101.0]), 0.0);
    }

    #[test]
    fn test_kline_close_parsing() {
        // Binance returns klines as positional arrays; close is index 4.
        let raw = serde_json::json!([
            [1700000000000i64, "100.0", "101.0", "99.0", "100.5", "12.3", 1700000059999i64, "0", 10, "0", "0", "0"],
            [1700000060000i64, "100.5", "102.0", "100.0", "101.5", "15.0", 1700000119999i64, "0", 12, "0", "0", "0"]
        ]);
        let klines: Vec<Vec<serde_json::Value>> = serde_json::from_value(raw).unwrap();
        let closes: Vec<f64> = klines
            .iter()
            .filter_map(|k| k.get(4).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()))
            .collect();
        assert_eq!(closes, vec![100.5, 101.5]);
    }
}
