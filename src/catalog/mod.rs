//! Market catalog — Up/Down market discovery and pricing.
//!
//! Defines the `MarketCatalog` trait consumed by the scanning loop and
//! the watcher's instrument mapping, plus a Gamma-API-backed client.
//! Market data is free and unauthenticated; the engine never submits
//! real orders to the venue.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::types::{Market, Quote};

const DEFAULT_LIMIT: u32 = 100;

/// Symbols the catalog recognises in market questions/slugs.
const KNOWN_ASSETS: &[(&str, &[&str])] = &[
    ("BTC", &["btc", "bitcoin"]),
    ("ETH", &["eth", "ethereum"]),
    ("SOL", &["sol", "solana"]),
    ("XRP", &["xrp", "ripple"]),
    ("DOGE", &["doge", "dogecoin"]),
];

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Filter applied to a market listing.
#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    /// Only markets on this underlying asset.
    pub asset: Option<String>,
    /// Skip markets below this 24h volume.
    pub min_volume_24h: Option<Decimal>,
}

/// Abstraction over the prediction-market venue's listing API.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    /// List open Up/Down markets matching the filter.
    async fn list_markets(&self, filter: &MarketFilter) -> Result<Vec<Market>>;

    /// Current YES/NO prices for one market, if it is still listed.
    async fn prices_for(&self, market_id: &str) -> Result<Option<Quote>>;
}

// ---------------------------------------------------------------------------
// Gamma API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[allow(dead_code)]
pub struct GammaMarket {
    #[serde(default)]
    pub question: String,
    #[serde(default, rename = "conditionId")]
    pub condition_id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(default, rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: bool,
    /// Outcome prices as JSON string: "[\"0.65\",\"0.35\"]"
    #[serde(default, rename = "outcomePrices")]
    pub outcome_prices: Option<String>,
    /// Instrument ids as JSON string: "[\"123...\",\"456...\"]"
    #[serde(default, rename = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default, rename = "volumeNum")]
    pub volume_num: Option<f64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GammaCatalog {
    http: Client,
    base_url: String,
}

impl GammaCatalog {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build catalog HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn fetch_gamma_markets(&self, condition_id: Option<&str>) -> Result<Vec<GammaMarket>> {
        let mut url = format!(
            "{}/markets?active=true&closed=false&limit={DEFAULT_LIMIT}",
            self.base_url
        );
        if let Some(id) = condition_id {
            url.push_str(&format!("&condition_ids={}", urlencoding::encode(id)));
        }
        debug!(url, "Fetching markets from Gamma API");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Gamma API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gamma API error {status}: {body}");
        }

        let markets: Vec<GammaMarket> = resp
            .json()
            .await
            .context("Failed to parse Gamma markets response")?;
        Ok(markets)
    }

    /// Convert a Gamma market into our internal Market type. Markets
    /// without a recognisable underlying asset, prices, or instrument ids
    /// are not Up/Down markets we can trade.
    pub fn convert_market(gm: &GammaMarket) -> Option<Market> {
        if gm.condition_id.is_empty() || gm.question.is_empty() {
            return None;
        }
        let asset = extract_asset(&gm.question, &gm.slug)?;
        let (yes_price, no_price) = parse_pair(gm.outcome_prices.as_deref().unwrap_or(""))
            .and_then(|(y, n)| Some((y.parse::<Decimal>().ok()?, n.parse::<Decimal>().ok()?)))?;
        let (yes_token, no_token) = parse_pair(gm.clob_token_ids.as_deref().unwrap_or(""))?;

        Some(Market {
            id: gm.condition_id.clone(),
            question: gm.question.clone(),
            asset,
            yes_price,
            no_price,
            yes_token,
            no_token,
            start_time: parse_timestamp(gm.start_date.as_deref()),
            end_time: parse_timestamp(gm.end_date.as_deref()),
            volume_24h: gm
                .volume
                .or(gm.volume_num)
                .and_then(Decimal::from_f64_retain)
                .unwrap_or(Decimal::ZERO),
        })
    }
}

#[async_trait]
impl MarketCatalog for GammaCatalog {
    async fn list_markets(&self, filter: &MarketFilter) -> Result<Vec<Market>> {
        let raw = self.fetch_gamma_markets(None).await?;
        let raw_count = raw.len();

        let markets: Vec<Market> = raw
            .iter()
            .filter(|gm| gm.active && !gm.closed)
            .filter_map(GammaCatalog::convert_market)
            .filter(|m| matches_filter(m, filter))
            .collect();

        info!(
            raw = raw_count,
            kept = markets.len(),
            "Market listing fetched"
        );
        Ok(markets)
    }

    async fn prices_for(&self, market_id: &str) -> Result<Option<Quote>> {
        let raw = self.fetch_gamma_markets(Some(market_id)).await?;
        Ok(raw
            .iter()
            .find(|gm| gm.condition_id == market_id)
            .and_then(GammaCatalog::convert_market)
            .map(|m| m.quote()))
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse Gamma's stringified two-element arrays.
/// Handles: "[\"0.65\",\"0.35\"]", "0.65, 0.35", etc.
pub fn parse_pair(s: &str) -> Option<(String, String)> {
    let cleaned = s.replace(['[', ']', '"', '\\'], "");
    let parts: Vec<&str> = cleaned.split(',').map(|p| p.trim()).collect();
    if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
        Some((parts[0].to_string(), parts[1].to_string()))
    } else {
        None
    }
}

fn parse_timestamp(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|d| {
        DateTime::parse_from_rfc3339(d)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Identify the underlying asset from the question or slug.
pub fn extract_asset(question: &str, slug: &str) -> Option<String> {
    let haystack = format!("{} {}", question.to_lowercase(), slug.to_lowercase());
    for (symbol, aliases) in KNOWN_ASSETS {
        if aliases.iter().any(|a| haystack.contains(a)) {
            return Some((*symbol).to_string());
        }
    }
    None
}

fn matches_filter(market: &Market, filter: &MarketFilter) -> bool {
    if let Some(asset) = &filter.asset {
        if &market.asset != asset {
            return false;
        }
    }
    if let Some(min_vol) = filter.min_volume_24h {
        if market.volume_24h < min_vol {
            return false;
        }
    }
    market.is_open()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn gamma_fixture() -> GammaMarket {
        GammaMarket {
            question: "Bitcoin Up or Down — August 6, 3PM ET".to_string(),
            condition_id: "0xabc123".to_string(),
            slug: "bitcoin-up-or-down-august-6-3pm-et".to_string(),
            start_date: Some("2026-08-06T19:00:00Z".to_string()),
            end_date: Some("2026-08-06T20:00:00Z".to_string()),
            active: true,
            closed: false,
            outcome_prices: Some("[\"0.52\",\"0.48\"]".to_string()),
            clob_token_ids: Some("[\"111222\",\"333444\"]".to_string()),
            volume: Some(15000.0),
            volume_num: None,
        }
    }

    #[test]
    fn test_parse_pair_quoted_array() {
        let (a, b) = parse_pair("[\"0.65\",\"0.35\"]").unwrap();
        assert_eq!(a, "0.65");
        assert_eq!(b, "0.35");
    }

    #[test]
    fn test_parse_pair_bare() {
        let (a, b) = parse_pair("0.65, 0.35").unwrap();
        assert_eq!(a, "0.65");
        assert_eq!(b, "0.35");
    }

    #[test]
    fn test_parse_pair_invalid() {
        assert!(parse_pair("").is_none());
        assert!(parse_pair("[\"0.65\"]").is_none());
    }

    #[test]
    fn test_extract_asset() {
        assert_eq!(
            extract_asset("Bitcoin Up or Down", "btc-updown").as_deref(),
            Some("BTC")
        );
        assert_eq!(
            extract_asset("Ethereum Up or Down", "").as_deref(),
            Some("ETH")
        );
        assert_eq!(extract_asset("", "solana-hourly").as_deref(), Some("SOL"));
        assert!(extract_asset("Will it rain in Sydney?", "sydney-rain").is_none());
    }

    #[test]
    fn test_convert_market_full() {
        let m = GammaCatalog::convert_market(&gamma_fixture()).unwrap();
        assert_eq!(m.id, "0xabc123");
        assert_eq!(m.asset, "BTC");
        assert_eq!(m.yes_price, dec!(0.52));
        assert_eq!(m.no_price, dec!(0.48));
        assert_eq!(m.yes_token, "111222");
        assert_eq!(m.no_token, "333444");
        assert!(m.start_time.is_some());
        assert!(m.end_time.is_some());
        assert_eq!(m.volume_24h, dec!(15000));
    }

    #[test]
    fn test_convert_market_rejects_non_crypto() {
        let mut gm = gamma_fixture();
        gm.question = "Will it rain tomorrow?".to_string();
        gm.slug = "rain-tomorrow".to_string();
        assert!(GammaCatalog::convert_market(&gm).is_none());
    }

    #[test]
    fn test_convert_market_rejects_missing_prices() {
        let mut gm = gamma_fixture();
        gm.outcome_prices = None;
        assert!(GammaCatalog::convert_market(&gm).is_none());
    }

    #[test]
    fn test_convert_market_rejects_missing_tokens() {
        let mut gm = gamma_fixture();
        gm.clob_token_ids = Some("[]".to_string());
        assert!(GammaCatalog::convert_market(&gm).is_none());
    }

    #[test]
    fn test_filter_by_asset_and_volume() {
        let mut m = GammaCatalog::convert_market(&gamma_fixture()).unwrap();
        // Keep the market open for filtering purposes.
        m.end_time = Some(Utc::now() + chrono::Duration::hours(1));

        assert!(matches_filter(&m, &MarketFilter::default()));
        assert!(matches_filter(
            &m,
            &MarketFilter {
                asset: Some("BTC".to_string()),
                min_volume_24h: Some(dec!(1000)),
            }
        ));
        assert!(!matches_filter(
            &m,
            &MarketFilter {
                asset: Some("ETH".to_string()),
                ..Default::default()
            }
        ));
        assert!(!matches_filter(
            &m,
            &MarketFilter {
                min_volume_24h: Some(dec!(100000)),
                ..Default::default()
            }
        ));
    }

    #[test]
    fn test_filter_rejects_ended_market() {
        let mut m = GammaCatalog::convert_market(&gamma_fixture()).unwrap();
        m.end_time = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(!matches_filter(&m, &MarketFilter::default()));
    }

    #[test]
    fn test_gamma_deserialization() {
        let json = r#"{
            "question": "Bitcoin Up or Down",
            "conditionId": "0xdef",
            "slug": "bitcoin-up-or-down",
            "endDate": "2026-08-06T20:00:00Z",
            "active": true,
            "closed": false,
            "outcomePrices": "[\"0.5\",\"0.5\"]",
            "clobTokenIds": "[\"1\",\"2\"]",
            "volumeNum": 2000.0
        }"#;
        let gm: GammaMarket = serde_json::from_str(json).unwrap();
        assert_eq!(gm.condition_id, "0xdef");
        let m = GammaCatalog::convert_market(&gm).unwrap();
        assert_eq!(m.volume_24h, dec!(2000));
        assert!(m.start_time.is_none());
    }
}
