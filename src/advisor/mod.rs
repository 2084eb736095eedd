//! Advisory oracle — optional natural-language second opinion.
//!
//! Implements the `Advisor` trait over the Anthropic Messages API:
//! prompt construction, response parsing, and rate-limit retry with
//! exponential backoff. The engine treats any failure here — network,
//! malformed output, missing key — as "no advice"; the advisor can never
//! take the loop down.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Advice, AdviceDecision, Market, Trend};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Maximum retries on rate limit / server errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Trait & context
// ---------------------------------------------------------------------------

/// Everything the advisor sees about one market.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub market: Market,
    pub trend: Trend,
    pub volatility_pct: f64,
}

/// Abstraction over the advisory oracle. Implementors must degrade
/// gracefully: an error return is interpreted as "no advice".
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn evaluate(&self, ctx: &MarketContext) -> Result<Advice>;
}

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    system: String,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct LlmAdvisor {
    http: Client,
    api_key: Secret<String>,
    model: String,
    max_tokens: u32,
}

impl LlmAdvisor {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to build advisor HTTP client")?;
        Ok(Self {
            http,
            api_key: Secret::new(api_key),
            model,
            max_tokens,
        })
    }

    fn system_prompt() -> &'static str {
        "You advise a paper-trading engine on short-horizon Up/Down crypto \
         prediction markets. Given a market, its prices, and the underlying \
         trend, decide whether the engine should take a side.\n\n\
         RULES:\n\
         1. Think briefly about momentum, mean reversion, and what the market \
            price already reflects.\n\
         2. SKIP when you have no conviction either way.\n\
         3. Your final answer MUST be the last three lines, exactly:\n\
            DECISION: YES|NO|SKIP\n\
            CONFIDENCE: 0.XX\n\
            STAKE: 0.XX\n\
         4. Confidence is 0.00-1.00; stake is a sizing multiplier 0.00-1.50."
    }

    fn render_prompt(ctx: &MarketContext) -> String {
        format!(
            "Market: {}\nAsset: {}\nYES price: {:.2}\nNO price: {:.2}\n\
             Trend over the signal window: {}\nVolatility: {:.3}%\n\
             Minutes to close: {}\n\nShould the engine enter, and on which side?",
            ctx.market.question,
            ctx.market.asset,
            ctx.market.yes_price,
            ctx.market.no_price,
            ctx.trend,
            ctx.volatility_pct,
            ctx.market
                .time_remaining()
                .map(|d| d.num_minutes().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        )
    }

    /// Send a messages request with retry + backoff.
    async fn call_api(&self, system: &str, user_message: &str) -> Result<String> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user".to_string(),
                content: user_message.to_string(),
            }],
            system: system.to_string(),
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying advisor API call");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: MessagesResponse = response
                            .json()
                            .await
                            .context("Failed to parse advisor response")?;
                        return Ok(body
                            .content
                            .iter()
                            .filter_map(|b| b.text.as_deref())
                            .collect::<Vec<_>>()
                            .join(""));
                    }
                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        warn!(%status, attempt, "Retryable advisor API error");
                        last_error = Some(anyhow!("HTTP {status}"));
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!("Advisor API error {status}: {body}");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Advisor request failed");
                    last_error = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Advisor API failed")))
    }
}

#[async_trait]
impl Advisor for LlmAdvisor {
    async fn evaluate(&self, ctx: &MarketContext) -> Result<Advice> {
        let text = self
            .call_api(Self::system_prompt(), &Self::render_prompt(ctx))
            .await?;
        parse_advice(&text)
            .filter(Advice::is_valid)
            .ok_or_else(|| anyhow!("Advisor returned malformed output: {text}"))
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Extract the DECISION/CONFIDENCE/STAKE lines from a response, scanning
/// from the end so reasoning text above never confuses the parse.
pub fn parse_advice(text: &str) -> Option<Advice> {
    let mut decision = None;
    let mut confidence = None;
    let mut stake = None;

    for line in text.lines().rev() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("DECISION:") {
            decision.get_or_insert(match rest.trim().to_uppercase().as_str() {
                "YES" => AdviceDecision::Yes,
                "NO" => AdviceDecision::No,
                "SKIP" => AdviceDecision::Skip,
                _ => return None,
            });
        } else if let Some(rest) = line.strip_prefix("CONFIDENCE:") {
            confidence.get_or_insert(rest.trim().parse::<f64>().ok()?);
        } else if let Some(rest) = line.strip_prefix("STAKE:") {
            stake.get_or_insert(rest.trim().parse::<f64>().ok()?);
        }
        if decision.is_some() && confidence.is_some() && stake.is_some() {
            break;
        }
    }

    Some(Advice {
        decision: decision?,
        confidence: confidence?,
        stake_factor: stake?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
