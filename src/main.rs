//! UPDOWN — Paper-Trading Engine for Up/Down Crypto Prediction Markets
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores state from disk (or creates fresh), starts the scanning loop
//! and the real-time watcher, and shuts both down cleanly on Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use updown::advisor::{Advisor, LlmAdvisor};
use updown::catalog::GammaCatalog;
use updown::config::AppConfig;
use updown::engine::Engine;
use updown::oracle::BinanceOracle;
use updown::storage::JsonStore;
use updown::strategy::TrendScorer;

const BANNER: &str = r#"
 _   _ ____  ____   _____        ___   _
| | | |  _ \|  _ \ / _ \ \      / / \ | |
| | | | |_) | | | | | | \ \ /\ / /|  \| |
| |_| |  __/| |_| | |_| |\ V  V / | |\  |
 \___/|_|   |____/ \___/  \_/\_/  |_| \_|

  Up/Down Prediction Market Paper Trader
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        name = %cfg.engine.name,
        scan_interval_secs = cfg.engine.scan_interval_secs,
        initial_balance = %cfg.engine.initial_balance,
        "UPDOWN starting up"
    );

    // -- Collaborators -----------------------------------------------------

    let store = Arc::new(JsonStore::open(&cfg.storage.dir)?);
    let catalog = Arc::new(GammaCatalog::new(
        cfg.catalog.base_url.clone(),
        cfg.catalog.timeout_secs,
    )?);
    let oracle = Arc::new(BinanceOracle::new(
        cfg.oracle.base_url.clone(),
        cfg.oracle.timeout_secs,
    )?);

    let advisor: Option<Arc<dyn Advisor>> = if cfg.advisor.enabled {
        match AppConfig::resolve_env(&cfg.advisor.api_key_env) {
            Ok(key) => {
                info!(model = %cfg.advisor.model, "Advisory oracle enabled");
                Some(Arc::new(LlmAdvisor::new(
                    key,
                    cfg.advisor.model.clone(),
                    cfg.advisor.max_tokens,
                )?))
            }
            Err(e) => {
                warn!(error = %e, "Advisor key missing — running without advice");
                None
            }
        }
    } else {
        None
    };

    // -- Engine ------------------------------------------------------------

    let mut engine = Engine::new(
        cfg,
        store,
        catalog,
        oracle,
        advisor,
        Arc::new(TrendScorer::default()),
    )?;

    let watcher_handle = engine.start_watcher();
    let monitor_handle = engine.start_monitor();

    info!("Engine running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    engine.stop();
    monitor_handle.await?;
    if let Some(handle) = watcher_handle {
        handle.await?;
    }

    let summary = engine.get_portfolio_summary();
    info!(
        balance = format!("${:.2}", summary.balance),
        total_value = format!("${:.2}", summary.total_value),
        open_bets = summary.open_bets,
        trades = summary.trades_recorded,
        "UPDOWN shut down cleanly."
    );

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("updown=info"));

    let json_logging = std::env::var("UPDOWN_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
