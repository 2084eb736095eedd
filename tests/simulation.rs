//! End-to-end simulation against in-memory fake collaborators.
//!
//! Exercises the full entry → settlement money flow without any network:
//! a deterministic market catalog, a scripted price oracle, and a real
//! JSON store in a temp directory.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use updown::bets::settlement::{SettlementEngine, SettlementOutcome};
use updown::bets::{BetStore, BetTicket};
use updown::catalog::{MarketCatalog, MarketFilter};
use updown::config::AppConfig;
use updown::engine::Engine;
use updown::ledger::executor::OrderExecutor;
use updown::ledger::Portfolio;
use updown::oracle::PriceOracle;
use updown::storage::{HistoryFilter, JsonStore};
use updown::strategy::risk::{EntryGate, RiskManager};
use updown::strategy::TrendScorer;
use updown::types::{BetStatus, Market, OrderSide, Outcome, Quote, Trend};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeCatalog {
    markets: Mutex<Vec<Market>>,
}

impl FakeCatalog {
    fn new(markets: Vec<Market>) -> Self {
        Self {
            markets: Mutex::new(markets),
        }
    }
}

#[async_trait]
impl MarketCatalog for FakeCatalog {
    async fn list_markets(&self, _filter: &MarketFilter) -> Result<Vec<Market>> {
        Ok(self.markets.lock().unwrap().clone())
    }

    async fn prices_for(&self, market_id: &str) -> Result<Option<Quote>> {
        Ok(self
            .markets
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == market_id)
            .map(|m| m.quote()))
    }
}

struct ScriptedOracle {
    trend: Trend,
    volatility: f64,
    /// Prices keyed by timestamp seconds.
    prices: Mutex<HashMap<i64, f64>>,
    spot: f64,
}

impl ScriptedOracle {
    fn new(trend: Trend, spot: f64) -> Self {
        Self {
            trend,
            volatility: 0.05,
            prices: Mutex::new(HashMap::new()),
            spot,
        }
    }

    fn set_price_at(&self, at: DateTime<Utc>, price: f64) {
        self.prices.lock().unwrap().insert(at.timestamp(), price);
    }
}

#[async_trait]
impl PriceOracle for ScriptedOracle {
    async fn current_price(&self, _asset: &str) -> Result<Option<f64>> {
        Ok(Some(self.spot))
    }

    async fn price_at_time(&self, _asset: &str, at: DateTime<Utc>) -> Result<Option<f64>> {
        Ok(self.prices.lock().unwrap().get(&at.timestamp()).copied())
    }

    async fn recent_trend(&self, _asset: &str, _window: Duration) -> Result<Trend> {
        Ok(self.trend)
    }

    async fn volatility(&self, _asset: &str, _window: Duration) -> Result<f64> {
        Ok(self.volatility)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn temp_store() -> Arc<JsonStore> {
    let mut p = std::env::temp_dir();
    p.push(format!("updown_sim_{}", uuid::Uuid::new_v4()));
    Arc::new(JsonStore::open(p).unwrap())
}

fn btc_market(id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Market {
    Market {
        id: id.to_string(),
        question: "Bitcoin Up or Down — hourly".to_string(),
        asset: "BTC".to_string(),
        yes_price: dec!(0.50),
        no_price: dec!(0.50),
        yes_token: format!("{id}-yes"),
        no_token: format!("{id}-no"),
        start_time: Some(start),
        end_time: Some(end),
        volume_24h: dec!(5000),
    }
}

fn test_config(dir: &str) -> AppConfig {
    let toml_str = format!(
        r#"
        [engine]
        name = "UPDOWN-SIM"
        scan_interval_secs = 3600
        error_backoff_secs = 1
        initial_balance = 10000.0
        settlement_buffer_secs = 300
        entry_margin = 0.05
        min_confidence = 0.60
        arb_threshold = 0.99
        arb_min_profit = 0.01
        arb_fraction = 0.05
        take_profit_half = 0.30
        take_profit_full = 0.60
        stop_loss_pct = 0.50

        [risk]
        emergency_drawdown = 0.30
        daily_pause_drawdown = 0.10
        weekly_reduce_drawdown = 0.20
        base_fraction = 0.05
        max_fraction = 0.15
        max_stake_usd = 500.0
        max_total_exposure = 0.50
        max_asset_exposure = 0.20
        max_open_bets = 5

        [oracle]
        base_url = "http://localhost:9"
        timeout_secs = 1
        signal_window_mins = 30

        [catalog]
        base_url = "http://localhost:9"
        timeout_secs = 1
        min_volume_24h = 0.0
        assets = ["BTC"]

        [advisor]
        enabled = false
        model = "none"
        api_key_env = "NONE"
        max_tokens = 16

        [watcher]
        enabled = false
        ws_url = "ws://localhost:9"
        reconnect_base_ms = 1
        reconnect_cap_ms = 8
        max_reconnect_attempts = 2
        stake_fraction = 0.10
        stake_cap_usd = 1000.0
        history_len = 10
        mapping_refresh_secs = 60

        [storage]
        dir = "{dir}"
    "#
    );
    toml::from_str(&toml_str).unwrap()
}

// ---------------------------------------------------------------------------
// The canonical end-to-end scenario
// ---------------------------------------------------------------------------

/// $10,000 start; YES bet of 100 shares at $0.50 (cost $50) → $9,950;
/// the underlying moves 100 → 110 by market end and the settlement buffer
/// elapses → payout $100 → $10,050; the bet appears once in history as
/// WON with a $50 profit.
#[tokio::test]
async fn end_to_end_won_scenario() {
    let store = temp_store();
    let portfolio = Arc::new(Mutex::new(Portfolio::new(dec!(10000))));
    let executor = Arc::new(OrderExecutor::new(
        Arc::clone(&portfolio),
        Arc::clone(&store) as _,
    ));
    let bets = Arc::new(Mutex::new(BetStore::load(Arc::clone(&store) as _).unwrap()));

    let start = Utc::now() - Duration::hours(1);
    let end = Utc::now() - Duration::minutes(10);
    let oracle = Arc::new(ScriptedOracle::new(Trend::Neutral, 110.0));
    oracle.set_price_at(start, 100.0);
    oracle.set_price_at(end, 110.0);

    let settlement = SettlementEngine::new(
        Arc::clone(&bets),
        Arc::clone(&executor),
        Arc::clone(&oracle) as Arc<dyn PriceOracle>,
        Duration::minutes(5),
    );

    // Entry: buy 100 YES at $0.50 and record the wager.
    executor
        .place_market_order("mkt-1", Outcome::Yes, OrderSide::Buy, dec!(100), dec!(0.50))
        .unwrap();
    assert_eq!(executor.balance(), dec!(9950));

    let bet = bets
        .lock()
        .unwrap()
        .add_active_bet(BetTicket {
            market_id: "mkt-1".to_string(),
            asset: "BTC".to_string(),
            outcome: Outcome::Yes,
            quantity: dec!(100),
            entry_price: dec!(0.50),
            stop_loss: None,
            market_start: Some(start),
            market_end: Some(end),
            entry_reference_price: Some(100.0),
        })
        .unwrap();

    // Settle: the buffer (5 min past a 10-minute-old end) has elapsed.
    let results = settlement.settle_all_ready().await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].1, SettlementOutcome::Settled(_)));

    assert_eq!(executor.balance(), dec!(10050));

    let store_guard = bets.lock().unwrap();
    assert!(!store_guard.is_active(&bet.id));
    let history = store_guard.history(&HistoryFilter::default());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, BetStatus::Won);
    assert_eq!(history[0].payout, Some(dec!(100)));
    assert_eq!(history[0].realized_pnl(), Some(dec!(50)));
}

// ---------------------------------------------------------------------------
// Engine-level cycle: entry scanning through settlement
// ---------------------------------------------------------------------------

/// One scanning cycle against a bullish oracle enters a YES value bet;
/// the settlement sweep in the same cycle resolves it as WON.
#[tokio::test]
async fn engine_cycle_enters_and_settles() {
    let mut p = std::env::temp_dir();
    p.push(format!("updown_sim_engine_{}", uuid::Uuid::new_v4()));
    let dir = p.to_string_lossy().to_string();
    let store = Arc::new(JsonStore::open(&p).unwrap());

    let start = Utc::now() - Duration::hours(1);
    let end = Utc::now() - Duration::minutes(10);
    let catalog = Arc::new(FakeCatalog::new(vec![btc_market("mkt-1", start, end)]));
    let oracle = Arc::new(ScriptedOracle::new(Trend::Bullish, 110.0));
    oracle.set_price_at(start, 100.0);
    oracle.set_price_at(end, 110.0);

    let engine = Engine::new(
        test_config(&dir),
        store,
        catalog,
        Arc::clone(&oracle) as Arc<dyn PriceOracle>,
        None,
        Arc::new(TrendScorer::default()),
    )
    .unwrap();

    // Run one cycle: the interval's first tick fires immediately.
    let handle = engine.start_monitor();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    engine.stop();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("monitor did not stop")
        .unwrap();

    // Bullish trend → YES entry at $0.50, sized by risk policy
    // (conf 0.68 → $500 stake cap → 1000 shares), then settled WON.
    let history = engine.get_bet_history(&HistoryFilter::default());
    assert_eq!(history.len(), 1, "one bet entered and settled");
    assert_eq!(history[0].outcome, Outcome::Yes);
    assert_eq!(history[0].status, BetStatus::Won);
    assert!(engine.get_active_bets().is_empty());

    // Entry cost came out, settlement paid quantity × $1.
    let summary = engine.get_portfolio_summary();
    let profit = history[0].realized_pnl().unwrap();
    assert!(profit > Decimal::ZERO);
    assert_eq!(summary.balance, dec!(10000) + profit);
}

// ---------------------------------------------------------------------------
// Emergency drawdown
// ---------------------------------------------------------------------------

/// At ≥ 30% drawdown from peak the gate reports emergency, entries are
/// blocked, and liquidation closes every open bet.
#[tokio::test]
async fn emergency_drawdown_blocks_and_liquidates() {
    let store = temp_store();
    let portfolio = Arc::new(Mutex::new(Portfolio::new(dec!(10000))));
    let executor = Arc::new(OrderExecutor::new(
        Arc::clone(&portfolio),
        Arc::clone(&store) as _,
    ));
    let bets = Arc::new(Mutex::new(BetStore::load(Arc::clone(&store) as _).unwrap()));
    let oracle = Arc::new(ScriptedOracle::new(Trend::Neutral, 100.0));
    let settlement = SettlementEngine::new(
        Arc::clone(&bets),
        Arc::clone(&executor),
        oracle as Arc<dyn PriceOracle>,
        Duration::minutes(5),
    );

    // Two open bets.
    for (market, outcome) in [("m1", Outcome::Yes), ("m2", Outcome::No)] {
        executor
            .place_market_order(market, outcome, OrderSide::Buy, dec!(100), dec!(0.50))
            .unwrap();
        bets.lock()
            .unwrap()
            .add_active_bet(BetTicket {
                market_id: market.to_string(),
                asset: "BTC".to_string(),
                outcome,
                quantity: dec!(100),
                entry_price: dec!(0.50),
                stop_loss: None,
                market_start: None,
                market_end: Some(Utc::now() + Duration::hours(1)),
                entry_reference_price: None,
            })
            .unwrap();
    }

    // Simulate heavy losses: balance collapses far below the peak.
    portfolio.lock().unwrap().apply(dec!(-3500));

    let cfg: AppConfig = test_config(&temp_store_dir());
    let mut risk = RiskManager::new(cfg.risk, dec!(10000), Utc::now());
    let balance = executor.balance();
    assert!(matches!(risk.gate(balance), EntryGate::Emergency));

    // Liquidation closes everything at the best available marks.
    let mut marks = HashMap::new();
    marks.insert(
        "m1".to_string(),
        Quote {
            yes_price: dec!(0.20),
            no_price: dec!(0.80),
        },
    );
    let exited = settlement.liquidate_all(&marks);
    assert_eq!(exited.len(), 2);
    assert!(exited.iter().all(|b| b.status == BetStatus::Exited));
    assert_eq!(bets.lock().unwrap().active_count(), 0);

    // The latch holds even after liquidation proceeds come back.
    assert!(matches!(risk.gate(executor.balance()), EntryGate::Emergency));
}

fn temp_store_dir() -> String {
    let mut p = std::env::temp_dir();
    p.push(format!("updown_sim_cfg_{}", uuid::Uuid::new_v4()));
    p.to_string_lossy().to_string()
}
