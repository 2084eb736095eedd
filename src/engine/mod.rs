//! Core engine — component wiring and lifecycle.
//!
//! `Engine` is the explicit context object built once at startup: it owns
//! the shared handles (portfolio, executor, bet store, settlement, risk,
//! live price cache) and hands them to the two loops. No global
//! singletons; tests build a fresh engine with fake collaborators.
//!
//! The surface exposed to surrounding tooling (CLI, dashboards) lives
//! here: `start_*`/`stop`, `get_active_bets`, `get_bet_history`,
//! `get_portfolio_summary`, `settle_now`.

pub mod monitor;
pub mod watcher;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::advisor::Advisor;
use crate::bets::settlement::{SettlementEngine, SettlementOutcome};
use crate::bets::BetStore;
use crate::catalog::MarketCatalog;
use crate::config::AppConfig;
use crate::ledger::executor::OrderExecutor;
use crate::ledger::Portfolio;
use crate::oracle::PriceOracle;
use crate::storage::{DurableStore, HistoryFilter};
use crate::strategy::risk::RiskManager;
use crate::strategy::Scorer;
use crate::types::{Bet, PortfolioSummary};
use monitor::{Monitor, SharedPrices};
use watcher::{Watcher, WatcherStatus};

pub struct Engine {
    cfg: AppConfig,
    catalog: Arc<dyn MarketCatalog>,
    oracle: Arc<dyn PriceOracle>,
    advisor: Option<Arc<dyn Advisor>>,
    scorer: Arc<dyn Scorer>,
    executor: Arc<OrderExecutor>,
    bets: Arc<Mutex<BetStore>>,
    settlement: Arc<SettlementEngine>,
    risk: Arc<Mutex<RiskManager>>,
    prices: SharedPrices,
    watcher_status: Arc<Mutex<WatcherStatus>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    /// Wire up every component. Restores the portfolio and bet state from
    /// the durable store, or starts fresh with the configured balance.
    pub fn new(
        cfg: AppConfig,
        store: Arc<dyn DurableStore>,
        catalog: Arc<dyn MarketCatalog>,
        oracle: Arc<dyn PriceOracle>,
        advisor: Option<Arc<dyn Advisor>>,
        scorer: Arc<dyn Scorer>,
    ) -> Result<Self> {
        let portfolio = match store.load_portfolio().context("Portfolio restore failed")? {
            Some(p) => {
                info!(balance = %p.balance, "Resumed portfolio from disk");
                p
            }
            None => {
                info!(balance = %cfg.engine.initial_balance, "Fresh portfolio");
                Portfolio::new(cfg.engine.initial_balance)
            }
        };
        let balance = portfolio.balance;
        let portfolio = Arc::new(Mutex::new(portfolio));

        let executor = Arc::new(OrderExecutor::new(
            Arc::clone(&portfolio),
            Arc::clone(&store),
        ));
        let bets = Arc::new(Mutex::new(
            BetStore::load(Arc::clone(&store)).context("Bet store restore failed")?,
        ));
        let settlement = Arc::new(SettlementEngine::new(
            Arc::clone(&bets),
            Arc::clone(&executor),
            Arc::clone(&oracle),
            chrono::Duration::seconds(cfg.engine.settlement_buffer_secs as i64),
        ));
        let risk = Arc::new(Mutex::new(RiskManager::new(
            cfg.risk.clone(),
            balance,
            chrono::Utc::now(),
        )));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            cfg,
            catalog,
            oracle,
            advisor,
            scorer,
            executor,
            bets,
            settlement,
            risk,
            prices: Arc::new(Mutex::new(HashMap::new())),
            watcher_status: Arc::new(Mutex::new(WatcherStatus::Idle)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    // -- Loop lifecycle ----------------------------------------------------

    /// Spawn the periodic scanning loop.
    pub fn start_monitor(&self) -> JoinHandle<()> {
        let monitor = Monitor::new(
            self.cfg.engine.clone(),
            self.cfg.catalog.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.oracle),
            self.advisor.clone(),
            Arc::clone(&self.scorer),
            Arc::clone(&self.executor),
            Arc::clone(&self.settlement),
            Arc::clone(&self.bets),
            Arc::clone(&self.risk),
            Arc::clone(&self.prices),
            chrono::Duration::minutes(self.cfg.oracle.signal_window_mins),
            self.shutdown_rx.clone(),
        );
        tokio::spawn(monitor.run())
    }

    /// Spawn the real-time watcher, if enabled.
    pub fn start_watcher(&mut self) -> Option<JoinHandle<()>> {
        if !self.cfg.watcher.enabled {
            info!("Watcher disabled in config");
            return None;
        }
        let watcher = Watcher::new(
            self.cfg.watcher.clone(),
            self.cfg.engine.arb_threshold,
            self.cfg.engine.arb_min_profit,
            Arc::clone(&self.catalog),
            Arc::clone(&self.executor),
            Arc::clone(&self.bets),
            Arc::clone(&self.prices),
            self.shutdown_rx.clone(),
        );
        self.watcher_status = watcher.status_handle();
        Some(tokio::spawn(watcher.run()))
    }

    /// Signal both loops to stop. Prompt: bounded by one in-flight
    /// cycle/message per loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // -- Tooling surface ---------------------------------------------------

    pub fn get_active_bets(&self) -> Vec<Bet> {
        self.bets
            .lock()
            .expect("bet store lock poisoned")
            .active_bets()
    }

    pub fn get_bet_history(&self, filter: &HistoryFilter) -> Vec<Bet> {
        self.bets
            .lock()
            .expect("bet store lock poisoned")
            .history(filter)
    }

    pub fn get_portfolio_summary(&self) -> PortfolioSummary {
        let marks = self
            .prices
            .lock()
            .expect("price cache lock poisoned")
            .clone();
        let open_bets = self
            .bets
            .lock()
            .expect("bet store lock poisoned")
            .active_count();
        let pf = self.executor.portfolio();
        let pf = pf.lock().expect("portfolio lock poisoned");
        PortfolioSummary {
            balance: pf.balance,
            peak_balance: pf.peak_balance,
            total_value: pf.total_value(&marks),
            unrealized_pnl: pf.unrealized_pnl(&marks),
            open_positions: pf.positions.len(),
            open_bets,
            trades_recorded: pf.trades.len(),
        }
    }

    /// On-demand settlement sweep (the buffer still applies per bet).
    pub async fn settle_now(&self) -> Vec<(String, SettlementOutcome)> {
        self.settlement.settle_all_ready().await
    }

    /// Manually clear the emergency circuit breaker.
    pub fn clear_emergency(&self) {
        self.risk
            .lock()
            .expect("risk lock poisoned")
            .clear_emergency();
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        *self.watcher_status.lock().expect("status lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
