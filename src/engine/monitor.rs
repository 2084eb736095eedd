//! Scanning loop — the periodic control loop.
//!
//! Once per cycle (default 900 s), in order: summarise active bets, run
//! risk-gated entry scanning (value bets + instantaneous arbitrage),
//! settle every ready bet, manage open positions (take-profit tiers,
//! stop-loss, optional advisory flip), and refresh valuations.
//!
//! Any single sub-step failure is logged and the loop continues; only a
//! shutdown signal stops it. Network calls always complete before any
//! lock is taken, and no lock is held across an `.await`.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::advisor::{Advisor, MarketContext};
use crate::bets::settlement::{SettlementEngine, SettlementOutcome};
use crate::bets::{BetStore, BetTicket};
use crate::catalog::{MarketCatalog, MarketFilter};
use crate::config::{CatalogConfig, EngineConfig};
use crate::ledger::executor::OrderExecutor;
use crate::oracle::PriceOracle;
use crate::strategy::risk::{EntryGate, RiskManager};
use crate::strategy::{arbitrage_quantity, is_arbitrage, EntryDecision, EntryPolicy, Scorer};
use crate::types::{Advice, AdviceDecision, Bet, Market, OrderSide, Outcome, Quote, Trend};

/// Live quotes shared between the watcher (writer) and the scanning loop
/// (reader), keyed by market id. Held only for the copy in/out.
pub type SharedPrices = Arc<Mutex<HashMap<String, Quote>>>;

pub struct Monitor {
    cfg: EngineConfig,
    catalog_cfg: CatalogConfig,
    catalog: Arc<dyn MarketCatalog>,
    oracle: Arc<dyn PriceOracle>,
    advisor: Option<Arc<dyn Advisor>>,
    scorer: Arc<dyn Scorer>,
    policy: EntryPolicy,
    executor: Arc<OrderExecutor>,
    settlement: Arc<SettlementEngine>,
    bets: Arc<Mutex<BetStore>>,
    risk: Arc<Mutex<RiskManager>>,
    prices: SharedPrices,
    signal_window: chrono::Duration,
    shutdown: watch::Receiver<bool>,
    cycle_count: u64,
}

/// Per-asset signals fetched once per cycle.
#[derive(Debug, Clone, Copy)]
struct AssetSignals {
    trend: Trend,
    volatility_pct: f64,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        catalog_cfg: CatalogConfig,
        catalog: Arc<dyn MarketCatalog>,
        oracle: Arc<dyn PriceOracle>,
        advisor: Option<Arc<dyn Advisor>>,
        scorer: Arc<dyn Scorer>,
        executor: Arc<OrderExecutor>,
        settlement: Arc<SettlementEngine>,
        bets: Arc<Mutex<BetStore>>,
        risk: Arc<Mutex<RiskManager>>,
        prices: SharedPrices,
        signal_window: chrono::Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let policy = EntryPolicy::new(cfg.entry_margin, cfg.min_confidence);
        Self {
            cfg,
            catalog_cfg,
            catalog,
            oracle,
            advisor,
            scorer,
            policy,
            executor,
            settlement,
            bets,
            risk,
            prices,
            signal_window,
            shutdown,
            cycle_count: 0,
        }
    }

    /// Blocking loop body: runs until the shutdown signal flips.
    pub async fn run(mut self) {
        let period = std::time::Duration::from_secs(self.cfg.scan_interval_secs);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        info!(
            interval_secs = self.cfg.scan_interval_secs,
            "Scanning loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.cycle().await {
                        error!(error = %e, "Cycle failed — continuing to next");
                        tokio::time::sleep(std::time::Duration::from_secs(
                            self.cfg.error_backoff_secs,
                        ))
                        .await;
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the engine is gone: stop too.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scanning loop stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One full scan → enter → settle → manage → value cycle. Sub-steps
    /// are individually fenced so one bad step cannot stop the rest.
    pub async fn cycle(&mut self) -> Result<()> {
        self.cycle_count += 1;
        let cycle = self.cycle_count;

        // 1. Active-bet summary and risk window bookkeeping.
        let balance = self.executor.balance();
        let (active_count, open_cost) = {
            let bets = self.bets.lock().expect("bet store lock poisoned");
            (bets.active_count(), bets.open_cost(None))
        };
        {
            let mut risk = self.risk.lock().expect("risk lock poisoned");
            risk.observe(balance, Utc::now());
        }
        info!(
            cycle,
            balance = format!("${balance:.2}"),
            active_bets = active_count,
            open_cost = format!("${open_cost:.2}"),
            "Cycle started"
        );

        // 2. Risk gate, then entries.
        let gate = {
            let mut risk = self.risk.lock().expect("risk lock poisoned");
            risk.gate(balance)
        };
        match gate {
            EntryGate::Emergency => {
                warn!("Emergency drawdown — liquidating all open bets");
                let marks = self.marks_snapshot();
                let exited = self.settlement.liquidate_all(&marks);
                warn!(liquidated = exited.len(), "Emergency liquidation complete");
            }
            EntryGate::Paused { reason } => {
                info!(reason = %reason, "New entries paused; monitoring continues");
            }
            EntryGate::Allowed { size_scale } => {
                if let Err(e) = self.scan_and_enter(size_scale).await {
                    error!(error = %e, "Entry scan failed this cycle");
                }
            }
        }

        // 3. Settlement sweep.
        let results = self.settlement.settle_all_ready().await;
        let settled = results
            .iter()
            .filter(|(_, o)| matches!(o, SettlementOutcome::Settled(_)))
            .count();
        if !results.is_empty() {
            info!(attempted = results.len(), settled, "Settlement sweep done");
        }

        // 4. Open-position management.
        if let Err(e) = self.manage_positions().await {
            error!(error = %e, "Position management failed this cycle");
        }

        // 5. Valuation refresh.
        self.refresh_valuations();

        Ok(())
    }

    // -- Entry scanning ----------------------------------------------------

    async fn scan_and_enter(&self, size_scale: f64) -> Result<()> {
        let filter = MarketFilter {
            asset: None,
            min_volume_24h: Some(self.catalog_cfg.min_volume_24h),
        };
        let markets: Vec<Market> = self
            .catalog
            .list_markets(&filter)
            .await?
            .into_iter()
            .filter(|m| self.catalog_cfg.assets.iter().any(|a| a == &m.asset))
            .collect();

        debug!(count = markets.len(), "Markets eligible for entry scan");

        // Trend/volatility are per-asset; fetch each once per cycle.
        let mut signals: HashMap<String, AssetSignals> = HashMap::new();

        for market in markets {
            // Freshen the shared cache with every scanned quote.
            {
                let mut prices = self.prices.lock().expect("price cache lock poisoned");
                prices.insert(market.id.clone(), market.quote());
            }

            // One live entry per market side is enough.
            let already_entered = {
                let bets = self.bets.lock().expect("bet store lock poisoned");
                bets.has_active_on(&market.id, Outcome::Yes)
                    || bets.has_active_on(&market.id, Outcome::No)
            };
            if already_entered {
                continue;
            }

            // Risk-free first: both sides underpriced.
            let quote = market.quote();
            if is_arbitrage(&quote, self.cfg.arb_threshold, self.cfg.arb_min_profit) {
                if let Err(e) = self.enter_arbitrage(&market, &quote).await {
                    warn!(market_id = %market.id, error = %e, "Arbitrage entry failed");
                }
                continue;
            }

            let sig = match self.asset_signals(&mut signals, &market.asset).await {
                Some(s) => s,
                None => continue, // oracle data absent: defer, never guess
            };

            let Some(score) = self.scorer.score(&market, sig.trend, sig.volatility_pct) else {
                continue;
            };

            let advice = self.consult_advisor(&market, sig).await;

            match self.policy.decide(&market, &score, advice.as_ref()) {
                EntryDecision::Enter {
                    outcome,
                    confidence,
                    stake_factor,
                } => {
                    if let Err(e) = self
                        .enter_bet(
                            &market,
                            outcome,
                            confidence,
                            sig.volatility_pct,
                            stake_factor * size_scale,
                        )
                        .await
                    {
                        warn!(market_id = %market.id, error = %e, "Entry rejected");
                    }
                }
                EntryDecision::Skip { reason } => {
                    debug!(market_id = %market.id, reason, "Market skipped");
                }
            }
        }

        Ok(())
    }

    /// Fetch (and memoise for the cycle) trend + volatility for an asset.
    /// Oracle failures yield `None`: the markets on that asset are skipped
    /// this cycle rather than guessed at.
    async fn asset_signals(
        &self,
        cache: &mut HashMap<String, AssetSignals>,
        asset: &str,
    ) -> Option<AssetSignals> {
        if let Some(sig) = cache.get(asset) {
            return Some(*sig);
        }
        let window = self.signal_window;
        let trend = match self.oracle.recent_trend(asset, window).await {
            Ok(t) => t,
            Err(e) => {
                warn!(asset, error = %e, "Trend unavailable; skipping asset this cycle");
                return None;
            }
        };
        let volatility_pct = match self.oracle.volatility(asset, window).await {
            Ok(v) => v,
            Err(e) => {
                warn!(asset, error = %e, "Volatility unavailable; skipping asset this cycle");
                return None;
            }
        };
        let sig = AssetSignals {
            trend,
            volatility_pct,
        };
        cache.insert(asset.to_string(), sig);
        Some(sig)
    }

    /// Ask the advisor, degrading to no advice on any failure.
    async fn consult_advisor(&self, market: &Market, sig: AssetSignals) -> Option<Advice> {
        let advisor = self.advisor.as_ref()?;
        let ctx = MarketContext {
            market: market.clone(),
            trend: sig.trend,
            volatility_pct: sig.volatility_pct,
        };
        match advisor.evaluate(&ctx).await {
            Ok(advice) => Some(advice),
            Err(e) => {
                warn!(market_id = %market.id, error = %e, "Advisor unavailable; continuing without");
                None
            }
        }
    }

    /// Place a value bet: exposure checks → sizing → buy fill → record.
    async fn enter_bet(
        &self,
        market: &Market,
        outcome: Outcome,
        confidence: f64,
        volatility_pct: f64,
        stake_multiplier: f64,
    ) -> Result<()> {
        let price = market.quote().price_for(outcome);
        if price <= Decimal::ZERO {
            anyhow::bail!("no usable price for {outcome}");
        }

        // Reference price fetched before any lock is taken.
        let reference = self
            .oracle
            .current_price(&market.asset)
            .await
            .unwrap_or_default();

        let balance = self.executor.balance();
        let (total_cost, asset_cost, open_count) = {
            let bets = self.bets.lock().expect("bet store lock poisoned");
            (
                bets.open_cost(None),
                bets.open_cost(Some(&market.asset)),
                bets.active_count(),
            )
        };

        let stake = {
            let risk = self.risk.lock().expect("risk lock poisoned");
            risk.check_exposure(balance, total_cost, asset_cost, open_count)?;
            risk.stake(balance, volatility_pct, confidence, stake_multiplier)
        };

        let quantity = (stake / price).round_dp_with_strategy(2, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            anyhow::bail!("stake ${stake:.2} too small at {price:.2}");
        }

        self.executor
            .place_market_order(&market.id, outcome, OrderSide::Buy, quantity, price)?;

        let stop_loss = price * (Decimal::ONE - self.cfg.stop_loss_pct);
        let bet = {
            let mut bets = self.bets.lock().expect("bet store lock poisoned");
            bets.add_active_bet(BetTicket {
                market_id: market.id.clone(),
                asset: market.asset.clone(),
                outcome,
                quantity,
                entry_price: price,
                stop_loss: Some(stop_loss),
                market_start: market.start_time,
                market_end: market.end_time,
                entry_reference_price: reference,
            })?
        };

        info!(
            bet_id = %bet.id,
            market_id = %market.id,
            %outcome,
            %quantity,
            %price,
            confidence = format!("{:.0}%", confidence * 100.0),
            "Value bet entered"
        );
        Ok(())
    }

    /// Buy both sides of an underpriced pair; the settlement payout of
    /// `quantity × $1` exceeds the combined cost whichever side wins.
    async fn enter_arbitrage(&self, market: &Market, quote: &Quote) -> Result<()> {
        let balance = self.executor.balance();
        let stake_cap = balance * self.cfg.arb_fraction;
        let quantity = arbitrage_quantity(balance, self.cfg.arb_fraction, stake_cap, quote);
        if quantity <= Decimal::ZERO {
            anyhow::bail!("arbitrage stake too small");
        }

        let reference = self
            .oracle
            .current_price(&market.asset)
            .await
            .unwrap_or_default();

        for outcome in [Outcome::Yes, Outcome::No] {
            let price = quote.price_for(outcome);
            self.executor
                .place_market_order(&market.id, outcome, OrderSide::Buy, quantity, price)?;
            let mut bets = self.bets.lock().expect("bet store lock poisoned");
            bets.add_active_bet(BetTicket {
                market_id: market.id.clone(),
                asset: market.asset.clone(),
                outcome,
                quantity,
                entry_price: price,
                stop_loss: None, // risk-free by construction; held to settlement
                market_start: market.start_time,
                market_end: market.end_time,
                entry_reference_price: reference,
            })?;
        }

        info!(
            market_id = %market.id,
            %quantity,
            combined = %quote.combined(),
            "Arbitrage pair entered"
        );
        Ok(())
    }

    // -- Position management ----------------------------------------------

    async fn manage_positions(&self) -> Result<()> {
        let active = {
            let bets = self.bets.lock().expect("bet store lock poisoned");
            bets.active_bets()
        };

        for bet in active {
            // A concluded market is settlement's problem; just clear any
            // leftover pending orders.
            if bet.market_end.is_some_and(|end| end <= Utc::now()) {
                self.executor.expire_orders(&bet.market_id);
                continue;
            }

            // Live quote: prefer the watcher's cache, fall back to the
            // catalog (network, no locks held).
            let cached = {
                let prices = self.prices.lock().expect("price cache lock poisoned");
                prices.get(&bet.market_id).copied()
            };
            let quote = match cached {
                Some(q) => q,
                None => match self.catalog.prices_for(&bet.market_id).await {
                    Ok(Some(q)) => {
                        let mut prices = self.prices.lock().expect("price cache lock poisoned");
                        prices.insert(bet.market_id.clone(), q);
                        q
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(market_id = %bet.market_id, error = %e, "Quote unavailable");
                        continue;
                    }
                },
            };

            // Drive pending orders off the fresh quote.
            self.executor.process_market_update(&bet.market_id, &quote);

            // The order-driven exits may have closed the bet's position
            // already; re-read before acting.
            let still_active = {
                let bets = self.bets.lock().expect("bet store lock poisoned");
                bets.is_active(&bet.id)
            };
            if !still_active {
                continue;
            }

            let price = quote.price_for(bet.outcome);
            if price <= Decimal::ZERO {
                continue;
            }

            // Arbitrage legs (no stop-loss) are held to settlement by
            // construction: selling the winning leg early while the
            // losing leg settles at $0 would turn the locked-in profit
            // into a loss. Only value bets get the managed exits below.
            let is_value_bet = bet.stop_loss.is_some();

            // Stop-loss.
            if bet.stop_loss.is_some_and(|stop| price <= stop) {
                if let Err(e) = self.settlement.exit_bet(&bet.id, price, "stop loss") {
                    error!(bet_id = %bet.id, error = %e, "Stop-loss exit failed");
                }
                continue;
            }

            // Take-profit tiers: half off at the first tier, all off at
            // the second. A prior partial exit is visible as accumulated
            // proceeds on the record.
            let gain = (price - bet.entry_price) / bet.entry_price;
            if is_value_bet && gain >= self.cfg.take_profit_full {
                if let Err(e) = self.settlement.exit_bet(&bet.id, price, "take profit (full)") {
                    error!(bet_id = %bet.id, error = %e, "Take-profit exit failed");
                }
                continue;
            }
            if is_value_bet && gain >= self.cfg.take_profit_half && bet.payout.is_none() {
                let half = (bet.quantity / Decimal::TWO)
                    .round_dp_with_strategy(2, RoundingStrategy::ToZero);
                if half > Decimal::ZERO {
                    if let Err(e) = self.settlement.exit_partial(&bet.id, half, price) {
                        error!(bet_id = %bet.id, error = %e, "Partial take-profit failed");
                    }
                }
                continue;
            }

            // Advisory re-evaluation: a confident opposite call flips the
            // held side.
            if is_value_bet && self.advisory_says_flip(&bet, &quote).await {
                self.flip_bet(&bet.id, &quote).await;
            }
        }

        Ok(())
    }

    /// Whether the advisor confidently backs the opposite side of a bet.
    async fn advisory_says_flip(&self, bet: &Bet, quote: &Quote) -> bool {
        let Some(advisor) = self.advisor.as_ref() else {
            return false;
        };

        // Re-evaluate against a synthetic market context from the quote.
        let market = Market {
            id: bet.market_id.clone(),
            question: format!("{} Up or Down", bet.asset),
            asset: bet.asset.clone(),
            yes_price: quote.yes_price,
            no_price: quote.no_price,
            yes_token: String::new(),
            no_token: String::new(),
            start_time: bet.market_start,
            end_time: bet.market_end,
            volume_24h: Decimal::ZERO,
        };

        let window = self.signal_window;
        let (Ok(trend), Ok(volatility_pct)) = (
            self.oracle.recent_trend(&bet.asset, window).await,
            self.oracle.volatility(&bet.asset, window).await,
        ) else {
            return false;
        };

        let advice = match advisor
            .evaluate(&MarketContext {
                market,
                trend,
                volatility_pct,
            })
            .await
        {
            Ok(a) if a.is_valid() => a,
            _ => return false,
        };

        let opposite = match advice.decision {
            AdviceDecision::Yes => bet.outcome == Outcome::No,
            AdviceDecision::No => bet.outcome == Outcome::Yes,
            AdviceDecision::Skip => false,
        };
        opposite && advice.confidence >= self.cfg.min_confidence
    }

    /// Exit the held side and re-enter the opposite with the proceeds.
    async fn flip_bet(&self, bet_id: &str, quote: &Quote) {
        let bet = {
            let bets = self.bets.lock().expect("bet store lock poisoned");
            match bets.get_active(bet_id) {
                Some(b) => b.clone(),
                None => return,
            }
        };

        let exit_price = quote.price_for(bet.outcome);
        let exited = match self.settlement.exit_bet(bet_id, exit_price, "advisory flip") {
            Ok(b) => b,
            Err(e) => {
                error!(bet_id, error = %e, "Flip exit failed");
                return;
            }
        };

        let opposite = bet.outcome.opposite();
        let entry_price = quote.price_for(opposite);
        if entry_price <= Decimal::ZERO {
            return;
        }
        let proceeds = exited.payout.unwrap_or(Decimal::ZERO);
        let quantity =
            (proceeds / entry_price).round_dp_with_strategy(2, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            return;
        }

        if let Err(e) = self.executor.place_market_order(
            &bet.market_id,
            opposite,
            OrderSide::Buy,
            quantity,
            entry_price,
        ) {
            error!(bet_id, error = %e, "Flip re-entry failed");
            return;
        }

        let result = {
            let mut bets = self.bets.lock().expect("bet store lock poisoned");
            bets.add_active_bet(BetTicket {
                market_id: bet.market_id.clone(),
                asset: bet.asset.clone(),
                outcome: opposite,
                quantity,
                entry_price,
                stop_loss: Some(entry_price * (Decimal::ONE - self.cfg.stop_loss_pct)),
                market_start: bet.market_start,
                market_end: bet.market_end,
                entry_reference_price: bet.entry_reference_price,
            })
        };
        match result {
            Ok(new_bet) => info!(
                old_bet = bet_id,
                new_bet = %new_bet.id,
                side = %opposite,
                "Held side flipped on advisory signal"
            ),
            Err(e) => error!(bet_id, error = %e, "Flip record failed"),
        }
    }

    // -- Valuation ---------------------------------------------------------

    fn marks_snapshot(&self) -> HashMap<String, Quote> {
        self.prices
            .lock()
            .expect("price cache lock poisoned")
            .clone()
    }

    fn refresh_valuations(&self) {
        let marks = self.marks_snapshot();
        let portfolio = self.executor.portfolio();
        let pf = portfolio.lock().expect("portfolio lock poisoned");
        info!(
            balance = format!("${:.2}", pf.balance),
            total_value = format!("${:.2}", pf.total_value(&marks)),
            unrealized = format!("${:.2}", pf.unrealized_pnl(&marks)),
            positions = pf.positions.len(),
            "Valuation refreshed"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskSettings;
    use crate::ledger::Portfolio;
    use crate::storage::{HistoryFilter, JsonStore};
    use crate::strategy::TrendScorer;
    use crate::types::BetStatus;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use rust_decimal_macros::dec;

    struct EmptyCatalog;

    #[async_trait]
    impl MarketCatalog for EmptyCatalog {
        async fn list_markets(&self, _f: &MarketFilter) -> Result<Vec<Market>> {
            Ok(Vec::new())
        }
        async fn prices_for(&self, _id: &str) -> Result<Option<Quote>> {
            Ok(None)
        }
    }

    struct SilentOracle;

    #[async_trait]
    impl PriceOracle for SilentOracle {
        async fn current_price(&self, _a: &str) -> Result<Option<f64>> {
            Ok(None)
        }
        async fn price_at_time(&self, _a: &str, _t: DateTime<Utc>) -> Result<Option<f64>> {
            Ok(None)
        }
        async fn recent_trend(&self, _a: &str, _w: Duration) -> Result<Trend> {
            Ok(Trend::Neutral)
        }
        async fn volatility(&self, _a: &str, _w: Duration) -> Result<f64> {
            Ok(0.0)
        }
    }

    fn engine_cfg() -> EngineConfig {
        EngineConfig {
            name: "UPDOWN-TEST".to_string(),
            scan_interval_secs: 900,
            error_backoff_secs: 1,
            initial_balance: dec!(10000),
            settlement_buffer_secs: 300,
            entry_margin: 0.05,
            min_confidence: 0.60,
            arb_threshold: dec!(0.99),
            arb_min_profit: dec!(0.01),
            arb_fraction: dec!(0.05),
            take_profit_half: dec!(0.30),
            take_profit_full: dec!(0.60),
            stop_loss_pct: dec!(0.50),
        }
    }

    fn catalog_cfg() -> CatalogConfig {
        CatalogConfig {
            base_url: "http://localhost:9".to_string(),
            timeout_secs: 1,
            min_volume_24h: dec!(0),
            assets: vec!["BTC".to_string()],
        }
    }

    fn risk_settings() -> RiskSettings {
        RiskSettings {
            emergency_drawdown: 0.30,
            daily_pause_drawdown: 0.10,
            weekly_reduce_drawdown: 0.20,
            base_fraction: 0.05,
            max_fraction: 0.15,
            max_stake_usd: dec!(500),
            max_total_exposure: 0.50,
            max_asset_exposure: 0.20,
            max_open_bets: 5,
        }
    }

    fn make_monitor(balance: Decimal) -> Monitor {
        let mut p = std::env::temp_dir();
        p.push(format!("updown_test_monitor_{}", uuid::Uuid::new_v4()));
        let durable = Arc::new(JsonStore::open(p).unwrap());

        let portfolio = Arc::new(Mutex::new(Portfolio::new(balance)));
        let executor = Arc::new(OrderExecutor::new(portfolio, Arc::clone(&durable) as _));
        let bets = Arc::new(Mutex::new(BetStore::load(durable as _).unwrap()));
        let oracle: Arc<dyn PriceOracle> = Arc::new(SilentOracle);
        let settlement = Arc::new(SettlementEngine::new(
            Arc::clone(&bets),
            Arc::clone(&executor),
            Arc::clone(&oracle),
            Duration::minutes(5),
        ));
        let risk = Arc::new(Mutex::new(RiskManager::new(
            risk_settings(),
            balance,
            Utc::now(),
        )));
        // The sender may drop: these tests drive steps directly and never
        // wait on the shutdown channel.
        let (_tx, rx) = watch::channel(false);

        Monitor::new(
            engine_cfg(),
            catalog_cfg(),
            Arc::new(EmptyCatalog),
            oracle,
            None,
            Arc::new(TrendScorer::default()),
            executor,
            settlement,
            bets,
            risk,
            Arc::new(Mutex::new(HashMap::new())),
            Duration::minutes(30),
            rx,
        )
    }

    /// Buy the shares and record the bet, as the entry paths do.
    fn seed_bet(
        monitor: &Monitor,
        market: &str,
        outcome: Outcome,
        qty: Decimal,
        price: Decimal,
        stop_loss: Option<Decimal>,
    ) -> Bet {
        monitor
            .executor
            .place_market_order(market, outcome, OrderSide::Buy, qty, price)
            .unwrap();
        monitor
            .bets
            .lock()
            .unwrap()
            .add_active_bet(BetTicket {
                market_id: market.to_string(),
                asset: "BTC".to_string(),
                outcome,
                quantity: qty,
                entry_price: price,
                stop_loss,
                market_start: Some(Utc::now() - Duration::minutes(10)),
                market_end: Some(Utc::now() + Duration::minutes(50)),
                entry_reference_price: None,
            })
            .unwrap()
    }

    fn seed_quote(monitor: &Monitor, market: &str, yes: Decimal, no: Decimal) {
        monitor.prices.lock().unwrap().insert(
            market.to_string(),
            Quote {
                yes_price: yes,
                no_price: no,
            },
        );
    }

    /// An arbitrage pair's winning leg races toward $1.00, clearing every
    /// take-profit tier — but the pair is held to settlement: selling the
    /// winner early while the loser settles at $0 would lose money.
    #[tokio::test]
    async fn test_arb_legs_never_take_profit() {
        let monitor = make_monitor(dec!(10000));
        let yes = seed_bet(&monitor, "m1", Outcome::Yes, dec!(100), dec!(0.49), None);
        let no = seed_bet(&monitor, "m1", Outcome::No, dec!(100), dec!(0.49), None);
        let balance_after_entry = monitor.executor.balance();

        // The market has all but resolved: YES mid at 0.95 is a 94% gain.
        seed_quote(&monitor, "m1", dec!(0.95), dec!(0.05));
        monitor.manage_positions().await.unwrap();

        let bets = monitor.bets.lock().unwrap();
        assert!(bets.is_active(&yes.id), "winning arb leg must be held");
        assert!(bets.is_active(&no.id), "losing arb leg must be held");
        drop(bets);
        assert_eq!(monitor.executor.balance(), balance_after_entry);
    }

    /// Value bets (which carry a stop-loss) still take profit normally.
    #[tokio::test]
    async fn test_value_bet_take_profit_full_exits() {
        let monitor = make_monitor(dec!(10000));
        let bet = seed_bet(
            &monitor,
            "m1",
            Outcome::Yes,
            dec!(100),
            dec!(0.50),
            Some(dec!(0.25)),
        );

        // 70% gain clears the full take-profit tier.
        seed_quote(&monitor, "m1", dec!(0.85), dec!(0.15));
        monitor.manage_positions().await.unwrap();

        let bets = monitor.bets.lock().unwrap();
        assert!(!bets.is_active(&bet.id));
        let history = bets.history(&HistoryFilter::default());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BetStatus::Exited);
        drop(bets);
        assert_eq!(monitor.executor.balance(), dec!(10000) - dec!(50) + dec!(85));
    }

    /// The first tier sells half and leaves the bet active.
    #[tokio::test]
    async fn test_value_bet_partial_take_profit() {
        let monitor = make_monitor(dec!(10000));
        let bet = seed_bet(
            &monitor,
            "m1",
            Outcome::Yes,
            dec!(100),
            dec!(0.50),
            Some(dec!(0.25)),
        );

        // 40% gain: past the half tier, short of the full tier.
        seed_quote(&monitor, "m1", dec!(0.70), dec!(0.30));
        monitor.manage_positions().await.unwrap();

        let bets = monitor.bets.lock().unwrap();
        let reduced = bets.get_active(&bet.id).unwrap();
        assert_eq!(reduced.quantity, dec!(50));
        assert_eq!(reduced.payout, Some(dec!(35)));
    }
}
