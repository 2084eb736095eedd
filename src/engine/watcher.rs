//! Real-time watcher — the event-driven WebSocket loop.
//!
//! Independent of the scanning loop's schedule: subscribes to live order
//! book updates for every tracked instrument, maintains a guarded price
//! cache and a bounded rolling mid-price history, and fires dual-sided
//! arbitrage entries through the shared order executor the moment
//! YES mid + NO mid drops under the threshold.
//!
//! Connection loss triggers reconnection with exponential backoff (base
//! delay doubling up to a ceiling); after the configured number of
//! consecutive failures the watcher surfaces a terminal `Disconnected`
//! status instead of looping forever. All message handling is
//! synchronous — no lock is ever held across a network call.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bets::{BetStore, BetTicket};
use crate::catalog::{MarketCatalog, MarketFilter};
use crate::config::WatcherConfig;
use crate::engine::monitor::SharedPrices;
use crate::ledger::executor::OrderExecutor;
use crate::strategy::{arbitrage_quantity, is_arbitrage};
use crate::types::{OrderSide, Outcome, Quote};

// ---------------------------------------------------------------------------
// Status & wire types
// ---------------------------------------------------------------------------

/// Lifecycle of the watcher connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Idle,
    Connected,
    Reconnecting,
    /// Terminal: the reconnect budget is exhausted.
    Disconnected,
}

/// Initial order-book snapshot for one instrument.
#[derive(Debug, Deserialize)]
struct BookSnapshot {
    asset_id: String,
    #[serde(default)]
    bids: Vec<OrderLevel>,
    #[serde(default)]
    asks: Vec<OrderLevel>,
}

#[derive(Debug, Deserialize)]
struct OrderLevel {
    #[serde(default)]
    price: String,
    #[serde(default)]
    size: String,
}

/// Incremental top-of-book update.
#[derive(Debug, Deserialize)]
struct UpdateMessage {
    #[serde(default)]
    price_changes: Vec<PriceChange>,
}

#[derive(Debug, Deserialize)]
struct PriceChange {
    asset_id: String,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// What an instrument id resolves to.
#[derive(Debug, Clone)]
struct InstrumentInfo {
    market_id: String,
    asset: String,
    outcome: Outcome,
    market_start: Option<DateTime<Utc>>,
    market_end: Option<DateTime<Utc>>,
}

/// Best bid/ask for one instrument.
#[derive(Debug, Clone, Copy, Default)]
struct BookTop {
    bid: Decimal,
    ask: Decimal,
}

impl BookTop {
    fn mid(&self) -> Option<Decimal> {
        if self.bid > Decimal::ZERO && self.ask > Decimal::ZERO {
            Some((self.bid + self.ask) / Decimal::TWO)
        } else {
            None
        }
    }
}

/// Compute the delay before reconnect attempt `failures` (1-based), or
/// `None` once the attempt budget is spent.
fn reconnect_delay(failures: u32, cfg: &WatcherConfig) -> Option<std::time::Duration> {
    if failures >= cfg.max_reconnect_attempts {
        return None;
    }
    let exp = failures.saturating_sub(1).min(20);
    let ms = cfg
        .reconnect_base_ms
        .saturating_mul(1u64 << exp)
        .min(cfg.reconnect_cap_ms);
    Some(std::time::Duration::from_millis(ms))
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

pub struct Watcher {
    cfg: WatcherConfig,
    arb_threshold: Decimal,
    arb_min_profit: Decimal,
    catalog: Arc<dyn MarketCatalog>,
    executor: Arc<OrderExecutor>,
    bets: Arc<Mutex<BetStore>>,
    /// Market-keyed mid quotes shared with the scanning loop.
    prices: SharedPrices,
    /// Instrument id → resolution info, refreshed periodically.
    mapping: Mutex<HashMap<String, InstrumentInfo>>,
    /// Instrument id → best bid/ask.
    books: Mutex<HashMap<String, BookTop>>,
    /// Bounded rolling mid history per instrument.
    history: Mutex<HashMap<String, VecDeque<(DateTime<Utc>, Decimal)>>>,
    /// Markets already actioned: one arbitrage pair per market.
    actioned: Mutex<HashSet<String>>,
    status: Arc<Mutex<WatcherStatus>>,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: WatcherConfig,
        arb_threshold: Decimal,
        arb_min_profit: Decimal,
        catalog: Arc<dyn MarketCatalog>,
        executor: Arc<OrderExecutor>,
        bets: Arc<Mutex<BetStore>>,
        prices: SharedPrices,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            arb_threshold,
            arb_min_profit,
            catalog,
            executor,
            bets,
            prices,
            mapping: Mutex::new(HashMap::new()),
            books: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            actioned: Mutex::new(HashSet::new()),
            status: Arc::new(Mutex::new(WatcherStatus::Idle)),
            shutdown,
        }
    }

    /// Shared status handle for surrounding tooling.
    pub fn status_handle(&self) -> Arc<Mutex<WatcherStatus>> {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> WatcherStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, status: WatcherStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    fn should_stop(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connection supervisor: refresh the instrument mapping, connect,
    /// run a session, and reconnect with backoff until stopped or the
    /// failure budget runs out.
    pub async fn run(mut self) {
        let mut failures = 0u32;

        loop {
            // Stop on signal, or when the engine (the sender) is gone.
            if self.should_stop() || self.shutdown.has_changed().is_err() {
                break;
            }

            let instruments = match self.refresh_mapping().await {
                Ok(tokens) if !tokens.is_empty() => tokens,
                Ok(_) => {
                    debug!("No instruments to track yet; waiting");
                    tokio::time::sleep(std::time::Duration::from_secs(
                        self.cfg.mapping_refresh_secs,
                    ))
                    .await;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Instrument mapping refresh failed");
                    tokio::time::sleep(std::time::Duration::from_secs(
                        self.cfg.mapping_refresh_secs,
                    ))
                    .await;
                    continue;
                }
            };

            info!(
                url = %self.cfg.ws_url,
                instruments = instruments.len(),
                "Connecting to price feed"
            );

            match connect_async(self.cfg.ws_url.as_str()).await {
                Ok((ws, _)) => {
                    failures = 0;
                    self.set_status(WatcherStatus::Connected);
                    if let Err(e) = self.session(ws, &instruments).await {
                        warn!(error = %e, "Feed session ended");
                    }
                    if self.should_stop() {
                        break;
                    }
                    self.set_status(WatcherStatus::Reconnecting);
                }
                Err(e) => {
                    failures += 1;
                    match reconnect_delay(failures, &self.cfg) {
                        Some(delay) => {
                            warn!(
                                error = %e,
                                attempt = failures,
                                delay_ms = delay.as_millis() as u64,
                                "Feed connection failed; backing off"
                            );
                            self.set_status(WatcherStatus::Reconnecting);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!(
                                attempts = failures,
                                "Reconnect budget exhausted; watcher going dark"
                            );
                            self.set_status(WatcherStatus::Disconnected);
                            return;
                        }
                    }
                }
            }
        }

        info!("Watcher stopped");
    }

    /// One connected session: subscribe, then pump messages until the
    /// stream ends, the mapping turns stale, or shutdown.
    async fn session(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        instruments: &[String],
    ) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "type": "market",
            "assets_ids": instruments,
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("Subscribe failed")?;
        info!(count = instruments.len(), "Subscribed to instruments");

        // Keepalive pings plus periodic mapping refresh.
        let mut ping = tokio::time::interval(std::time::Duration::from_secs(5));
        ping.tick().await; // skip the immediate first tick
        let mut remap = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.mapping_refresh_secs,
        ));
        remap.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means the engine is gone: stop too.
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await.context("Ping failed")?;
                }
                _ = remap.tick() => {
                    // New market windows mean new instruments; drop the
                    // session to resubscribe with the fresh set.
                    let fresh = self.refresh_mapping().await.unwrap_or_default();
                    if fresh.iter().any(|t| !instruments.contains(t)) {
                        info!("Instrument set changed; resubscribing");
                        return Ok(());
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            warn!("Feed closed by server");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            warn!("Feed stream ended");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Rebuild the instrument → market mapping from the catalog and
    /// return the instrument ids to subscribe to. Up/Down windows roll
    /// over hourly, so state keyed by instruments or markets that fell
    /// out of the fresh set is pruned here — otherwise the book, history,
    /// and actioned maps grow without bound over the daemon's lifetime.
    async fn refresh_mapping(&self) -> Result<Vec<String>> {
        let markets = self.catalog.list_markets(&MarketFilter::default()).await?;

        let mut fresh: HashMap<String, InstrumentInfo> = HashMap::new();
        for m in &markets {
            for (token, outcome) in [(&m.yes_token, Outcome::Yes), (&m.no_token, Outcome::No)] {
                fresh.insert(
                    token.clone(),
                    InstrumentInfo {
                        market_id: m.id.clone(),
                        asset: m.asset.clone(),
                        outcome,
                        market_start: m.start_time,
                        market_end: m.end_time,
                    },
                );
            }
        }

        let market_ids: HashSet<&str> = fresh.values().map(|i| i.market_id.as_str()).collect();
        {
            let mut books = self.books.lock().expect("books lock poisoned");
            books.retain(|token, _| fresh.contains_key(token));
        }
        {
            let mut history = self.history.lock().expect("history lock poisoned");
            history.retain(|token, _| fresh.contains_key(token));
        }
        {
            let mut actioned = self.actioned.lock().expect("actioned lock poisoned");
            actioned.retain(|market_id| market_ids.contains(market_id.as_str()));
        }

        let tokens: Vec<String> = fresh.keys().cloned().collect();
        *self.mapping.lock().expect("mapping lock poisoned") = fresh;
        debug!(instruments = tokens.len(), "Instrument mapping refreshed");
        Ok(tokens)
    }

    // -- Message handling (synchronous, lock scope is per-map) -----------

    fn handle_message(&self, text: &str) {
        // Initial snapshots arrive as an array; later updates as an
        // object with price_changes.
        if let Ok(snapshots) = serde_json::from_str::<Vec<BookSnapshot>>(text) {
            for snap in &snapshots {
                self.apply_snapshot(snap);
            }
            return;
        }
        match serde_json::from_str::<UpdateMessage>(text) {
            Ok(update) => {
                for change in &update.price_changes {
                    self.apply_price_change(change);
                }
            }
            Err(e) => debug!(error = %e, "Unrecognised feed message"),
        }
    }

    fn apply_snapshot(&self, snap: &BookSnapshot) {
        let best_ask = snap
            .asks
            .iter()
            .filter_map(parse_level)
            .min_by(|a, b| a.0.cmp(&b.0));
        let best_bid = snap
            .bids
            .iter()
            .filter_map(parse_level)
            .max_by(|a, b| a.0.cmp(&b.0));

        {
            let mut books = self.books.lock().expect("books lock poisoned");
            let top = books.entry(snap.asset_id.clone()).or_default();
            if let Some((price, _)) = best_ask {
                top.ask = price;
            }
            if let Some((price, _)) = best_bid {
                top.bid = price;
            }
        }
        self.after_book_update(&snap.asset_id);
    }

    fn apply_price_change(&self, change: &PriceChange) {
        {
            let mut books = self.books.lock().expect("books lock poisoned");
            let top = books.entry(change.asset_id.clone()).or_default();
            if let Some(ask) = change.best_ask.as_deref().and_then(|s| s.parse().ok()) {
                top.ask = ask;
            }
            if let Some(bid) = change.best_bid.as_deref().and_then(|s| s.parse().ok()) {
                top.bid = bid;
            }
        }
        self.after_book_update(&change.asset_id);
    }

    /// Post-update pipeline for one instrument: history append, shared
    /// cache refresh, pending-order triggers, arbitrage check.
    fn after_book_update(&self, token: &str) {
        let info = {
            let mapping = self.mapping.lock().expect("mapping lock poisoned");
            match mapping.get(token) {
                Some(i) => i.clone(),
                None => return, // an instrument we no longer track
            }
        };

        // Both sides of the market, read in one lock scope.
        let (yes_top, no_top) = {
            let mapping = self.mapping.lock().expect("mapping lock poisoned");
            let books = self.books.lock().expect("books lock poisoned");
            let mut yes = None;
            let mut no = None;
            for (tok, i) in mapping.iter() {
                if i.market_id == info.market_id {
                    let top = books.get(tok).copied().unwrap_or_default();
                    match i.outcome {
                        Outcome::Yes => yes = Some(top),
                        Outcome::No => no = Some(top),
                    }
                }
            }
            (yes.unwrap_or_default(), no.unwrap_or_default())
        };

        // Rolling history of this instrument's mid.
        if let Some(mid) = {
            let books = self.books.lock().expect("books lock poisoned");
            books.get(token).and_then(|t| t.mid())
        } {
            let mut history = self.history.lock().expect("history lock poisoned");
            let series = history.entry(token.to_string()).or_default();
            series.push_back((Utc::now(), mid));
            while series.len() > self.cfg.history_len {
                series.pop_front();
            }
        }

        let (Some(yes_mid), Some(no_mid)) = (yes_top.mid(), no_top.mid()) else {
            return; // half a book is not a price
        };

        let mid_quote = Quote {
            yes_price: yes_mid,
            no_price: no_mid,
        };

        {
            let mut prices = self.prices.lock().expect("price cache lock poisoned");
            prices.insert(info.market_id.clone(), mid_quote);
        }

        // Drive any pending orders off the fresh quote.
        self.executor.process_market_update(&info.market_id, &mid_quote);

        // Arbitrage: detect on mids, execute at the asks.
        if is_arbitrage(&mid_quote, self.arb_threshold, self.arb_min_profit) {
            let exec_quote = Quote {
                yes_price: yes_top.ask,
                no_price: no_top.ask,
            };
            self.try_arbitrage(&info, &exec_quote);
        }
    }

    /// Place the dual-sided entry once per market. The actioned set is
    /// checked and updated under its lock; order placement happens after.
    fn try_arbitrage(&self, info: &InstrumentInfo, exec_quote: &Quote) {
        {
            let mut actioned = self.actioned.lock().expect("actioned lock poisoned");
            if !actioned.insert(info.market_id.clone()) {
                return; // already actioned
            }
        }

        if exec_quote.yes_price <= Decimal::ZERO || exec_quote.no_price <= Decimal::ZERO {
            return;
        }

        let balance = self.executor.balance();
        let quantity = arbitrage_quantity(
            balance,
            self.cfg.stake_fraction,
            self.cfg.stake_cap_usd,
            exec_quote,
        );
        if quantity <= Decimal::ZERO {
            return;
        }

        info!(
            market_id = %info.market_id,
            combined = %exec_quote.combined(),
            %quantity,
            "Arbitrage detected on live feed"
        );

        for outcome in [Outcome::Yes, Outcome::No] {
            let price = exec_quote.price_for(outcome);
            if let Err(e) = self.executor.place_market_order(
                &info.market_id,
                outcome,
                OrderSide::Buy,
                quantity,
                price,
            ) {
                error!(market_id = %info.market_id, %outcome, error = %e, "Arbitrage leg failed");
                return;
            }
            let recorded = {
                let mut bets = self.bets.lock().expect("bet store lock poisoned");
                bets.add_active_bet(BetTicket {
                    market_id: info.market_id.clone(),
                    asset: info.asset.clone(),
                    outcome,
                    quantity,
                    entry_price: price,
                    stop_loss: None, // held to settlement by construction
                    market_start: info.market_start,
                    market_end: info.market_end,
                    entry_reference_price: None,
                })
            };
            if let Err(e) = recorded {
                error!(market_id = %info.market_id, error = %e, "Arbitrage bet record failed");
            }
        }
    }
}

fn parse_level(level: &OrderLevel) -> Option<(Decimal, Decimal)> {
    let price: Decimal = level.price.parse().ok()?;
    let size: Decimal = level.size.parse().ok()?;
    if size > Decimal::ZERO {
        Some((price, size))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
