//! Simulated order executor.
//!
//! Applies fills to the portfolio ledger and tracks pending orders with
//! market/limit/stop/trailing-stop semantics. This is the sole write path
//! into the ledger: a fill mutates balance, position, and trade history
//! together under one lock, then persists a snapshot through the
//! `DurableStore`.
//!
//! Both the scanning loop and the real-time watcher call in here; the
//! internal mutexes serialize them. Locks are never held across network
//! I/O — durable writes are local file writes.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::ledger::Portfolio;
use crate::storage::DurableStore;
use crate::types::{EngineError, Order, OrderSide, OrderStatus, OrderType, Outcome, Quote, Trade};

pub struct OrderExecutor {
    portfolio: Arc<Mutex<Portfolio>>,
    orders: Mutex<HashMap<String, Order>>,
    store: Arc<dyn DurableStore>,
}

impl OrderExecutor {
    pub fn new(portfolio: Arc<Mutex<Portfolio>>, store: Arc<dyn DurableStore>) -> Self {
        Self {
            portfolio,
            orders: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Shared handle to the ledger this executor writes to.
    pub fn portfolio(&self) -> Arc<Mutex<Portfolio>> {
        Arc::clone(&self.portfolio)
    }

    /// Current balance (convenience read).
    pub fn balance(&self) -> Decimal {
        self.portfolio.lock().expect("portfolio lock poisoned").balance
    }

    // -- Immediate execution ---------------------------------------------

    /// Execute a market order at the given price.
    ///
    /// A BUY is rejected with no side effect if the balance cannot cover
    /// `quantity * price`; a SELL is rejected if the position is missing
    /// or short. On success the ledger mutation is atomic and a snapshot
    /// is persisted before returning.
    pub fn place_market_order(
        &self,
        market_id: &str,
        outcome: Outcome,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Trade, EngineError> {
        let trade = self.fill(market_id, outcome, side, quantity, price)?;
        info!(market_id, %outcome, %side, %quantity, %price, "Market order filled");
        Ok(trade)
    }

    // -- Pending orders ---------------------------------------------------

    /// Place a limit order: BUY fills when market price ≤ limit, SELL when
    /// market price ≥ limit.
    pub fn place_limit_order(
        &self,
        market_id: &str,
        outcome: Outcome,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Order {
        self.enqueue(Order {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            outcome,
            side,
            order_type: OrderType::Limit,
            quantity,
            filled_quantity: Decimal::ZERO,
            limit_price: Some(limit_price),
            stop_price: None,
            trailing_pct: None,
            watermark: None,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Place a stop order: BUY triggers when market price ≥ stop, SELL
    /// when market price ≤ stop.
    pub fn place_stop_order(
        &self,
        market_id: &str,
        outcome: Outcome,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Order {
        self.enqueue(Order {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            outcome,
            side,
            order_type: OrderType::Stop,
            quantity,
            filled_quantity: Decimal::ZERO,
            limit_price: None,
            stop_price: Some(stop_price),
            trailing_pct: None,
            watermark: None,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Place a trailing stop. The watermark starts at `current_price` and
    /// only ever moves in the position's favor; the order fires when the
    /// price crosses back through the derived trigger level.
    pub fn place_trailing_stop(
        &self,
        market_id: &str,
        outcome: Outcome,
        side: OrderSide,
        quantity: Decimal,
        trailing_pct: Decimal,
        current_price: Decimal,
    ) -> Order {
        self.enqueue(Order {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            outcome,
            side,
            order_type: OrderType::TrailingStop,
            quantity,
            filled_quantity: Decimal::ZERO,
            limit_price: None,
            stop_price: None,
            trailing_pct: Some(trailing_pct),
            watermark: Some(current_price),
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Cancel a pending order. Terminal orders cannot change.
    pub fn cancel_order(&self, order_id: &str) -> Result<Order, EngineError> {
        let mut orders = self.orders.lock().expect("orders lock poisoned");
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(EngineError::OrderTerminal(order_id.to_string()));
        }
        order.status = OrderStatus::Cancelled;
        info!(order_id, "Order cancelled");
        Ok(order.clone())
    }

    /// Expire all open orders for a market whose window has concluded.
    pub fn expire_orders(&self, market_id: &str) -> usize {
        let mut orders = self.orders.lock().expect("orders lock poisoned");
        let mut expired = 0;
        for order in orders.values_mut() {
            if order.market_id == market_id && order.is_open() {
                order.status = OrderStatus::Expired;
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(market_id, expired, "Expired stale orders");
        }
        expired
    }

    /// All orders still able to fill.
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .lock()
            .expect("orders lock poisoned")
            .values()
            .filter(|o| o.is_open())
            .cloned()
            .collect()
    }

    /// Look up an order by id.
    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.orders
            .lock()
            .expect("orders lock poisoned")
            .get(order_id)
            .cloned()
    }

    // -- Market updates ----------------------------------------------------

    /// Feed a price update for a market: scans pending orders, advances
    /// trailing-stop watermarks, and fires every eligible order. This is
    /// the sole bridge between the watcher / scanning loop and pending
    /// order fills. Returns the trades executed.
    pub fn process_market_update(&self, market_id: &str, quote: &Quote) -> Vec<Trade> {
        let mut trades = Vec::new();
        let mut orders = self.orders.lock().expect("orders lock poisoned");

        for order in orders.values_mut() {
            if order.market_id != market_id || !order.is_open() {
                continue;
            }
            let price = quote.price_for(order.outcome);
            if !Self::advance_and_check(order, price) {
                continue;
            }

            match self.fill(&order.market_id, order.outcome, order.side, order.quantity, price) {
                Ok(trade) => {
                    order.filled_quantity = order.quantity;
                    order.status = OrderStatus::Filled;
                    info!(order_id = %order.id, %price, "Pending order triggered and filled");
                    trades.push(trade);
                }
                Err(e) => {
                    // Conditions changed since placement (balance spent,
                    // position already closed). The order is dead.
                    order.status = OrderStatus::Rejected;
                    warn!(order_id = %order.id, error = %e, "Triggered order rejected");
                }
            }
        }

        trades
    }

    /// Update the trailing watermark (if any) and decide trigger
    /// eligibility at `price`.
    fn advance_and_check(order: &mut Order, price: Decimal) -> bool {
        match order.order_type {
            OrderType::Market => true,
            OrderType::Limit => {
                let limit = order.limit_price.unwrap_or(Decimal::ZERO);
                match order.side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                }
            }
            OrderType::Stop => {
                let stop = order.stop_price.unwrap_or(Decimal::ZERO);
                match order.side {
                    OrderSide::Buy => price >= stop,
                    OrderSide::Sell => price <= stop,
                }
            }
            OrderType::TrailingStop => {
                let trail = order.trailing_pct.unwrap_or(Decimal::ZERO);
                let watermark = order.watermark.get_or_insert(price);
                match order.side {
                    // Protects a long: the watermark only rises, so the
                    // trigger level never loosens.
                    OrderSide::Sell => {
                        if price > *watermark {
                            *watermark = price;
                        }
                        price <= *watermark * (Decimal::ONE - trail)
                    }
                    OrderSide::Buy => {
                        if price < *watermark {
                            *watermark = price;
                        }
                        price >= *watermark * (Decimal::ONE + trail)
                    }
                }
            }
        }
    }

    // -- Fill --------------------------------------------------------------

    /// Apply one fill atomically: balance, position, and trade history
    /// mutate together under the portfolio lock, then a snapshot is
    /// persisted. A validation failure leaves the ledger untouched.
    fn fill(
        &self,
        market_id: &str,
        outcome: Outcome,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Trade, EngineError> {
        let (snapshot, trade) = {
            let mut pf = self.portfolio.lock().expect("portfolio lock poisoned");

            match side {
                OrderSide::Buy => {
                    let cost = quantity * price;
                    if pf.balance < cost {
                        return Err(EngineError::InsufficientBalance {
                            needed: cost,
                            available: pf.balance,
                        });
                    }
                    pf.apply(-cost);
                    pf.add_position(market_id, outcome, quantity, price);
                }
                OrderSide::Sell => {
                    // Validation happens inside reduce_position, before
                    // any mutation.
                    pf.reduce_position(market_id, outcome, quantity)?;
                    pf.apply(quantity * price);
                }
            }

            let trade = Trade {
                market_id: market_id.to_string(),
                outcome,
                side,
                quantity,
                price,
                fee: Decimal::ZERO,
                timestamp: Utc::now(),
            };
            pf.trades.push(trade.clone());
            (pf.clone(), trade)
        };

        // The in-memory fill stands; a failed durable write propagates so
        // the caller can halt rather than run on unpersisted state.
        self.store
            .save_portfolio(&snapshot)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        Ok(trade)
    }

    fn enqueue(&self, order: Order) -> Order {
        debug!(order_id = %order.id, order = %order, "Order queued");
        self.orders
            .lock()
            .expect("orders lock poisoned")
            .insert(order.id.clone(), order.clone());
        order
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
