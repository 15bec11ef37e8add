// =============================================================================
// Order Store — in-memory projection of orders and their fills
// =============================================================================
//
// Orders and trades are append-only from the engine's perspective: an
// order's status only ever advances along
//   pending -> submitted -> open -> { partial* -> filled | cancelled |
//   rejected | expired }
// and a trade row is appended per fill, never mutated.
//
// `client_order_id` is assigned deterministically before submission as
// `{bot_id}:{monotonic_counter}` and is unique per process.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{OrderSide, OrderStatus, OrderType, TimeInForce};

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A concrete instruction sent (or to be sent) to an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub exchange: String,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub client_order_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub remaining_quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub average_price: Option<f64>,
    pub fee: f64,
    #[serde(default)]
    pub fee_asset: String,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Wall-clock submit-to-acknowledge latency.
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Traces the originating signal through risk -> order -> fill.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// A fill. One order may produce many; rows are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub order_id: Uuid,
    pub bot_id: Uuid,
    #[serde(default)]
    pub position_id: Option<Uuid>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    #[serde(default)]
    pub fee_asset: String,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    pub is_maker: bool,
    pub executed_at: DateTime<Utc>,
}

/// Parameters for creating a pending order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub reason: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum OrderStoreError {
    #[error("order not found")]
    NotFound,

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("invalid order: {0}")]
    InvalidOrder(String),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe order/trade projection. Reads return snapshot copies.
pub struct OrderStore {
    orders: RwLock<HashMap<Uuid, Order>>,
    by_client_id: RwLock<HashMap<String, Uuid>>,
    trades: RwLock<Vec<Trade>>,
    counters: Mutex<HashMap<Uuid, u64>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            by_client_id: RwLock::new(HashMap::new()),
            trades: RwLock::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic `{bot_id}:{counter}` client order id, assigned before
    /// submission.
    pub fn next_client_order_id(&self, bot_id: &Uuid) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(*bot_id).or_insert(0);
        *counter += 1;
        format!("{bot_id}:{counter}")
    }

    /// Persist a new order in `pending`.
    pub fn create(&self, new_order: NewOrder, client_order_id: String) -> Order {
        let order = Order {
            id: Uuid::new_v4(),
            user_id: new_order.user_id,
            bot_id: new_order.bot_id,
            exchange: new_order.exchange,
            exchange_order_id: None,
            client_order_id: client_order_id.clone(),
            symbol: new_order.symbol,
            order_type: new_order.order_type,
            side: new_order.side,
            status: OrderStatus::Pending,
            quantity: new_order.quantity,
            filled_quantity: 0.0,
            remaining_quantity: new_order.quantity,
            price: new_order.price,
            stop_price: new_order.stop_price,
            average_price: None,
            fee: 0.0,
            fee_asset: String::new(),
            time_in_force: new_order.time_in_force,
            reduce_only: new_order.reduce_only,
            reason: new_order.reason,
            error_message: None,
            created_at: Utc::now(),
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            latency_ms: None,
            correlation_id: new_order.correlation_id,
        };

        self.by_client_id
            .write()
            .insert(client_order_id, order.id);
        self.orders.write().insert(order.id, order.clone());
        debug!(order_id = %order.id, client_order_id = %order.client_order_id, "order created");
        order
    }

    // -------------------------------------------------------------------------
    // Lookups (snapshot copies)
    // -------------------------------------------------------------------------

    pub fn get(&self, order_id: &Uuid) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn get_by_client_id(&self, client_order_id: &str) -> Option<Order> {
        let id = *self.by_client_id.read().get(client_order_id)?;
        self.get(&id)
    }

    /// Orders that can still fill or be cancelled on the exchange.
    pub fn active_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect()
    }

    pub fn orders_for_bot(&self, bot_id: &Uuid) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.bot_id == *bot_id)
            .cloned()
            .collect()
    }

    pub fn trades_for_order(&self, order_id: &Uuid) -> Vec<Trade> {
        self.trades
            .read()
            .iter()
            .filter(|t| t.order_id == *order_id)
            .cloned()
            .collect()
    }

    pub fn trades_for_bot(&self, bot_id: &Uuid) -> Vec<Trade> {
        self.trades
            .read()
            .iter()
            .filter(|t| t.bot_id == *bot_id)
            .cloned()
            .collect()
    }

    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Advance an order's status. Regressions and terminal re-transitions
    /// are refused; repeated `partial` is allowed (one per fill).
    pub fn transition(
        &self,
        order_id: &Uuid,
        to: OrderStatus,
    ) -> Result<Order, OrderStoreError> {
        let mut orders = self.orders.write();
        let order = orders.get_mut(order_id).ok_or(OrderStoreError::NotFound)?;
        let from = order.status;

        let allowed = !from.is_terminal()
            && (to.rank() > from.rank() || (from == OrderStatus::Partial && to == from));
        if !allowed {
            warn!(order_id = %order_id, from = %from, to = %to, "refused status regression");
            return Err(OrderStoreError::InvalidTransition { from, to });
        }

        order.status = to;
        let now = Utc::now();
        match to {
            OrderStatus::Submitted => order.submitted_at = Some(now),
            OrderStatus::Filled => order.filled_at = Some(now),
            OrderStatus::Cancelled => order.cancelled_at = Some(now),
            _ => {}
        }
        debug!(order_id = %order_id, from = %from, to = %to, "order status advanced");
        Ok(order.clone())
    }

    /// Record submit acknowledgement details.
    pub fn mark_submitted(
        &self,
        order_id: &Uuid,
        exchange_order_id: Option<String>,
        latency_ms: u64,
    ) -> Result<Order, OrderStoreError> {
        {
            let mut orders = self.orders.write();
            let order = orders.get_mut(order_id).ok_or(OrderStoreError::NotFound)?;
            order.exchange_order_id = exchange_order_id;
            order.latency_ms = Some(latency_ms);
        }
        self.transition(order_id, OrderStatus::Submitted)
    }

    /// Record a rejection with its reason.
    pub fn mark_rejected(
        &self,
        order_id: &Uuid,
        error_message: impl Into<String>,
    ) -> Result<Order, OrderStoreError> {
        {
            let mut orders = self.orders.write();
            let order = orders.get_mut(order_id).ok_or(OrderStoreError::NotFound)?;
            order.error_message = Some(error_message.into());
        }
        self.transition(order_id, OrderStatus::Rejected)
    }

    /// Apply a fill: accumulate quantity and fees, recompute the average
    /// price, append the trade row, and advance the status.
    pub fn apply_fill(
        &self,
        order_id: &Uuid,
        fill_quantity: f64,
        fill_price: f64,
        fee: f64,
        fee_asset: &str,
        is_maker: bool,
    ) -> Result<(Order, Trade), OrderStoreError> {
        let (snapshot, trade) = {
            let mut orders = self.orders.write();
            let order = orders.get_mut(order_id).ok_or(OrderStoreError::NotFound)?;

            if order.status.is_terminal() {
                return Err(OrderStoreError::InvalidOrder(format!(
                    "fill on terminal order {order_id}"
                )));
            }
            // filled_quantity <= quantity always.
            let fill_quantity = fill_quantity.min(order.remaining_quantity);
            if fill_quantity <= 0.0 {
                return Err(OrderStoreError::InvalidOrder(
                    "fill quantity exhausted".to_string(),
                ));
            }

            let previously_filled = order.filled_quantity;
            order.filled_quantity += fill_quantity;
            order.remaining_quantity = (order.quantity - order.filled_quantity).max(0.0);
            order.average_price = Some(match order.average_price {
                Some(avg) => {
                    (avg * previously_filled + fill_price * fill_quantity) / order.filled_quantity
                }
                None => fill_price,
            });
            order.fee += fee;
            if order.fee_asset.is_empty() {
                order.fee_asset = fee_asset.to_string();
            }

            let trade = Trade {
                id: Uuid::new_v4(),
                order_id: *order_id,
                bot_id: order.bot_id,
                position_id: None,
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: fill_quantity,
                price: fill_price,
                fee,
                fee_asset: fee_asset.to_string(),
                realized_pnl: None,
                is_maker,
                executed_at: Utc::now(),
            };
            (order.clone(), trade)
        };

        let to = if snapshot.remaining_quantity <= f64::EPSILON {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        let order = self.transition(order_id, to)?;

        self.trades.write().push(trade.clone());
        info!(
            order_id = %order_id,
            quantity = trade.quantity,
            price = trade.price,
            status = %order.status,
            "fill applied"
        );
        Ok((order, trade))
    }

    /// Stamp the realized PnL and position onto an already-appended trade.
    pub fn annotate_trade(&self, trade_id: &Uuid, position_id: Uuid, realized_pnl: Option<f64>) {
        let mut trades = self.trades.write();
        if let Some(trade) = trades.iter_mut().find(|t| t.id == *trade_id) {
            trade.position_id = Some(position_id);
            trade.realized_pnl = realized_pnl;
        }
    }

    /// Cancel an order. Terminal orders fail with `InvalidOrder`.
    pub fn cancel(&self, order_id: &Uuid) -> Result<Order, OrderStoreError> {
        let status = self
            .get(order_id)
            .ok_or(OrderStoreError::NotFound)?
            .status;
        if status.is_terminal() {
            return Err(OrderStoreError::InvalidOrder(format!(
                "cannot cancel order with status {status}"
            )));
        }
        self.transition(order_id, OrderStatus::Cancelled)
    }

    /// Adopt an order that exists on the exchange but not locally (found by
    /// reconciliation). Enters the projection already `open`.
    #[allow(clippy::too_many_arguments)]
    pub fn adopt(
        &self,
        user_id: Uuid,
        bot_id: Uuid,
        exchange: &str,
        client_order_id: &str,
        exchange_order_id: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        filled_quantity: f64,
        price: Option<f64>,
    ) -> Order {
        let order = Order {
            id: Uuid::new_v4(),
            user_id,
            bot_id,
            exchange: exchange.to_string(),
            exchange_order_id: Some(exchange_order_id.to_string()),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            order_type: if price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            side,
            status: OrderStatus::Open,
            quantity,
            filled_quantity,
            remaining_quantity: (quantity - filled_quantity).max(0.0),
            price,
            stop_price: None,
            average_price: None,
            fee: 0.0,
            fee_asset: String::new(),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            reason: "reconciliation_adopted".to_string(),
            error_message: None,
            created_at: Utc::now(),
            submitted_at: Some(Utc::now()),
            filled_at: None,
            cancelled_at: None,
            latency_ms: None,
            correlation_id: None,
        };

        self.by_client_id
            .write()
            .insert(client_order_id.to_string(), order.id);
        self.orders.write().insert(order.id, order.clone());
        info!(
            order_id = %order.id,
            client_order_id = %client_order_id,
            bot_id = %bot_id,
            "remote order adopted"
        );
        order
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStore")
            .field("orders", &self.orders.read().len())
            .field("trades", &self.trades.read().len())
            .finish()
    }
}
