// =============================================================================
// Exchange Adapter Layer — uniform contract over heterogeneous exchange APIs
// =============================================================================
//
// One adapter instance exists per (exchange, credential, market_type). All
// adapters present identical request/response types and the same streaming
// model; signing differences and wire formats live entirely inside each
// implementation.
//
// Every adapter normalizes failures into the fixed `ExchangeError` taxonomy
// so callers can apply uniform policies (retry, defer, reject).
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod ratelimit;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::types::{
    Balance, MarketType, OrderSide, OrderStatus, OrderType, Orderbook, PositionSide, Ticker,
    TimeInForce,
};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Normalized exchange failure. Adapters own the mapping from HTTP statuses
/// and numeric exchange error codes into these variants.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("order rejected: {reason}")]
    OrderRejected {
        reason: String,
        order_id: Option<String>,
    },

    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("exchange error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// Connection failures are the only transparently retryable kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Parameters for placing an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

/// Normalized order snapshot returned by order operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    #[serde(default)]
    pub price: Option<f64>,
    pub quantity: f64,
    pub filled_quantity: f64,
    #[serde(default)]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub fee: f64,
    #[serde(default)]
    pub fee_asset: String,
    pub timestamp: DateTime<Utc>,
}

/// Open position reported by the exchange (futures; empty for spot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub margin_type: String,
}

/// A fill (partial or complete) or order-state change delivered on the
/// user-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub exchange: String,
    pub symbol: String,
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Quantity of this fill; zero for pure state changes.
    pub last_fill_quantity: f64,
    pub last_fill_price: f64,
    pub cumulative_filled: f64,
    #[serde(default)]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub fee: f64,
    #[serde(default)]
    pub fee_asset: String,
    #[serde(default)]
    pub is_maker: bool,
    pub executed_at: DateTime<Utc>,
}

/// Handle over the tasks backing a stream subscription. Aborting the handle
/// tears the sockets down.
#[derive(Debug)]
pub struct StreamHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Stop every task behind this subscription.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// Uniform per-exchange interface: REST signing, order operations, streaming.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Exchange name, e.g. `"binance"`.
    fn name(&self) -> &'static str;

    /// Market this instance trades on.
    fn market_type(&self) -> MarketType;

    /// Idempotent: opens the HTTP client and primes streaming credentials.
    async fn connect(&self) -> ExchangeResult<()>;

    /// Idempotent teardown.
    async fn disconnect(&self) -> ExchangeResult<()>;

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    /// Both sides sorted away from mid.
    async fn get_orderbook(&self, symbol: &str, depth: u32) -> ExchangeResult<Orderbook>;

    async fn get_balances(&self) -> ExchangeResult<Vec<Balance>>;

    /// Open positions; empty for spot markets.
    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResult>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<bool>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderResult>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderResult>>;

    /// Futures only; a no-op on spot.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Minimum price increment for `symbol`.
    async fn tick_size(&self, symbol: &str) -> ExchangeResult<f64>;

    /// Spawn the market-data streams for `symbol`, publishing `market.*`
    /// events to `bus` until the handle is aborted. Streams reconnect with
    /// exponential backoff and emit `market.reset` after re-establishing.
    fn spawn_market_streams(self: Arc<Self>, symbol: &str, bus: Arc<EventBus>) -> StreamHandle;

    /// Spawn the user-data stream, delivering execution reports on `tx`.
    fn spawn_user_stream(
        self: Arc<Self>,
        tx: mpsc::UnboundedSender<ExecutionReport>,
    ) -> StreamHandle;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Key identifying an adapter instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterKey {
    pub exchange: String,
    pub credential_id: Uuid,
    pub market_type: MarketType,
}

/// Thread-safe registry of live adapter instances.
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<AdapterKey, Arc<dyn ExchangeAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: AdapterKey, adapter: Arc<dyn ExchangeAdapter>) {
        self.adapters.write().insert(key, adapter);
    }

    pub fn get(&self, key: &AdapterKey) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.read().get(key).cloned()
    }

    pub fn remove(&self, key: &AdapterKey) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.write().remove(key)
    }

    pub fn keys(&self) -> Vec<AdapterKey> {
        self.adapters.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared status mapping
// ---------------------------------------------------------------------------

/// Map an exchange order-status string into the engine's status machine.
/// Both Binance and Bybit use close variants of the same vocabulary.
pub fn map_order_status(raw: &str) -> OrderStatus {
    match raw.to_ascii_uppercase().as_str() {
        "NEW" | "ACCEPTED" | "CREATED" => OrderStatus::Open,
        "PARTIALLY_FILLED" | "PARTIALLYFILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "CANCELLED" | "PENDING_CANCEL" | "PARTIALLYFILLEDCANCELED" => {
            OrderStatus::Cancelled
        }
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" | "DEACTIVATED" => OrderStatus::Expired,
        _ => OrderStatus::Submitted,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_both_vocabularies() {
        assert_eq!(map_order_status("NEW"), OrderStatus::Open);
        assert_eq!(map_order_status("PARTIALLY_FILLED"), OrderStatus::Partial);
        assert_eq!(map_order_status("PartiallyFilled"), OrderStatus::Partial);
        assert_eq!(map_order_status("FILLED"), OrderStatus::Filled);
        assert_eq!(map_order_status("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("Cancelled"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(map_order_status("EXPIRED"), OrderStatus::Expired);
    }

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(ExchangeError::Connection("timeout".into()).is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::RateLimited { retry_after_ms: 100 }.is_retryable());
        assert!(!ExchangeError::OrderRejected {
            reason: "insufficient balance".into(),
            order_id: None
        }
        .is_retryable());
    }

    #[test]
    fn registry_is_keyed_by_exchange_credential_market() {
        let registry = AdapterRegistry::new();
        let cred = Uuid::new_v4();
        let spot = AdapterKey {
            exchange: "binance".into(),
            credential_id: cred,
            market_type: MarketType::Spot,
        };
        let futures = AdapterKey {
            exchange: "binance".into(),
            credential_id: cred,
            market_type: MarketType::Futures,
        };
        assert_ne!(spot, futures);
        assert!(registry.get(&spot).is_none());
    }
}
