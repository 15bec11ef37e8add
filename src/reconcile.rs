// =============================================================================
// Reconciliation — diff local projections against authoritative exchange state
// =============================================================================
//
// Runs every N seconds and at adapter reconnect. Three corrections keep the
// projections eventually consistent across restarts and missed stream
// events:
//
//   1. Orders open on the exchange but unknown locally are adopted (status
//      `open`), attributed to the owning bot via the deterministic
//      `client_order_id`.
//   2. Local non-terminal orders missing from the exchange's open set are
//      moved to `cancelled`.
//   3. Local open positions with no remote counterpart (futures) are closed
//      at the last known mark.
//
// Running twice with no intervening exchange change mutates nothing.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bot::BotRegistry;
use crate::bus::EventBus;
use crate::exchange::{AdapterKey, ExchangeAdapter};
use crate::orders::OrderStore;
use crate::positions::PositionBook;
use crate::types::{MarketType, OrderStatus};

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub orders_adopted: u32,
    pub orders_cancelled: u32,
    pub positions_closed: u32,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileSummary {
    /// True when the pass changed nothing.
    pub fn is_clean(&self) -> bool {
        self.orders_adopted == 0 && self.orders_cancelled == 0 && self.positions_closed == 0
    }
}

/// Parse the owning bot out of a deterministic `{bot_id}:{counter}` id.
fn bot_id_from_client_order_id(client_order_id: &str) -> Option<Uuid> {
    let (bot_part, _counter) = client_order_id.split_once(':')?;
    Uuid::parse_str(bot_part).ok()
}

/// Run one reconciliation cycle against a single adapter instance.
pub async fn reconcile_once(
    key: &AdapterKey,
    adapter: &Arc<dyn ExchangeAdapter>,
    bots: &BotRegistry,
    orders: &OrderStore,
    positions: &PositionBook,
    bus: &EventBus,
) -> Result<ReconcileSummary> {
    let now = Utc::now();
    debug!(exchange = %key.exchange, market_type = %key.market_type, "reconciliation started");

    let mut summary = ReconcileSummary {
        orders_adopted: 0,
        orders_cancelled: 0,
        positions_closed: 0,
        timestamp: now,
    };

    // -----------------------------------------------------------------
    // 1. Exchange open orders: adopt the unknown ones.
    // -----------------------------------------------------------------
    let remote_orders = adapter.get_open_orders(None).await?;
    let mut remote_ids: HashSet<String> = HashSet::new();

    for remote in &remote_orders {
        if !remote.client_order_id.is_empty() {
            remote_ids.insert(remote.client_order_id.clone());
        }
        if !remote.exchange_order_id.is_empty() {
            remote_ids.insert(remote.exchange_order_id.clone());
        }

        if remote.client_order_id.is_empty()
            || orders.get_by_client_id(&remote.client_order_id).is_some()
        {
            continue;
        }
        // Attribution: the deterministic client id names the owning bot.
        let Some(bot_id) = bot_id_from_client_order_id(&remote.client_order_id) else {
            debug!(
                client_order_id = %remote.client_order_id,
                "remote order with foreign client id skipped"
            );
            continue;
        };
        let Some(bot) = bots.get(&bot_id) else {
            warn!(bot_id = %bot_id, "remote order names an unknown bot — skipped");
            continue;
        };

        let adopted = orders.adopt(
            bot.user_id,
            bot_id,
            &key.exchange,
            &remote.client_order_id,
            &remote.exchange_order_id,
            &remote.symbol,
            remote.side,
            remote.quantity,
            remote.filled_quantity,
            remote.price,
        );
        bus.emit(
            "order.created",
            json!({
                "bot_id": bot_id.to_string(),
                "order": adopted,
                "adopted": true,
            }),
            None,
        );
        summary.orders_adopted += 1;
    }

    // -----------------------------------------------------------------
    // 2. Local active orders missing remotely: cancelled.
    // -----------------------------------------------------------------
    for local in orders.active_orders() {
        let Some(bot) = bots.get(&local.bot_id) else {
            continue;
        };
        let belongs_here = bot.exchange == key.exchange
            && bot.credential_id == key.credential_id
            && bot.market_type == key.market_type;
        if !belongs_here {
            continue;
        }

        let known_remotely = remote_ids.contains(&local.client_order_id)
            || local
                .exchange_order_id
                .as_ref()
                .map(|id| remote_ids.contains(id))
                .unwrap_or(false);
        if known_remotely {
            continue;
        }

        if orders.transition(&local.id, OrderStatus::Cancelled).is_ok() {
            bus.emit(
                "order.cancelled",
                json!({
                    "bot_id": local.bot_id.to_string(),
                    "order_id": local.id,
                    "reason": "reconciliation",
                }),
                None,
            );
            summary.orders_cancelled += 1;
        }
    }

    // -----------------------------------------------------------------
    // 3. Local open positions missing remotely (futures only).
    // -----------------------------------------------------------------
    if key.market_type == MarketType::Futures {
        let remote_positions = adapter.get_positions().await?;
        let remote_symbols: HashSet<&str> = remote_positions
            .iter()
            .map(|p| p.symbol.as_str())
            .collect();

        for local in positions.open_positions() {
            let Some(bot) = bots.get(&local.bot_id) else {
                continue;
            };
            let belongs_here = bot.exchange == key.exchange
                && bot.credential_id == key.credential_id
                && bot.market_type == key.market_type;
            if !belongs_here || remote_symbols.contains(local.symbol.as_str()) {
                continue;
            }

            let mark = local
                .current_price
                .unwrap_or(local.average_entry_price);
            if let Some(closed) =
                positions.close_at(&local.bot_id, &local.symbol, mark, "reconciliation_missing")
            {
                bus.emit(
                    "position.closed",
                    json!({
                        "bot_id": closed.bot_id.to_string(),
                        "position": closed,
                        "reason": "reconciliation",
                    }),
                    None,
                );
                summary.positions_closed += 1;
            }
        }
    }

    if summary.is_clean() {
        debug!(exchange = %key.exchange, "reconciliation clean — no drift");
    } else {
        info!(
            exchange = %key.exchange,
            adopted = summary.orders_adopted,
            cancelled = summary.orders_cancelled,
            positions_closed = summary.positions_closed,
            "reconciliation corrected drift"
        );
    }

    Ok(summary)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::{Bot, BotStatus};
    use crate::exchange::{
        ExchangeError, ExchangePosition, ExchangeResult, ExecutionReport, OrderRequest,
        OrderResult, StreamHandle,
    };
    use crate::orders::NewOrder;
    use crate::types::{Balance, OrderSide, OrderType, Orderbook, Ticker, TimeInForce};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct FakeExchange {
        open_orders: StdMutex<Vec<OrderResult>>,
        positions: StdMutex<Vec<ExchangePosition>>,
        market_type: MarketType,
    }

    impl FakeExchange {
        fn new(market_type: MarketType) -> Self {
            Self {
                open_orders: StdMutex::new(Vec::new()),
                positions: StdMutex::new(Vec::new()),
                market_type,
            }
        }

        fn add_open_order(&self, client_order_id: &str, exchange_order_id: &str) {
            self.open_orders.lock().unwrap().push(OrderResult {
                exchange_order_id: exchange_order_id.into(),
                client_order_id: client_order_id.into(),
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                status: OrderStatus::Open,
                price: Some(100.0),
                quantity: 1.0,
                filled_quantity: 0.0,
                average_price: None,
                fee: 0.0,
                fee_asset: String::new(),
                timestamp: Utc::now(),
            });
        }
    }

    #[async_trait]
    impl ExchangeAdapter for FakeExchange {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn market_type(&self) -> MarketType {
            self.market_type
        }
        async fn connect(&self) -> ExchangeResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> ExchangeResult<()> {
            Ok(())
        }
        async fn get_ticker(&self, _s: &str) -> ExchangeResult<Ticker> {
            Err(ExchangeError::Unknown("unused".into()))
        }
        async fn get_orderbook(&self, _s: &str, _d: u32) -> ExchangeResult<Orderbook> {
            Err(ExchangeError::Unknown("unused".into()))
        }
        async fn get_balances(&self) -> ExchangeResult<Vec<Balance>> {
            Ok(Vec::new())
        }
        async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
            Ok(self.positions.lock().unwrap().clone())
        }
        async fn place_order(&self, _r: &OrderRequest) -> ExchangeResult<OrderResult> {
            Err(ExchangeError::Unknown("unused".into()))
        }
        async fn cancel_order(&self, _s: &str, _o: &str) -> ExchangeResult<bool> {
            Ok(true)
        }
        async fn get_order(&self, _s: &str, _o: &str) -> ExchangeResult<OrderResult> {
            Err(ExchangeError::Unknown("unused".into()))
        }
        async fn get_open_orders(&self, _s: Option<&str>) -> ExchangeResult<Vec<OrderResult>> {
            Ok(self.open_orders.lock().unwrap().clone())
        }
        async fn set_leverage(&self, _s: &str, _l: u32) -> ExchangeResult<()> {
            Ok(())
        }
        async fn tick_size(&self, _s: &str) -> ExchangeResult<f64> {
            Ok(0.01)
        }
        fn spawn_market_streams(self: Arc<Self>, _s: &str, _b: Arc<EventBus>) -> StreamHandle {
            StreamHandle::new(Vec::new())
        }
        fn spawn_user_stream(
            self: Arc<Self>,
            _tx: mpsc::UnboundedSender<ExecutionReport>,
        ) -> StreamHandle {
            StreamHandle::new(Vec::new())
        }
    }

    struct Fixture {
        key: AdapterKey,
        exchange: Arc<FakeExchange>,
        adapter: Arc<dyn ExchangeAdapter>,
        bots: BotRegistry,
        orders: OrderStore,
        positions: PositionBook,
        bus: EventBus,
        bot_id: Uuid,
    }

    fn fixture(market_type: MarketType) -> Fixture {
        let bots = BotRegistry::new();
        let mut bot = Bot::new(
            Uuid::new_v4(),
            "recon-bot",
            "fake",
            Uuid::new_v4(),
            "BTCUSDT",
            "USDT",
            market_type,
            "grid",
            serde_json::json!({}),
            100.0,
        );
        bot.status = BotStatus::Running;
        let bot_id = bot.id;
        let key = AdapterKey {
            exchange: "fake".into(),
            credential_id: bot.credential_id,
            market_type,
        };
        bots.insert(bot);

        let exchange = Arc::new(FakeExchange::new(market_type));
        let adapter: Arc<dyn ExchangeAdapter> = exchange.clone();

        Fixture {
            key,
            exchange,
            adapter,
            bots,
            orders: OrderStore::new(),
            positions: PositionBook::new(),
            bus: EventBus::new("test"),
            bot_id,
        }
    }

    async fn run(f: &Fixture) -> ReconcileSummary {
        reconcile_once(
            &f.key,
            &f.adapter,
            &f.bots,
            &f.orders,
            &f.positions,
            &f.bus,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn remote_only_order_is_adopted_and_attributed() {
        let f = fixture(MarketType::Spot);
        let client_order_id = format!("{}:4", f.bot_id);
        f.exchange.add_open_order(&client_order_id, "555");

        assert!(f.orders.get_by_client_id(&client_order_id).is_none());
        let summary = run(&f).await;
        assert_eq!(summary.orders_adopted, 1);

        let adopted = f.orders.get_by_client_id(&client_order_id).unwrap();
        assert_eq!(adopted.status, OrderStatus::Open);
        assert_eq!(adopted.bot_id, f.bot_id);
    }

    #[tokio::test]
    async fn local_only_active_order_is_cancelled() {
        let f = fixture(MarketType::Spot);
        let bot = f.bots.get(&f.bot_id).unwrap();
        let coid = f.orders.next_client_order_id(&f.bot_id);
        let order = f.orders.create(
            NewOrder {
                user_id: bot.user_id,
                bot_id: f.bot_id,
                exchange: "fake".into(),
                symbol: "BTCUSDT".into(),
                order_type: OrderType::Limit,
                side: OrderSide::Buy,
                quantity: 1.0,
                price: Some(100.0),
                stop_price: None,
                time_in_force: TimeInForce::Gtc,
                reduce_only: false,
                reason: "test".into(),
                correlation_id: None,
            },
            coid,
        );
        f.orders.transition(&order.id, OrderStatus::Submitted).unwrap();
        f.orders.transition(&order.id, OrderStatus::Open).unwrap();

        let summary = run(&f).await;
        assert_eq!(summary.orders_cancelled, 1);
        assert_eq!(f.orders.get(&order.id).unwrap().status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_remote_position_is_closed_at_mark() {
        let f = fixture(MarketType::Futures);
        f.positions
            .apply_fill(f.bot_id, "BTCUSDT", OrderSide::Buy, 1.0, 100.0, 0.0, 1.0);
        f.positions.update_mark("BTCUSDT", 97.5);

        let summary = run(&f).await;
        assert_eq!(summary.positions_closed, 1);
        assert_eq!(f.positions.open_positions().len(), 0);
        let closed = &f.positions.closed_positions(1)[0];
        assert_eq!(closed.close_reason.as_deref(), Some("reconciliation_missing"));
        assert!((closed.realized_pnl + 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let f = fixture(MarketType::Futures);
        // Drift of all three kinds at once.
        let client_order_id = format!("{}:9", f.bot_id);
        f.exchange.add_open_order(&client_order_id, "901");
        f.positions
            .apply_fill(f.bot_id, "BTCUSDT", OrderSide::Buy, 1.0, 100.0, 0.0, 1.0);

        let first = run(&f).await;
        assert!(!first.is_clean());

        // Second pass with unchanged exchange state mutates nothing.
        let second = run(&f).await;
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn terminal_orders_are_left_alone() {
        let f = fixture(MarketType::Spot);
        let bot = f.bots.get(&f.bot_id).unwrap();
        let coid = f.orders.next_client_order_id(&f.bot_id);
        let order = f.orders.create(
            NewOrder {
                user_id: bot.user_id,
                bot_id: f.bot_id,
                exchange: "fake".into(),
                symbol: "BTCUSDT".into(),
                order_type: OrderType::Limit,
                side: OrderSide::Buy,
                quantity: 1.0,
                price: Some(100.0),
                stop_price: None,
                time_in_force: TimeInForce::Gtc,
                reduce_only: false,
                reason: "test".into(),
                correlation_id: None,
            },
            coid,
        );
        f.orders.transition(&order.id, OrderStatus::Submitted).unwrap();
        f.orders.transition(&order.id, OrderStatus::Filled).unwrap();

        let summary = run(&f).await;
        assert!(summary.is_clean());
        assert_eq!(f.orders.get(&order.id).unwrap().status, OrderStatus::Filled);
    }
}
