// =============================================================================
// Signal-to-Order Pipeline — turns strategy intent into exchange orders
// =============================================================================
//
// Consumes `bot.signal` events. For each signal, atomically per bot:
//
//   1. Load the bot and its risk context (quote equity from adapter
//      balances, open positions, in-flight orders).
//   2. Derive the order quantity (signal quantity, or the bot's
//      fixed/percent position sizing).
//   3. Obtain risk clearance. A rejection emits `order.rejected` and never
//      touches the exchange.
//   4. Persist a pending order with a deterministic client id, then place it,
//      measuring submit latency.
//   5. Ingest fills from the user-data stream: order updates, trade rows,
//      position impact, risk accounting, strategy notification.
//
// The risk critical section never contains I/O: balances are fetched first,
// the lock is taken for validation only, and the exchange call happens after
// release.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLog};
use crate::bot::{Bot, BotRegistry, BotStatus, PositionSizeType};
use crate::bus::{EventBus, SubscriptionId};
use crate::exchange::{
    AdapterKey, AdapterRegistry, ExchangeAdapter, ExchangeError, ExecutionReport, OrderRequest,
};
use crate::orders::{NewOrder, Order, OrderStore, OrderStoreError};
use crate::positions::{FillImpact, PositionBook, PositionEvent};
use crate::risk::RiskManager;
use crate::strategy::runtime::StrategyRuntime;
use crate::strategy::{Signal, SignalType, StrategyFill, StrategyPosition};
use crate::types::{OrderSide, OrderStatus, OrderType, PositionSide, TimeInForce};

/// Longest pause honoured when the adapter reports a rate limit; longer
/// waits drop the signal instead.
const RATE_LIMIT_DEFER_CAP: Duration = Duration::from_secs(10);

pub struct SignalPipeline {
    bus: Arc<EventBus>,
    bots: Arc<BotRegistry>,
    adapters: Arc<AdapterRegistry>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderStore>,
    positions: Arc<PositionBook>,
    audit: Arc<AuditLog>,
    runtime: Arc<StrategyRuntime>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl SignalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        bots: Arc<BotRegistry>,
        adapters: Arc<AdapterRegistry>,
        risk: Arc<RiskManager>,
        orders: Arc<OrderStore>,
        positions: Arc<PositionBook>,
        audit: Arc<AuditLog>,
        runtime: Arc<StrategyRuntime>,
    ) -> Self {
        Self {
            bus,
            bots,
            adapters,
            risk,
            orders,
            positions,
            audit,
            runtime,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to `bot.signal` on the bus.
    pub fn attach(self: &Arc<Self>) {
        let pipeline = self.clone();
        let sub = self.bus.subscribe(
            "bot.signal",
            Arc::new(move |event| {
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    let bot_id = event.data["bot_id"]
                        .as_str()
                        .and_then(|s| Uuid::parse_str(s).ok())
                        .ok_or_else(|| anyhow::anyhow!("bot.signal without bot_id"))?;
                    let signal: Signal = serde_json::from_value(event.data["signal"].clone())?;
                    pipeline
                        .handle_signal(bot_id, signal, event.correlation_id)
                        .await;
                    Ok(())
                })
            }),
        );
        self.subscriptions.lock().push(sub);
    }

    pub fn detach(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    /// Spawn the consumer that drains one adapter's user-data stream.
    pub fn spawn_execution_consumer(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ExecutionReport>,
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                pipeline.handle_execution(report);
            }
        })
    }

    fn adapter_for(&self, bot: &Bot) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(&AdapterKey {
            exchange: bot.exchange.clone(),
            credential_id: bot.credential_id,
            market_type: bot.market_type,
        })
    }

    // -------------------------------------------------------------------------
    // Signal handling
    // -------------------------------------------------------------------------

    pub async fn handle_signal(
        &self,
        bot_id: Uuid,
        signal: Signal,
        correlation_id: Option<String>,
    ) {
        let Some(bot) = self.bots.get(&bot_id) else {
            warn!(bot_id = %bot_id, "signal for unknown bot dropped");
            return;
        };
        // Signals that have not reached risk validation are dropped once the
        // bot leaves Running (stop drain, error, kill).
        if bot.status != BotStatus::Running {
            debug!(bot_id = %bot_id, status = %bot.status, "signal dropped — bot not running");
            return;
        }
        if signal.signal_type == SignalType::Hold {
            return;
        }
        self.bots.touch_signal(&bot_id);

        let Some(adapter) = self.adapter_for(&bot) else {
            self.fail_bot(&bot, "no adapter for bot credentials").await;
            return;
        };

        // 1. Risk context: quote equity from adapter balances. This is I/O
        //    and therefore happens before the risk lock.
        let portfolio_value = match adapter.get_balances().await {
            Ok(balances) => balances
                .iter()
                .find(|b| b.asset == bot.quote_asset)
                .map(|b| b.total)
                .unwrap_or(0.0),
            Err(e) => {
                self.handle_exchange_failure(&bot, &e, None).await;
                return;
            }
        };

        // 2. Order side and quantity.
        let (side, reduce_only) = match signal.signal_type {
            SignalType::Buy => (OrderSide::Buy, false),
            SignalType::Sell => (OrderSide::Sell, false),
            SignalType::CloseLong => (OrderSide::Sell, true),
            SignalType::CloseShort => (OrderSide::Buy, true),
            SignalType::Hold => return,
        };

        let quantity = match signal.quantity {
            Some(quantity) if quantity > 0.0 => quantity,
            _ if reduce_only => {
                // A close without a quantity flattens the whole position.
                match self.positions.get(&bot_id, &signal.symbol) {
                    Some(position) => position.quantity,
                    None => {
                        debug!(bot_id = %bot_id, "close signal without open position dropped");
                        return;
                    }
                }
            }
            _ => {
                if signal.price <= 0.0 {
                    warn!(bot_id = %bot_id, "signal without usable price dropped");
                    return;
                }
                let quote_amount = match bot.position_size_type {
                    PositionSizeType::Fixed => bot.position_size,
                    PositionSizeType::Percent => {
                        portfolio_value * bot.position_size / 100.0
                    }
                };
                quote_amount / signal.price
            }
        };

        // 3. Risk clearance. Lock held for the checks only; no I/O inside.
        let engine = self.risk.engine_for(bot.user_id);
        let validation = {
            let mut engine = engine.lock();
            engine.observe_equity(chrono::Utc::now(), portfolio_value);
            engine.validate_order(
                &signal.symbol,
                PositionSide::from_order_side(side),
                quantity,
                signal.price,
                bot.leverage as f64,
                portfolio_value,
            )
        };
        if !validation.valid {
            let reason = validation.reason.unwrap_or_else(|| "risk rejected".into());
            info!(bot_id = %bot_id, reason = %reason, "order rejected by risk engine");
            self.audit.record(
                AuditKind::RiskRejected,
                bot_id,
                bot.user_id,
                &signal.symbol,
                &reason,
            );
            self.bus.emit(
                "order.rejected",
                json!({
                    "bot_id": bot_id.to_string(),
                    "symbol": signal.symbol,
                    "reason": reason,
                    "signal": signal,
                }),
                correlation_id,
            );
            return;
        }

        // 4. Persist pending order, deterministic client id, then place.
        let client_order_id = self.orders.next_client_order_id(&bot_id);
        let order = self.orders.create(
            NewOrder {
                user_id: bot.user_id,
                bot_id,
                exchange: bot.exchange.clone(),
                symbol: signal.symbol.clone(),
                order_type: if signal.price > 0.0 {
                    OrderType::Limit
                } else {
                    OrderType::Market
                },
                side,
                quantity,
                price: if signal.price > 0.0 {
                    Some(signal.price)
                } else {
                    None
                },
                stop_price: None,
                time_in_force: TimeInForce::Gtc,
                reduce_only,
                reason: signal.reason.clone(),
                correlation_id: correlation_id.clone(),
            },
            client_order_id.clone(),
        );
        self.bus.emit(
            "order.created",
            json!({ "bot_id": bot_id.to_string(), "order": order }),
            correlation_id.clone(),
        );

        // Protective prices ride along for the position projection.
        if signal.stop_loss.is_some() || signal.take_profit.is_some() {
            self.positions.set_protective_prices(
                &bot_id,
                &signal.symbol,
                signal.stop_loss,
                signal.take_profit,
            );
        }

        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side,
            order_type: order.order_type,
            quantity,
            price: order.price,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only,
            client_order_id: Some(client_order_id),
        };

        self.place_order(&bot, &order, &request, correlation_id).await;
    }

    /// Place with latency measurement and one bounded rate-limit deferral.
    async fn place_order(
        &self,
        bot: &Bot,
        order: &Order,
        request: &OrderRequest,
        correlation_id: Option<String>,
    ) {
        let adapter = match self.adapter_for(bot) {
            Some(adapter) => adapter,
            None => return,
        };

        let started = Instant::now();
        let mut result = adapter.place_order(request).await;

        // Deferred retry inside the rate-limit pause, bounded by the cap.
        if let Err(ExchangeError::RateLimited { retry_after_ms }) = &result {
            let pause = Duration::from_millis(*retry_after_ms);
            if pause <= RATE_LIMIT_DEFER_CAP {
                debug!(
                    order_id = %order.id,
                    pause_ms = *retry_after_ms,
                    "rate limited — deferring order"
                );
                tokio::time::sleep(pause).await;
                result = adapter.place_order(request).await;
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(ack) => {
                let submitted = self.orders.mark_submitted(
                    &order.id,
                    if ack.exchange_order_id.is_empty() {
                        None
                    } else {
                        Some(ack.exchange_order_id.clone())
                    },
                    latency_ms,
                );
                if let Ok(submitted) = submitted {
                    self.audit.record(
                        AuditKind::OrderSubmitted,
                        bot.id,
                        bot.user_id,
                        &submitted.symbol,
                        format!(
                            "{} {} {} @ {:?} ({} ms)",
                            submitted.side,
                            submitted.quantity,
                            submitted.symbol,
                            submitted.price,
                            latency_ms
                        ),
                    );
                    self.bus.emit(
                        "order.submitted",
                        json!({ "bot_id": bot.id.to_string(), "order": submitted }),
                        correlation_id.clone(),
                    );
                    // The exchange acked NEW: the order is resting.
                    if ack.status == OrderStatus::Open {
                        let _ = self.orders.transition(&order.id, OrderStatus::Open);
                    }
                }
            }
            Err(e) => {
                self.handle_exchange_failure(bot, &e, Some(order)).await;
                let reason = match &e {
                    ExchangeError::RateLimited { .. } => "rate_limited".to_string(),
                    other => other.to_string(),
                };
                if self.orders.mark_rejected(&order.id, &reason).is_ok() {
                    self.bus.emit(
                        "order.rejected",
                        json!({
                            "bot_id": bot.id.to_string(),
                            "order_id": order.id.to_string(),
                            "symbol": order.symbol,
                            "reason": reason,
                        }),
                        correlation_id,
                    );
                }
            }
        }
    }

    /// Apply the per-kind failure policy from the error taxonomy.
    async fn handle_exchange_failure(
        &self,
        bot: &Bot,
        error: &ExchangeError,
        order: Option<&Order>,
    ) {
        match error {
            ExchangeError::Auth(reason) => {
                // Non-retryable: the credential is invalid. Every bot using
                // it stops.
                error!(
                    credential_id = %bot.credential_id,
                    reason = %reason,
                    "credential auth failure — stopping all bots on credential"
                );
                for affected in self.bots.by_credential(&bot.credential_id) {
                    self.fail_bot(&affected, format!("credential auth failure: {reason}"))
                        .await;
                }
            }
            ExchangeError::Connection(reason) => {
                // Adapter retries are exhausted by the time this surfaces.
                // Positions stay open for reconciliation on next connect.
                self.fail_bot(bot, format!("exchange connection failure: {reason}"))
                    .await;
            }
            ExchangeError::OrderRejected { reason, .. } => {
                info!(
                    bot_id = %bot.id,
                    order_id = ?order.map(|o| o.id),
                    reason = %reason,
                    "order rejected by exchange — not retried"
                );
            }
            ExchangeError::RateLimited { retry_after_ms } => {
                warn!(
                    bot_id = %bot.id,
                    retry_after_ms,
                    "rate limited beyond defer bound"
                );
            }
            ExchangeError::InvalidParameter(reason) => {
                warn!(bot_id = %bot.id, reason = %reason, "invalid order parameters");
            }
            ExchangeError::Unknown(reason) => {
                error!(bot_id = %bot.id, reason = %reason, "unknown exchange error");
                self.fail_bot(bot, format!("unknown exchange error: {reason}"))
                    .await;
            }
        }
    }

    /// Move a bot to `error`, publish `bot.error`, and stop its strategy.
    async fn fail_bot(&self, bot: &Bot, message: impl Into<String>) {
        let message = message.into();
        self.bots.set_error(&bot.id, &message);
        self.bots.set_status(&bot.id, BotStatus::Error);
        self.bus.emit(
            "bot.error",
            json!({ "bot_id": bot.id.to_string(), "error": message }),
            None,
        );
        self.runtime.unregister_strategy(&bot.id).await;
    }

    // -------------------------------------------------------------------------
    // Execution-report ingestion (user-data stream)
    // -------------------------------------------------------------------------

    /// Fold an asynchronous execution report into the projections.
    pub fn handle_execution(&self, report: ExecutionReport) {
        let Some(order) = self.lookup_order(&report) else {
            // Unknown order: a restart or missed create. Reconciliation will
            // adopt it from the exchange's open-order list.
            debug!(
                client_order_id = %report.client_order_id,
                "execution report for unknown order ignored"
            );
            return;
        };
        let correlation_id = order.correlation_id.clone();

        // Pure state changes (ack, cancel, reject, expire) carry no fill.
        if report.last_fill_quantity <= 0.0 {
            match report.status {
                OrderStatus::Open => {
                    let _ = self.orders.transition(&order.id, OrderStatus::Open);
                }
                OrderStatus::Cancelled => {
                    if self.orders.transition(&order.id, OrderStatus::Cancelled).is_ok() {
                        self.bus.emit(
                            "order.cancelled",
                            json!({ "bot_id": order.bot_id.to_string(), "order_id": order.id }),
                            correlation_id,
                        );
                    }
                }
                OrderStatus::Rejected => {
                    if self.orders.mark_rejected(&order.id, "rejected by exchange").is_ok() {
                        self.bus.emit(
                            "order.rejected",
                            json!({
                                "bot_id": order.bot_id.to_string(),
                                "order_id": order.id.to_string(),
                                "symbol": order.symbol,
                                "reason": "rejected by exchange",
                            }),
                            correlation_id,
                        );
                    }
                }
                OrderStatus::Expired => {
                    let _ = self.orders.transition(&order.id, OrderStatus::Expired);
                }
                _ => {}
            }
            return;
        }

        // A fill (partial or complete).
        let applied = self.orders.apply_fill(
            &order.id,
            report.last_fill_quantity,
            report.last_fill_price,
            report.fee,
            &report.fee_asset,
            report.is_maker,
        );
        let (order, trade) = match applied {
            Ok(pair) => pair,
            Err(OrderStoreError::InvalidOrder(reason)) => {
                warn!(order_id = %order.id, reason = %reason, "fill ignored");
                return;
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "failed to apply fill");
                return;
            }
        };

        let topic = if order.status == OrderStatus::Filled {
            "order.filled"
        } else {
            "order.partial"
        };
        self.bus.emit(
            topic,
            json!({
                "bot_id": order.bot_id.to_string(),
                "order": order,
                "trade": trade,
            }),
            correlation_id.clone(),
        );

        // Position impact.
        let bot = self.bots.get(&order.bot_id);
        let leverage = bot.as_ref().map(|b| b.leverage as f64).unwrap_or(1.0);
        let impact = self.positions.apply_fill(
            order.bot_id,
            &order.symbol,
            order.side,
            trade.quantity,
            trade.price,
            trade.fee,
            leverage,
        );
        self.orders.annotate_trade(
            &trade.id,
            impact.position.id,
            if impact.event == PositionEvent::Opened {
                None
            } else {
                Some(impact.realized_pnl)
            },
        );
        if order.reason.starts_with("Safety order") {
            self.positions
                .increment_safety_orders(&order.bot_id, &order.symbol);
        }
        self.publish_position_events(&order, &impact, correlation_id);

        // Risk accounting and strategy notification.
        self.update_risk_after_fill(&order, &impact, leverage);
        self.notify_strategy(&order, &trade, &impact);
    }

    fn lookup_order(&self, report: &ExecutionReport) -> Option<Order> {
        if !report.client_order_id.is_empty() {
            if let Some(order) = self.orders.get_by_client_id(&report.client_order_id) {
                return Some(order);
            }
        }
        // Fall back to the exchange id over active orders.
        self.orders
            .active_orders()
            .into_iter()
            .find(|o| o.exchange_order_id.as_deref() == Some(report.exchange_order_id.as_str()))
    }

    fn publish_position_events(
        &self,
        order: &Order,
        impact: &FillImpact,
        correlation_id: Option<String>,
    ) {
        let topic = match impact.event {
            PositionEvent::Opened => "position.opened",
            PositionEvent::Updated => "position.updated",
            PositionEvent::Closed => "position.closed",
        };
        self.bus.emit(
            topic,
            json!({
                "bot_id": order.bot_id.to_string(),
                "position": impact.position,
            }),
            correlation_id.clone(),
        );
        if let Some(flipped) = &impact.flipped_open {
            self.bus.emit(
                "position.opened",
                json!({
                    "bot_id": order.bot_id.to_string(),
                    "position": flipped,
                }),
                correlation_id,
            );
        }
    }

    fn update_risk_after_fill(&self, order: &Order, impact: &FillImpact, leverage: f64) {
        let engine = self.risk.engine_for(order.user_id);
        let mut engine = engine.lock();

        match impact.event {
            PositionEvent::Closed => {
                engine.record_realized_pnl(impact.realized_pnl);
                engine.update_position(
                    &order.symbol,
                    impact.position.side,
                    0.0,
                    0.0,
                    0.0,
                    leverage,
                );
                drop(engine);
                // Lifetime bot counters accumulate on close.
                self.bots.record_trade_result(
                    &order.bot_id,
                    impact.position.realized_pnl,
                    impact.position.total_fees,
                );
            }
            _ => {
                if impact.realized_pnl != 0.0 {
                    engine.record_realized_pnl(impact.realized_pnl);
                }
                let position = &impact.position;
                engine.update_position(
                    &order.symbol,
                    position.side,
                    position.quantity,
                    position.average_entry_price,
                    position.current_price.unwrap_or(position.average_entry_price),
                    leverage,
                );
            }
        }
    }

    fn notify_strategy(&self, order: &Order, trade: &crate::orders::Trade, impact: &FillImpact) {
        self.runtime.notify_order_filled(
            &order.bot_id,
            StrategyFill {
                symbol: order.symbol.clone(),
                quantity: trade.quantity,
                price: trade.price,
            },
        );

        let update = match impact.event {
            PositionEvent::Closed => match &impact.flipped_open {
                Some(flipped) => StrategyPosition {
                    quantity: flipped.quantity,
                    entry_price: flipped.average_entry_price,
                    unrealized_pnl: flipped.unrealized_pnl,
                },
                None => StrategyPosition {
                    quantity: 0.0,
                    entry_price: 0.0,
                    unrealized_pnl: 0.0,
                },
            },
            _ => StrategyPosition {
                quantity: impact.position.quantity,
                entry_price: impact.position.average_entry_price,
                unrealized_pnl: impact.position.unrealized_pnl,
            },
        };
        self.runtime.notify_position_update(&order.bot_id, update);
    }

    // -------------------------------------------------------------------------
    // Cancellation (internal API)
    // -------------------------------------------------------------------------

    /// Cancel an order locally and on the exchange. Terminal orders fail.
    pub async fn cancel_order(&self, order_id: &Uuid) -> Result<Order, OrderStoreError> {
        let order = self.orders.get(order_id).ok_or(OrderStoreError::NotFound)?;
        if order.status.is_terminal() {
            return Err(OrderStoreError::InvalidOrder(format!(
                "cannot cancel order with status {}",
                order.status
            )));
        }

        if let (Some(bot), Some(exchange_order_id)) =
            (self.bots.get(&order.bot_id), order.exchange_order_id.as_ref())
        {
            if let Some(adapter) = self.adapter_for(&bot) {
                if let Err(e) = adapter.cancel_order(&order.symbol, exchange_order_id).await {
                    warn!(order_id = %order_id, error = %e, "exchange cancel failed");
                }
            }
        }

        let cancelled = self.orders.cancel(order_id)?;
        self.bus.emit(
            "order.cancelled",
            json!({ "bot_id": cancelled.bot_id.to_string(), "order_id": cancelled.id }),
            cancelled.correlation_id.clone(),
        );
        Ok(cancelled)
    }
}

impl std::fmt::Debug for SignalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalPipeline")
            .field("orders", &self.orders)
            .field("positions", &self.positions)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::Bot;
    use crate::risk::RiskLimits;
    use crate::types::MarketType;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    use crate::exchange::{ExchangeResult, OrderResult, StreamHandle};
    use crate::types::{Balance, Orderbook, Ticker};

    /// Scripted in-memory adapter for pipeline tests.
    struct FakeAdapter {
        balances: Vec<Balance>,
        place_results: StdMutex<Vec<ExchangeResult<OrderResult>>>,
        place_calls: StdMutex<u32>,
    }

    impl FakeAdapter {
        fn with_quote(total: f64) -> Self {
            Self {
                balances: vec![Balance {
                    asset: "USDT".into(),
                    free: total,
                    locked: 0.0,
                    total,
                }],
                place_results: StdMutex::new(Vec::new()),
                place_calls: StdMutex::new(0),
            }
        }

        fn script_place(&self, result: ExchangeResult<OrderResult>) {
            self.place_results.lock().unwrap().push(result);
        }

        fn calls(&self) -> u32 {
            *self.place_calls.lock().unwrap()
        }

        fn ack(symbol: &str, client_order_id: &str) -> OrderResult {
            OrderResult {
                exchange_order_id: "777".into(),
                client_order_id: client_order_id.into(),
                symbol: symbol.into(),
                side: OrderSide::Buy,
                status: OrderStatus::Open,
                price: Some(100.0),
                quantity: 1.0,
                filled_quantity: 0.0,
                average_price: None,
                fee: 0.0,
                fee_asset: String::new(),
                timestamp: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn market_type(&self) -> MarketType {
            MarketType::Spot
        }
        async fn connect(&self) -> ExchangeResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> ExchangeResult<()> {
            Ok(())
        }
        async fn get_ticker(&self, _symbol: &str) -> ExchangeResult<Ticker> {
            Err(ExchangeError::Unknown("not scripted".into()))
        }
        async fn get_orderbook(&self, _symbol: &str, _depth: u32) -> ExchangeResult<Orderbook> {
            Err(ExchangeError::Unknown("not scripted".into()))
        }
        async fn get_balances(&self) -> ExchangeResult<Vec<Balance>> {
            Ok(self.balances.clone())
        }
        async fn get_positions(&self) -> ExchangeResult<Vec<crate::exchange::ExchangePosition>> {
            Ok(Vec::new())
        }
        async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResult> {
            *self.place_calls.lock().unwrap() += 1;
            let mut scripted = self.place_results.lock().unwrap();
            if scripted.is_empty() {
                Ok(Self::ack(
                    &request.symbol,
                    request.client_order_id.as_deref().unwrap_or(""),
                ))
            } else {
                scripted.remove(0)
            }
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> ExchangeResult<bool> {
            Ok(true)
        }
        async fn get_order(&self, _symbol: &str, _order_id: &str) -> ExchangeResult<OrderResult> {
            Err(ExchangeError::Unknown("not scripted".into()))
        }
        async fn get_open_orders(
            &self,
            _symbol: Option<&str>,
        ) -> ExchangeResult<Vec<OrderResult>> {
            Ok(Vec::new())
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
            Ok(())
        }
        async fn tick_size(&self, _symbol: &str) -> ExchangeResult<f64> {
            Ok(0.01)
        }
        fn spawn_market_streams(
            self: Arc<Self>,
            _symbol: &str,
            _bus: Arc<EventBus>,
        ) -> StreamHandle {
            StreamHandle::new(Vec::new())
        }
        fn spawn_user_stream(
            self: Arc<Self>,
            _tx: mpsc::UnboundedSender<ExecutionReport>,
        ) -> StreamHandle {
            StreamHandle::new(Vec::new())
        }
    }

    struct Harness {
        bus: Arc<EventBus>,
        bots: Arc<BotRegistry>,
        orders: Arc<OrderStore>,
        positions: Arc<PositionBook>,
        audit: Arc<AuditLog>,
        pipeline: Arc<SignalPipeline>,
        adapter: Arc<FakeAdapter>,
        bot_id: Uuid,
    }

    fn harness(quote_total: f64, limits: RiskLimits) -> Harness {
        let bus = Arc::new(EventBus::new("test"));
        let bots = Arc::new(BotRegistry::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let risk = Arc::new(RiskManager::new(limits));
        let orders = Arc::new(OrderStore::new());
        let positions = Arc::new(PositionBook::new());
        let audit = Arc::new(AuditLog::new());
        let runtime = Arc::new(StrategyRuntime::new(
            bus.clone(),
            Duration::from_secs(5),
        ));

        let mut bot = Bot::new(
            Uuid::new_v4(),
            "test-bot",
            "fake",
            Uuid::new_v4(),
            "BTCUSDT",
            "USDT",
            MarketType::Spot,
            "grid",
            serde_json::json!({}),
            100.0,
        );
        bot.status = BotStatus::Running;
        let bot_id = bot.id;
        let credential_id = bot.credential_id;
        bots.insert(bot);

        let adapter = Arc::new(FakeAdapter::with_quote(quote_total));
        adapters.insert(
            AdapterKey {
                exchange: "fake".into(),
                credential_id,
                market_type: MarketType::Spot,
            },
            adapter.clone(),
        );

        let pipeline = Arc::new(SignalPipeline::new(
            bus.clone(),
            bots.clone(),
            adapters,
            risk,
            orders.clone(),
            positions.clone(),
            audit.clone(),
            runtime,
        ));

        Harness {
            bus,
            bots,
            orders,
            positions,
            audit,
            pipeline,
            adapter,
            bot_id,
        }
    }

    fn collect_topic(bus: &EventBus, topic: &str) -> Arc<StdMutex<Vec<serde_json::Value>>> {
        let sink = Arc::new(StdMutex::new(Vec::new()));
        let captured = sink.clone();
        bus.subscribe(
            topic,
            Arc::new(move |event| {
                let captured = captured.clone();
                Box::pin(async move {
                    captured.lock().unwrap().push(event.data);
                    Ok(())
                })
            }),
        );
        sink
    }

    fn buy_signal(quantity: f64, price: f64) -> Signal {
        Signal::new(SignalType::Buy, "BTCUSDT", price)
            .with_quantity(quantity)
            .with_reason("test entry")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[tokio::test]
    async fn risk_rejection_never_reaches_the_exchange() {
        // 6 * 100 = 600 on a 10_000 portfolio = 6% against the 5% cap.
        let h = harness(10_000.0, RiskLimits::default());
        let rejected = collect_topic(&h.bus, "order.rejected");

        h.pipeline
            .handle_signal(h.bot_id, buy_signal(6.0, 100.0), None)
            .await;
        settle().await;

        assert_eq!(h.adapter.calls(), 0);
        let events = rejected.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0]["reason"]
            .as_str()
            .unwrap()
            .contains("Position size"));
        // And the rejection is audited.
        assert_eq!(h.audit.recent(1)[0].kind, AuditKind::RiskRejected);
    }

    #[tokio::test]
    async fn accepted_signal_places_order_and_tracks_lifecycle() {
        let h = harness(10_000.0, RiskLimits::default());
        let created = collect_topic(&h.bus, "order.created");
        let submitted = collect_topic(&h.bus, "order.submitted");

        h.pipeline
            .handle_signal(h.bot_id, buy_signal(1.0, 100.0), Some("corr-9".into()))
            .await;
        settle().await;

        assert_eq!(h.adapter.calls(), 1);
        assert_eq!(created.lock().unwrap().len(), 1);
        let submitted = submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);

        let order_id = submitted[0]["order"]["id"].as_str().unwrap();
        let order = h.orders.get(&Uuid::parse_str(order_id).unwrap()).unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert!(order.latency_ms.is_some());
        assert_eq!(order.client_order_id, format!("{}:1", h.bot_id));
        assert_eq!(h.audit.recent(1)[0].kind, AuditKind::OrderSubmitted);
    }

    #[tokio::test]
    async fn quantity_derivation_fixed_and_percent() {
        let h = harness(10_000.0, RiskLimits::default());

        // No signal quantity: fixed 100 USDT at price 200 -> 0.5.
        let signal = Signal::new(SignalType::Buy, "BTCUSDT", 200.0);
        h.pipeline.handle_signal(h.bot_id, signal, None).await;
        let orders = h.orders.orders_for_bot(&h.bot_id);
        assert_eq!(orders.len(), 1);
        assert!((orders[0].quantity - 0.5).abs() < 1e-9);

        // Percent sizing: 2% of 10_000 = 200 USDT at price 200 -> 1.0.
        {
            let mut bot = h.bots.get(&h.bot_id).unwrap();
            bot.position_size = 2.0;
            bot.position_size_type = PositionSizeType::Percent;
            h.bots.insert(bot);
        }
        let signal = Signal::new(SignalType::Buy, "BTCUSDT", 200.0);
        h.pipeline.handle_signal(h.bot_id, signal, None).await;
        let mut orders = h.orders.orders_for_bot(&h.bot_id);
        orders.sort_by_key(|o| o.created_at);
        assert!((orders[1].quantity - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exchange_rejection_marks_order_rejected() {
        let h = harness(10_000.0, RiskLimits::default());
        h.adapter.script_place(Err(ExchangeError::OrderRejected {
            reason: "insufficient balance".into(),
            order_id: None,
        }));
        let rejected = collect_topic(&h.bus, "order.rejected");

        h.pipeline
            .handle_signal(h.bot_id, buy_signal(1.0, 100.0), None)
            .await;
        settle().await;

        let orders = h.orders.orders_for_bot(&h.bot_id);
        assert_eq!(orders[0].status, OrderStatus::Rejected);
        assert!(orders[0]
            .error_message
            .as_ref()
            .unwrap()
            .contains("insufficient balance"));
        assert_eq!(rejected.lock().unwrap().len(), 1);
        // The bot keeps running: exchange rejections are not fatal.
        assert_eq!(h.bots.get(&h.bot_id).unwrap().status, BotStatus::Running);
    }

    #[tokio::test]
    async fn auth_failure_stops_every_bot_on_the_credential() {
        let h = harness(10_000.0, RiskLimits::default());
        h.adapter
            .script_place(Err(ExchangeError::Auth("key revoked".into())));

        h.pipeline
            .handle_signal(h.bot_id, buy_signal(1.0, 100.0), None)
            .await;
        settle().await;

        let bot = h.bots.get(&h.bot_id).unwrap();
        assert_eq!(bot.status, BotStatus::Error);
        assert!(bot.last_error.unwrap().contains("auth"));
    }

    #[tokio::test]
    async fn signals_for_non_running_bots_are_dropped() {
        let h = harness(10_000.0, RiskLimits::default());
        h.bots.set_status(&h.bot_id, BotStatus::Stopping);

        h.pipeline
            .handle_signal(h.bot_id, buy_signal(1.0, 100.0), None)
            .await;
        assert_eq!(h.adapter.calls(), 0);
        assert_eq!(h.orders.order_count(), 0);
    }

    #[tokio::test]
    async fn fills_flow_into_trades_positions_and_events() {
        let h = harness(100_000.0, RiskLimits::default());
        let filled = collect_topic(&h.bus, "order.filled");
        let partial = collect_topic(&h.bus, "order.partial");
        let opened = collect_topic(&h.bus, "position.opened");
        let closed_topic = collect_topic(&h.bus, "position.closed");

        h.pipeline
            .handle_signal(h.bot_id, buy_signal(2.0, 100.0), None)
            .await;
        settle().await;
        let order = &h.orders.orders_for_bot(&h.bot_id)[0];

        let report = |quantity: f64, price: f64, status: OrderStatus| ExecutionReport {
            exchange: "fake".into(),
            symbol: "BTCUSDT".into(),
            exchange_order_id: "777".into(),
            client_order_id: order.client_order_id.clone(),
            side: OrderSide::Buy,
            status,
            last_fill_quantity: quantity,
            last_fill_price: price,
            cumulative_filled: 0.0,
            average_price: None,
            fee: 0.0,
            fee_asset: "USDT".into(),
            is_maker: true,
            executed_at: Utc::now(),
        };

        h.pipeline
            .handle_execution(report(0.5, 100.0, OrderStatus::Partial));
        h.pipeline
            .handle_execution(report(1.5, 100.0, OrderStatus::Filled));
        settle().await;

        let order = h.orders.get(&order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled_quantity - 2.0).abs() < 1e-12);

        // Conservation: filled quantity equals summed trade quantity.
        let trade_sum: f64 = h
            .orders
            .trades_for_order(&order.id)
            .iter()
            .map(|t| t.quantity)
            .sum();
        assert!((trade_sum - order.filled_quantity).abs() < 1e-12);

        assert_eq!(partial.lock().unwrap().len(), 1);
        assert_eq!(filled.lock().unwrap().len(), 1);
        // First fill opens the position; the second updates it.
        assert_eq!(opened.lock().unwrap().len(), 1);
        assert!(closed_topic.lock().unwrap().is_empty());
        let position = h.positions.get(&h.bot_id, "BTCUSDT").unwrap();
        assert!((position.quantity - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn cancel_rules_follow_the_status_machine() {
        let h = harness(10_000.0, RiskLimits::default());
        h.pipeline
            .handle_signal(h.bot_id, buy_signal(1.0, 100.0), None)
            .await;
        let order = &h.orders.orders_for_bot(&h.bot_id)[0];

        let cancelled = h.pipeline.cancel_order(&order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        // Second cancel hits a terminal order.
        let err = h.pipeline.cancel_order(&order.id).await.unwrap_err();
        assert!(matches!(err, OrderStoreError::InvalidOrder(_)));
    }
}
