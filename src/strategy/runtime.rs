// =============================================================================
// Strategy Runtime — owns live strategy instances, one worker per bot
// =============================================================================
//
// Every registered bot gets a dedicated worker task that owns its strategy
// value outright. All events for one bot (ticks, candles, orderbooks, fills,
// position updates, stop) flow through that worker's queue, so per-bot state
// mutation is serialized by construction while distinct bots run in
// parallel.
//
// A strategy that panics never takes the engine down: the callback runs
// under `catch_unwind`, the failure is logged, `bot.error` is published, and
// the worker shuts itself down.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, SubscriptionId};
use crate::strategy::{Signal, Strategy, StrategyFill, StrategyPosition};
use crate::types::{Candle, Orderbook, Ticker};

// ---------------------------------------------------------------------------
// Worker events
// ---------------------------------------------------------------------------

/// Events delivered to a bot's worker, in arrival order.
#[derive(Debug)]
enum BotEvent {
    Tick(Ticker),
    Candle(Candle),
    Orderbook(Orderbook),
    /// Market stream reconnected; derived market state must be rebuilt.
    Reset,
    OrderFilled(StrategyFill),
    PositionUpdate(StrategyPosition),
    Stop(oneshot::Sender<()>),
}

struct BotWorker {
    symbol: String,
    tx: mpsc::UnboundedSender<BotEvent>,
    handle: tokio::task::JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Hosts strategy instances keyed by bot id and dispatches market events by
/// symbol.
pub struct StrategyRuntime {
    bus: Arc<EventBus>,
    workers: RwLock<HashMap<Uuid, BotWorker>>,
    symbol_index: RwLock<HashMap<String, HashSet<Uuid>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    stop_grace: Duration,
}

impl StrategyRuntime {
    pub fn new(bus: Arc<EventBus>, stop_grace: Duration) -> Self {
        Self {
            bus,
            workers: RwLock::new(HashMap::new()),
            symbol_index: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            stop_grace,
        }
    }

    /// Wire the runtime onto the bus: market events fan in by symbol, bot
    /// lifecycle events manage registration.
    pub fn attach(self: &Arc<Self>) {
        let runtime = self.clone();
        let market_sub = self.bus.subscribe(
            "market.*",
            Arc::new(move |event| {
                let runtime = runtime.clone();
                Box::pin(async move {
                    runtime.dispatch_market_event(&event.event_type, &event.data);
                    Ok(())
                })
            }),
        );

        let runtime = self.clone();
        let bot_sub = self.bus.subscribe(
            "bot.stopped",
            Arc::new(move |event| {
                let runtime = runtime.clone();
                Box::pin(async move {
                    if let Some(bot_id) = event.data["bot_id"]
                        .as_str()
                        .and_then(|s| Uuid::parse_str(s).ok())
                    {
                        runtime.unregister_strategy(&bot_id).await;
                    }
                    Ok(())
                })
            }),
        );

        self.subscriptions.lock().extend([market_sub, bot_sub]);
    }

    /// Drop the bus subscriptions (reverse of `attach`).
    pub fn detach(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Construct the worker for `bot_id` and start dispatching to it.
    ///
    /// The strategy's params were validated at construction; `initialize`
    /// builds derived state (ladders, grids) before the first event.
    pub fn register_strategy(self: &Arc<Self>, bot_id: Uuid, mut strategy: Strategy) {
        strategy.initialize();
        let symbol = strategy.symbol().to_string();
        let kind = strategy.kind();

        let (tx, rx) = mpsc::unbounded_channel();
        let bus = self.bus.clone();
        let handle = tokio::spawn(run_worker(bot_id, strategy, rx, bus));

        self.workers.write().insert(
            bot_id,
            BotWorker {
                symbol: symbol.clone(),
                tx,
                handle,
            },
        );
        self.symbol_index
            .write()
            .entry(symbol.clone())
            .or_default()
            .insert(bot_id);

        info!(bot_id = %bot_id, symbol = %symbol, strategy = kind, "strategy registered");
    }

    /// Stop the bot's worker, draining queued events within the grace period.
    pub async fn unregister_strategy(&self, bot_id: &Uuid) {
        let worker = match self.workers.write().remove(bot_id) {
            Some(worker) => worker,
            None => return,
        };
        if let Some(bots) = self.symbol_index.write().get_mut(&worker.symbol) {
            bots.remove(bot_id);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if worker.tx.send(BotEvent::Stop(ack_tx)).is_ok() {
            // Bounded drain: queued events ahead of Stop still process.
            if tokio::time::timeout(self.stop_grace, ack_rx).await.is_err() {
                warn!(bot_id = %bot_id, "stop drain exceeded grace period — aborting worker");
                worker.handle.abort();
            }
        } else {
            worker.handle.abort();
        }

        info!(bot_id = %bot_id, "strategy unregistered");
    }

    pub fn is_registered(&self, bot_id: &Uuid) -> bool {
        self.workers.read().contains_key(bot_id)
    }

    pub fn active_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Symbols with at least one live strategy.
    pub fn active_symbols(&self) -> Vec<String> {
        self.symbol_index
            .read()
            .iter()
            .filter(|(_, bots)| !bots.is_empty())
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn dispatch_market_event(&self, topic: &str, data: &serde_json::Value) {
        let symbol = match data["symbol"].as_str() {
            Some(symbol) => symbol,
            None => return,
        };

        let event = match topic {
            "market.tick" => match serde_json::from_value::<Ticker>(data.clone()) {
                Ok(tick) => BotEvent::Tick(tick),
                Err(_) => return,
            },
            "market.kline" => match serde_json::from_value::<Candle>(data["candle"].clone()) {
                Ok(candle) => BotEvent::Candle(candle),
                Err(_) => return,
            },
            "market.orderbook" => match serde_json::from_value::<Orderbook>(data.clone()) {
                Ok(orderbook) => BotEvent::Orderbook(orderbook),
                Err(_) => return,
            },
            "market.reset" => BotEvent::Reset,
            // market.trade carries no strategy callback.
            _ => return,
        };

        self.route_to_symbol(symbol, event);
    }

    /// Fan an event out to every bot trading `symbol`.
    fn route_to_symbol(&self, symbol: &str, event: BotEvent) {
        let bot_ids: Vec<Uuid> = match self.symbol_index.read().get(symbol) {
            Some(bots) => bots.iter().copied().collect(),
            None => return,
        };

        let workers = self.workers.read();
        for bot_id in bot_ids {
            if let Some(worker) = workers.get(&bot_id) {
                let cloned = match &event {
                    BotEvent::Tick(t) => BotEvent::Tick(t.clone()),
                    BotEvent::Candle(c) => BotEvent::Candle(*c),
                    BotEvent::Orderbook(ob) => BotEvent::Orderbook(ob.clone()),
                    BotEvent::Reset => BotEvent::Reset,
                    // Fill / position / stop events are bot-addressed, never
                    // symbol-fanned.
                    _ => continue,
                };
                let _ = worker.tx.send(cloned);
            }
        }
    }

    /// Pipeline notification: an order belonging to `bot_id` filled.
    pub fn notify_order_filled(&self, bot_id: &Uuid, fill: StrategyFill) {
        if let Some(worker) = self.workers.read().get(bot_id) {
            let _ = worker.tx.send(BotEvent::OrderFilled(fill));
        }
    }

    /// Pipeline notification: the bot's position changed.
    pub fn notify_position_update(&self, bot_id: &Uuid, update: StrategyPosition) {
        if let Some(worker) = self.workers.read().get(bot_id) {
            let _ = worker.tx.send(BotEvent::PositionUpdate(update));
        }
    }
}

impl std::fmt::Debug for StrategyRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRuntime")
            .field("active", &self.active_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Per-bot event loop. Owns the strategy; no locking anywhere.
async fn run_worker(
    bot_id: Uuid,
    mut strategy: Strategy,
    mut rx: mpsc::UnboundedReceiver<BotEvent>,
    bus: Arc<EventBus>,
) {
    while let Some(event) = rx.recv().await {
        let event = match event {
            BotEvent::Stop(ack) => {
                strategy.cleanup();
                let _ = ack.send(());
                break;
            }
            other => other,
        };

        // Strategy callbacks are synchronous and must never suspend; a panic
        // in user logic downs only this bot.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match event {
            BotEvent::Tick(tick) => strategy.on_tick(&tick),
            BotEvent::Candle(candle) => strategy.on_candle(candle),
            BotEvent::Orderbook(orderbook) => strategy.on_orderbook(orderbook),
            BotEvent::Reset => {
                strategy.initialize();
                None
            }
            BotEvent::OrderFilled(fill) => {
                strategy.on_order_filled(&fill);
                None
            }
            BotEvent::PositionUpdate(update) => {
                strategy.on_position_update(&update);
                None
            }
            BotEvent::Stop(_) => unreachable!("handled above"),
        }));

        match outcome {
            Ok(Some(signal)) => emit_signal(&bus, bot_id, signal),
            Ok(None) => {}
            Err(panic) => {
                let summary = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "strategy panicked".to_string());
                error!(bot_id = %bot_id, error = %summary, "strategy raised — stopping bot");
                bus.emit(
                    "bot.error",
                    json!({ "bot_id": bot_id.to_string(), "error": summary }),
                    None,
                );
                break;
            }
        }
    }
}

fn emit_signal(bus: &EventBus, bot_id: Uuid, signal: Signal) {
    // A fresh correlation id traces this signal through risk, order, and
    // fill events.
    let correlation_id = Uuid::new_v4().to_string();
    info!(
        bot_id = %bot_id,
        signal = %signal.signal_type,
        symbol = %signal.symbol,
        price = signal.price,
        reason = %signal.reason,
        "signal emitted"
    );
    bus.emit(
        "bot.signal",
        json!({
            "bot_id": bot_id.to_string(),
            "signal": signal,
        }),
        Some(correlation_id),
    );
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn dca_strategy(symbol: &str) -> Strategy {
        Strategy::from_config(
            "dca",
            symbol,
            &serde_json::json!({ "base_order_size": 100.0, "safety_order_size": 100.0 }),
        )
        .unwrap()
    }

    fn tick_data(symbol: &str, price: f64) -> serde_json::Value {
        serde_json::json!({
            "symbol": symbol,
            "exchange": "binance",
            "price": price,
            "bid": price,
            "ask": price,
            "volume_24h": 0.0,
            "change_24h": 0.0,
            "timestamp": Utc::now(),
        })
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

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn tick_routes_by_symbol_and_emits_signal() {
        let bus = Arc::new(EventBus::new("test"));
        let runtime = Arc::new(StrategyRuntime::new(bus.clone(), Duration::from_secs(5)));
        runtime.attach();

        let signals = collect_topic(&bus, "bot.signal");

        let btc_bot = Uuid::new_v4();
        let eth_bot = Uuid::new_v4();
        runtime.register_strategy(btc_bot, dca_strategy("BTCUSDT"));
        runtime.register_strategy(eth_bot, dca_strategy("ETHUSDT"));

        bus.emit("market.tick", tick_data("BTCUSDT", 100.0), None);
        settle().await;

        let captured = signals.lock().unwrap();
        // Only the BTC bot emits the DCA base order.
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0]["bot_id"], btc_bot.to_string());
        assert_eq!(captured[0]["signal"]["type"], "buy");
    }

    #[tokio::test]
    async fn unregister_stops_dispatch() {
        let bus = Arc::new(EventBus::new("test"));
        let runtime = Arc::new(StrategyRuntime::new(bus.clone(), Duration::from_secs(5)));
        runtime.attach();
        let signals = collect_topic(&bus, "bot.signal");

        let bot_id = Uuid::new_v4();
        runtime.register_strategy(bot_id, dca_strategy("BTCUSDT"));
        runtime.unregister_strategy(&bot_id).await;
        assert!(!runtime.is_registered(&bot_id));

        bus.emit("market.tick", tick_data("BTCUSDT", 100.0), None);
        settle().await;
        assert!(signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bot_stopped_event_unregisters() {
        let bus = Arc::new(EventBus::new("test"));
        let runtime = Arc::new(StrategyRuntime::new(bus.clone(), Duration::from_secs(5)));
        runtime.attach();

        let bot_id = Uuid::new_v4();
        runtime.register_strategy(bot_id, dca_strategy("BTCUSDT"));
        bus.emit(
            "bot.stopped",
            serde_json::json!({ "bot_id": bot_id.to_string() }),
            None,
        );
        settle().await;
        assert!(!runtime.is_registered(&bot_id));
    }

    #[tokio::test]
    async fn fills_are_serialized_with_ticks() {
        // A fill queued before a tick must be applied before that tick's
        // take-profit check (the per-bot ordering guarantee).
        let bus = Arc::new(EventBus::new("test"));
        let runtime = Arc::new(StrategyRuntime::new(bus.clone(), Duration::from_secs(5)));
        runtime.attach();
        let signals = collect_topic(&bus, "bot.signal");

        let bot_id = Uuid::new_v4();
        let strategy = Strategy::from_config(
            "dca",
            "BTCUSDT",
            &serde_json::json!({
                "base_order_size": 100.0,
                "safety_order_size": 100.0,
                "take_profit_percent": 1.0,
            }),
        )
        .unwrap();
        runtime.register_strategy(bot_id, strategy);

        bus.emit("market.tick", tick_data("BTCUSDT", 100.0), None);
        settle().await;
        runtime.notify_order_filled(
            &bot_id,
            StrategyFill {
                symbol: "BTCUSDT".into(),
                quantity: 100.0,
                price: 100.0,
            },
        );
        bus.emit("market.tick", tick_data("BTCUSDT", 101.5), None);
        settle().await;

        let captured = signals.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[1]["signal"]["type"], "sell");
    }

    #[tokio::test]
    async fn remaining_bots_keep_running_after_one_stops() {
        let bus = Arc::new(EventBus::new("test"));
        let runtime = Arc::new(StrategyRuntime::new(bus.clone(), Duration::from_secs(5)));
        runtime.attach();
        let signals = collect_topic(&bus, "bot.signal");

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        runtime.register_strategy(a, dca_strategy("BTCUSDT"));
        runtime.register_strategy(b, dca_strategy("BTCUSDT"));
        runtime.unregister_strategy(&a).await;

        bus.emit("market.tick", tick_data("BTCUSDT", 100.0), None);
        settle().await;

        let captured = signals.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0]["bot_id"], b.to_string());
    }
}
