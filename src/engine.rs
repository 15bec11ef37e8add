// =============================================================================
// Engine State — wires the subsystems together and owns bot lifecycle
// =============================================================================
//
// The single source of truth for the running engine. Construction follows
// the fixed init order bus -> risk -> registries -> adapters; shutdown
// reverses it. All subsystems hang off `Arc`s so background loops and the
// admin API share one state value.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::bot::{Bot, BotRegistry, BotStatus};
use crate::bus::EventBus;
use crate::config::Settings;
use crate::exchange::{AdapterKey, AdapterRegistry, ExchangeAdapter, StreamHandle};
use crate::orders::{Order, OrderStore};
use crate::pipeline::SignalPipeline;
use crate::positions::{Position, PositionBook};
use crate::reconcile::reconcile_once;
use crate::risk::{KillSwitchTrigger, RiskManager};
use crate::strategy::runtime::StrategyRuntime;
use crate::strategy::Strategy;
use crate::types::MarketType;

/// Central engine state shared across all tasks via `Arc<EngineState>`.
pub struct EngineState {
    pub settings: Settings,
    pub bus: Arc<EventBus>,
    pub bots: Arc<BotRegistry>,
    pub adapters: Arc<AdapterRegistry>,
    pub risk: Arc<RiskManager>,
    pub runtime: Arc<StrategyRuntime>,
    pub pipeline: Arc<SignalPipeline>,
    pub orders: Arc<OrderStore>,
    pub positions: Arc<PositionBook>,
    pub audit: Arc<AuditLog>,

    /// Monotonically increasing version, bumped on meaningful mutations.
    pub state_version: AtomicU64,
    pub start_time: std::time::Instant,

    /// One market-stream handle per (exchange, symbol).
    market_streams: Mutex<HashMap<(String, String), StreamHandle>>,
    /// One user-data stream (plus consumer) per adapter instance.
    user_streams: Mutex<HashMap<AdapterKey, (StreamHandle, tokio::task::JoinHandle<()>)>>,
}

impl EngineState {
    /// Build the engine. Init order: bus -> risk -> registries -> pipeline.
    pub fn new(settings: Settings) -> Arc<Self> {
        let bus = Arc::new(EventBus::new("meridian-engine"));
        let risk = Arc::new(RiskManager::new(settings.default_risk_limits.clone()));
        let bots = Arc::new(BotRegistry::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let orders = Arc::new(OrderStore::new());
        let positions = Arc::new(PositionBook::new());
        let audit = Arc::new(AuditLog::new());
        let runtime = Arc::new(StrategyRuntime::new(
            bus.clone(),
            Duration::from_secs(settings.stop_grace_secs),
        ));
        let pipeline = Arc::new(SignalPipeline::new(
            bus.clone(),
            bots.clone(),
            adapters.clone(),
            risk.clone(),
            orders.clone(),
            positions.clone(),
            audit.clone(),
            runtime.clone(),
        ));

        runtime.attach();
        pipeline.attach();

        let engine = Arc::new(Self {
            settings,
            bus,
            bots,
            adapters,
            risk,
            runtime,
            pipeline,
            orders,
            positions,
            audit,
            state_version: AtomicU64::new(1),
            start_time: std::time::Instant::now(),
            market_streams: Mutex::new(HashMap::new()),
            user_streams: Mutex::new(HashMap::new()),
        });

        engine.attach_error_handler();
        engine
    }

    /// `bot.error` moves the offending bot out of the live flow.
    fn attach_error_handler(self: &Arc<Self>) {
        let engine = self.clone();
        self.bus.subscribe(
            "bot.error",
            Arc::new(move |event| {
                let engine = engine.clone();
                Box::pin(async move {
                    let Some(bot_id) = event.data["bot_id"]
                        .as_str()
                        .and_then(|s| Uuid::parse_str(s).ok())
                    else {
                        return Ok(());
                    };
                    if let Some(message) = event.data["error"].as_str() {
                        engine.bots.set_error(&bot_id, message);
                    }
                    engine.bots.set_status(&bot_id, BotStatus::Error);
                    engine.runtime.unregister_strategy(&bot_id).await;
                    engine.bump_version();
                    Ok(())
                })
            }),
        );
    }

    pub fn bump_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Adapters
    // -------------------------------------------------------------------------

    /// Register a connected adapter and start draining its user-data stream
    /// into the pipeline.
    pub async fn register_adapter(
        self: &Arc<Self>,
        key: AdapterKey,
        adapter: Arc<dyn ExchangeAdapter>,
    ) -> Result<()> {
        adapter
            .connect()
            .await
            .with_context(|| format!("failed to connect {} adapter", key.exchange))?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = adapter.clone().spawn_user_stream(tx);
        let consumer = self.pipeline.spawn_execution_consumer(rx);
        self.user_streams.lock().insert(key.clone(), (stream, consumer));
        self.adapters.insert(key.clone(), adapter);

        info!(exchange = %key.exchange, market_type = %key.market_type, "adapter registered");
        self.bump_version();
        Ok(())
    }

    fn adapter_for(&self, bot: &Bot) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(&AdapterKey {
            exchange: bot.exchange.clone(),
            credential_id: bot.credential_id,
            market_type: bot.market_type,
        })
    }

    /// Start market streams for (exchange, symbol) unless already running.
    fn ensure_market_streams(&self, bot: &Bot, adapter: Arc<dyn ExchangeAdapter>) {
        let key = (bot.exchange.clone(), bot.symbol.clone());
        let mut streams = self.market_streams.lock();
        if streams.contains_key(&key) {
            return;
        }
        let handle = adapter.spawn_market_streams(&bot.symbol, self.bus.clone());
        streams.insert(key, handle);
    }

    // -------------------------------------------------------------------------
    // Bot lifecycle (internal API for the surrounding layers)
    // -------------------------------------------------------------------------

    /// Create a bot. Strategy parameters are validated here, at creation,
    /// never at runtime.
    pub fn create_bot(&self, bot: Bot) -> Result<Uuid> {
        Strategy::from_config(&bot.strategy_id, &bot.symbol, &bot.strategy_params)
            .with_context(|| format!("invalid strategy config for bot {}", bot.id))?;
        let bot_id = bot.id;
        self.bots.insert(bot);
        self.bus.emit(
            "bot.created",
            json!({ "bot_id": bot_id.to_string() }),
            None,
        );
        self.bump_version();
        Ok(bot_id)
    }

    /// Start a bot: construct its strategy instance, register it, and open
    /// the market streams it needs.
    pub async fn start_bot(self: &Arc<Self>, bot_id: &Uuid) -> Result<()> {
        let bot = self
            .bots
            .get(bot_id)
            .ok_or_else(|| anyhow::anyhow!("unknown bot {bot_id}"))?;
        if bot.status.is_active() {
            anyhow::bail!("bot {bot_id} is already {}", bot.status);
        }

        self.bots.set_status(bot_id, BotStatus::Starting);

        let adapter = match self.adapter_for(&bot) {
            Some(adapter) => adapter,
            None => {
                self.bots.set_error(bot_id, "no adapter for bot credentials");
                self.bots.set_status(bot_id, BotStatus::Error);
                anyhow::bail!("no adapter for bot {bot_id}");
            }
        };

        let mut strategy =
            match Strategy::from_config(&bot.strategy_id, &bot.symbol, &bot.strategy_params) {
                Ok(strategy) => strategy,
                Err(e) => {
                    self.bots.set_error(bot_id, e.to_string());
                    self.bots.set_status(bot_id, BotStatus::Error);
                    self.bus.emit(
                        "bot.error",
                        json!({ "bot_id": bot_id.to_string(), "error": e.to_string() }),
                        None,
                    );
                    return Err(e.into());
                }
            };

        // The symbol's price increment comes from the adapter, once.
        match adapter.tick_size(&bot.symbol).await {
            Ok(tick_size) => strategy.set_tick_size(tick_size),
            Err(e) => warn!(bot_id = %bot_id, error = %e, "tick size unavailable — using default"),
        }

        // Futures bots prime their leverage before trading.
        if bot.market_type == MarketType::Futures {
            if let Err(e) = adapter.set_leverage(&bot.symbol, bot.leverage).await {
                warn!(bot_id = %bot_id, error = %e, "failed to set leverage");
            }
        }

        self.ensure_market_streams(&bot, adapter);
        self.runtime.register_strategy(*bot_id, strategy);
        self.bots.set_status(bot_id, BotStatus::Running);
        self.bus.emit(
            "bot.started",
            json!({
                "bot_id": bot_id.to_string(),
                "symbol": bot.symbol,
                "strategy": bot.strategy_id,
            }),
            None,
        );
        self.bump_version();
        info!(bot_id = %bot_id, symbol = %bot.symbol, "bot started");
        Ok(())
    }

    /// Stop a bot: drain in-flight work within the grace period, then
    /// deregister the strategy instance.
    pub async fn stop_bot(self: &Arc<Self>, bot_id: &Uuid) -> Result<()> {
        let bot = self
            .bots
            .get(bot_id)
            .ok_or_else(|| anyhow::anyhow!("unknown bot {bot_id}"))?;
        if !bot.status.is_active() {
            anyhow::bail!("bot {bot_id} is not running");
        }

        // Signals not yet validated are dropped from here on.
        self.bots.set_status(bot_id, BotStatus::Stopping);
        self.runtime.unregister_strategy(bot_id).await;
        self.bots.set_status(bot_id, BotStatus::Stopped);
        self.bus.emit(
            "bot.stopped",
            json!({ "bot_id": bot_id.to_string() }),
            None,
        );
        self.bump_version();
        info!(bot_id = %bot_id, "bot stopped");
        Ok(())
    }

    /// Cancel an order via the pipeline (internal API passthrough).
    pub async fn cancel_order(&self, order_id: &Uuid) -> Result<Order> {
        let order = self.pipeline.cancel_order(order_id).await?;
        self.bump_version();
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    /// Evaluate kill-switch conditions for one user and, on activation,
    /// publish `risk.kill_switch` and move the user's bots to `killed`.
    pub async fn evaluate_kill_switch(
        self: &Arc<Self>,
        user_id: Uuid,
        portfolio_value: f64,
        exchange_healthy: bool,
    ) {
        let engine = self.risk.engine_for(user_id);
        let event = {
            let mut engine = engine.lock();
            engine.observe_equity(Utc::now(), portfolio_value);
            engine.calculate_portfolio_risk(portfolio_value);
            engine.check_kill_conditions(portfolio_value, exchange_healthy)
        };

        let Some(event) = event else { return };
        error!(
            user_id = %user_id,
            trigger = %event.trigger,
            reason = %event.reason,
            "kill switch activated"
        );
        self.bus.emit(
            "risk.kill_switch",
            json!({
                "user_id": user_id.to_string(),
                "trigger": event.trigger,
                "reason": event.reason,
            }),
            None,
        );

        for bot in self.bots.all() {
            if bot.user_id == user_id && bot.status.is_active() {
                self.bots.set_status(&bot.id, BotStatus::Killed);
                self.runtime.unregister_strategy(&bot.id).await;
            }
        }
        self.bump_version();
    }

    /// Manual trigger (admin API).
    pub async fn trigger_kill_switch(self: &Arc<Self>, user_id: Uuid, reason: &str) {
        let engine = self.risk.engine_for(user_id);
        let event = engine.lock().kill_switch_mut().activate(
            KillSwitchTrigger::Manual,
            reason,
            Vec::new(),
        );
        self.bus.emit(
            "risk.kill_switch",
            json!({
                "user_id": user_id.to_string(),
                "trigger": event.trigger,
                "reason": event.reason,
            }),
            None,
        );
        for bot in self.bots.all() {
            if bot.user_id == user_id && bot.status.is_active() {
                self.bots.set_status(&bot.id, BotStatus::Killed);
                self.runtime.unregister_strategy(&bot.id).await;
            }
        }
        self.bump_version();
    }

    /// Explicit reset with a confirmation code (admin API).
    pub fn reset_kill_switch(&self, user_id: Uuid, confirmation_code: &str) -> Result<()> {
        let engine = self.risk.engine_for(user_id);
        engine
            .lock()
            .kill_switch_mut()
            .deactivate(confirmation_code)?;
        self.bump_version();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------------

    /// Periodic reconciliation over every registered adapter, plus the
    /// kill-switch sweep driven by fresh balance data.
    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let period = Duration::from_secs(engine.settings.reconcile_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                engine.reconcile_all().await;
            }
        })
    }

    /// One reconciliation sweep across all adapters.
    pub async fn reconcile_all(self: &Arc<Self>) {
        for key in self.adapters.keys() {
            let Some(adapter) = self.adapters.get(&key) else {
                continue;
            };

            let healthy = match reconcile_once(
                &key,
                &adapter,
                &self.bots,
                &self.orders,
                &self.positions,
                &self.bus,
            )
            .await
            {
                Ok(summary) => {
                    if !summary.is_clean() {
                        self.bump_version();
                    }
                    true
                }
                Err(e) => {
                    warn!(exchange = %key.exchange, error = %e, "reconciliation failed");
                    false
                }
            };

            // Kill-switch sweep for every user trading through this adapter.
            let balances = adapter.get_balances().await.unwrap_or_default();
            let mut seen_users = std::collections::HashSet::new();
            for bot in self.bots.by_credential(&key.credential_id) {
                if !seen_users.insert(bot.user_id) {
                    continue;
                }
                let equity = balances
                    .iter()
                    .find(|b| b.asset == bot.quote_asset)
                    .map(|b| b.total)
                    .unwrap_or(0.0);
                if equity > 0.0 {
                    self.bots.update_balance_watermark(&bot.id, equity);
                }
                if equity > 0.0 || !healthy {
                    self.evaluate_kill_switch(bot.user_id, equity, healthy).await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Serialisable view of the whole engine for the admin API.
    pub fn build_snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state_version: self.current_version(),
            server_time: Utc::now().timestamp_millis(),
            environment: self.settings.environment.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            active_strategies: self.runtime.active_count(),
            adapters: self.adapters.len(),
            bus_subscriptions: self.bus.subscription_count(),
            bots: self.bots.all(),
            open_positions: self.positions.open_positions(),
            active_orders: self.orders.active_orders(),
            recent_audit: self.audit.recent(50),
        }
    }

    /// Stop everything in reverse init order.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("engine shutting down");
        for bot in self.bots.all() {
            if bot.status.is_active() {
                let _ = self.stop_bot(&bot.id).await;
            }
        }
        for (_, handle) in self.market_streams.lock().drain() {
            handle.abort();
        }
        for (_, (stream, consumer)) in self.user_streams.lock().drain() {
            stream.abort();
            consumer.abort();
        }
        self.pipeline.detach();
        self.runtime.detach();
        for key in self.adapters.keys() {
            if let Some(adapter) = self.adapters.remove(&key) {
                let _ = adapter.disconnect().await;
            }
        }
        info!("engine shut down complete");
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("bots", &self.bots)
            .field("adapters", &self.adapters)
            .field("runtime", &self.runtime)
            .finish()
    }
}

/// Full engine snapshot returned by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub environment: String,
    pub uptime_secs: u64,
    pub active_strategies: usize,
    pub adapters: usize,
    pub bus_subscriptions: usize,
    pub bots: Vec<Bot>,
    pub open_positions: Vec<Position>,
    pub active_orders: Vec<Order>,
    pub recent_audit: Vec<AuditEntry>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    fn engine() -> Arc<EngineState> {
        EngineState::new(Settings::default())
    }

    fn sample_bot(strategy_id: &str, params: serde_json::Value) -> Bot {
        let mut bot = Bot::new(
            Uuid::new_v4(),
            "t",
            "binance",
            Uuid::new_v4(),
            "BTCUSDT",
            "USDT",
            MarketType::Spot,
            strategy_id,
            params,
            100.0,
        );
        bot.max_positions = 1;
        bot
    }

    #[tokio::test]
    async fn create_bot_validates_strategy_params() {
        let engine = engine();

        // Bad grid params are refused at creation, never at runtime.
        let bad = sample_bot(
            "grid",
            serde_json::json!({ "upper_price": 90.0, "lower_price": 100.0,
                                "grid_count": 10, "order_size": 1.0 }),
        );
        assert!(engine.create_bot(bad).is_err());

        let good = sample_bot(
            "grid",
            serde_json::json!({ "upper_price": 110.0, "lower_price": 100.0,
                                "grid_count": 10, "order_size": 1.0 }),
        );
        assert!(engine.create_bot(good).is_ok());
    }

    #[tokio::test]
    async fn start_without_adapter_moves_bot_to_error() {
        let engine = engine();
        let bot = sample_bot(
            "dca",
            serde_json::json!({ "base_order_size": 100.0, "safety_order_size": 100.0 }),
        );
        let bot_id = engine.create_bot(bot).unwrap();

        assert!(engine.start_bot(&bot_id).await.is_err());
        assert_eq!(engine.bots.get(&bot_id).unwrap().status, BotStatus::Error);
    }

    #[tokio::test]
    async fn manual_kill_switch_kills_active_bots_and_blocks_validation() {
        let engine = engine();
        let user_id = Uuid::new_v4();

        engine.trigger_kill_switch(user_id, "operator stop").await;

        let risk_engine = engine.risk.engine_for(user_id);
        let validation = risk_engine.lock().validate_order(
            "BTCUSDT",
            crate::types::PositionSide::Long,
            0.001,
            100.0,
            1.0,
            1_000_000.0,
        );
        assert!(!validation.valid);

        // Reset requires a confirmation code.
        assert!(engine.reset_kill_switch(user_id, "").is_err());
        assert!(engine.reset_kill_switch(user_id, "CONFIRM").is_ok());
    }

    #[tokio::test]
    async fn snapshot_reflects_state_version() {
        let engine = engine();
        let v0 = engine.current_version();
        let bot = sample_bot(
            "dca",
            serde_json::json!({ "base_order_size": 100.0, "safety_order_size": 100.0 }),
        );
        engine.create_bot(bot).unwrap();

        let snapshot = engine.build_snapshot();
        assert!(snapshot.state_version > v0);
        assert_eq!(snapshot.bots.len(), 1);
        assert_eq!(snapshot.active_strategies, 0);
    }
}
