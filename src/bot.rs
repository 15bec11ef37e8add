// =============================================================================
// Bot Model — user-owned trading configuration and its status machine
// =============================================================================
//
// A bot pairs a symbol with a strategy on one exchange account. Configuration
// is mutable only while the bot is not running; deletion is soft (the record
// is retained and marked). Performance counters accumulate over the bot's
// lifetime.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::types::MarketType;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Bot lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
    Killed,
}

impl BotStatus {
    /// Whether the bot is participating in the live event flow.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// How `position_size` is interpreted when a signal carries no quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSizeType {
    /// Fixed amount of quote currency per order.
    Fixed,
    /// Percentage of current portfolio value per order.
    Percent,
}

impl Default for PositionSizeType {
    fn default() -> Self {
        Self::Fixed
    }
}

// ---------------------------------------------------------------------------
// Bot
// ---------------------------------------------------------------------------

/// Per-bot risk overrides layered over the user's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotRiskOverrides {
    #[serde(default)]
    pub max_drawdown_percent: Option<f64>,
    #[serde(default)]
    pub stop_loss_percent: Option<f64>,
    #[serde(default)]
    pub take_profit_percent: Option<f64>,
    #[serde(default)]
    pub trailing_stop_percent: Option<f64>,
}

/// Lifetime performance counters for a bot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotPerformance {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_pnl: f64,
    pub total_fees: f64,
    pub peak_balance: f64,
    pub current_drawdown: f64,
    pub max_drawdown_reached: f64,
}

/// A user-owned trading bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,

    // Exchange account
    pub exchange: String,
    pub credential_id: Uuid,
    pub market_type: MarketType,

    // Trading pair
    pub symbol: String,
    pub quote_asset: String,

    // Strategy
    pub strategy_id: String,
    #[serde(default)]
    pub strategy_params: serde_json::Value,

    // Sizing
    pub position_size: f64,
    #[serde(default)]
    pub position_size_type: PositionSizeType,
    pub max_positions: u32,

    // Futures
    pub leverage: u32,
    pub margin_type: String,

    // Risk
    #[serde(default)]
    pub risk_overrides: BotRiskOverrides,

    // Status
    pub status: BotStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,

    // Performance
    #[serde(default)]
    pub performance: BotPerformance,

    // Timing
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_signal_at: Option<DateTime<Utc>>,

    // Soft delete
    #[serde(default)]
    pub deleted: bool,
}

impl Bot {
    /// Construct a bot in `Created` status with zeroed counters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: Uuid,
        name: impl Into<String>,
        exchange: impl Into<String>,
        credential_id: Uuid,
        symbol: impl Into<String>,
        quote_asset: impl Into<String>,
        market_type: MarketType,
        strategy_id: impl Into<String>,
        strategy_params: serde_json::Value,
        position_size: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            exchange: exchange.into(),
            credential_id,
            market_type,
            symbol: symbol.into(),
            quote_asset: quote_asset.into(),
            strategy_id: strategy_id.into(),
            strategy_params,
            position_size,
            position_size_type: PositionSizeType::Fixed,
            max_positions: 1,
            leverage: 1,
            margin_type: "cross".to_string(),
            risk_overrides: BotRiskOverrides::default(),
            status: BotStatus::Created,
            status_message: None,
            last_error: None,
            performance: BotPerformance::default(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_signal_at: None,
            deleted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Thread-safe bot store. All reads return snapshot copies by value.
pub struct BotRegistry {
    bots: RwLock<HashMap<Uuid, Bot>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self {
            bots: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new bot.
    pub fn insert(&self, bot: Bot) {
        info!(bot_id = %bot.id, symbol = %bot.symbol, strategy = %bot.strategy_id, "bot registered");
        self.bots.write().insert(bot.id, bot);
    }

    /// Snapshot of a single bot.
    pub fn get(&self, bot_id: &Uuid) -> Option<Bot> {
        self.bots.read().get(bot_id).cloned()
    }

    /// Snapshot of all non-deleted bots.
    pub fn all(&self) -> Vec<Bot> {
        self.bots
            .read()
            .values()
            .filter(|b| !b.deleted)
            .cloned()
            .collect()
    }

    /// Snapshot of all bots using `credential_id`.
    pub fn by_credential(&self, credential_id: &Uuid) -> Vec<Bot> {
        self.bots
            .read()
            .values()
            .filter(|b| !b.deleted && b.credential_id == *credential_id)
            .cloned()
            .collect()
    }

    /// Transition a bot's status and stamp the matching timestamp.
    ///
    /// Returns the previous status, or `None` if the bot is unknown.
    pub fn set_status(&self, bot_id: &Uuid, status: BotStatus) -> Option<BotStatus> {
        let mut bots = self.bots.write();
        let bot = bots.get_mut(bot_id)?;
        let previous = bot.status;
        bot.status = status;
        match status {
            BotStatus::Running => bot.started_at = Some(Utc::now()),
            BotStatus::Stopped | BotStatus::Error | BotStatus::Killed => {
                bot.stopped_at = Some(Utc::now())
            }
            _ => {}
        }
        info!(bot_id = %bot_id, from = %previous, to = %status, "bot status changed");
        Some(previous)
    }

    /// Record an error message against a bot.
    pub fn set_error(&self, bot_id: &Uuid, message: impl Into<String>) {
        let mut bots = self.bots.write();
        if let Some(bot) = bots.get_mut(bot_id) {
            bot.last_error = Some(message.into());
        }
    }

    /// Stamp the last-signal timestamp.
    pub fn touch_signal(&self, bot_id: &Uuid) {
        let mut bots = self.bots.write();
        if let Some(bot) = bots.get_mut(bot_id) {
            bot.last_signal_at = Some(Utc::now());
        }
    }

    /// Accumulate a closed trade into the bot's performance counters.
    pub fn record_trade_result(&self, bot_id: &Uuid, realized_pnl: f64, fees: f64) {
        let mut bots = self.bots.write();
        if let Some(bot) = bots.get_mut(bot_id) {
            let perf = &mut bot.performance;
            perf.total_trades += 1;
            if realized_pnl >= 0.0 {
                perf.winning_trades += 1;
            } else {
                perf.losing_trades += 1;
            }
            perf.total_pnl += realized_pnl;
            perf.total_fees += fees;
        }
    }

    /// Track the balance high-water mark and current drawdown for a bot.
    pub fn update_balance_watermark(&self, bot_id: &Uuid, balance: f64) {
        let mut bots = self.bots.write();
        if let Some(bot) = bots.get_mut(bot_id) {
            let perf = &mut bot.performance;
            if balance > perf.peak_balance {
                perf.peak_balance = balance;
            }
            if perf.peak_balance > 0.0 {
                perf.current_drawdown =
                    ((perf.peak_balance - balance) / perf.peak_balance) * 100.0;
                if perf.current_drawdown > perf.max_drawdown_reached {
                    perf.max_drawdown_reached = perf.current_drawdown;
                }
            }
        }
    }

    /// Soft-delete a bot: retained, marked, excluded from listings.
    pub fn soft_delete(&self, bot_id: &Uuid) -> bool {
        let mut bots = self.bots.write();
        match bots.get_mut(bot_id) {
            Some(bot) => {
                bot.deleted = true;
                true
            }
            None => false,
        }
    }
}

impl Default for BotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotRegistry")
            .field("bots", &self.bots.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bot() -> Bot {
        Bot::new(
            Uuid::new_v4(),
            "grid-btc",
            "binance",
            Uuid::new_v4(),
            "BTCUSDT",
            "USDT",
            MarketType::Spot,
            "grid",
            serde_json::json!({}),
            100.0,
        )
    }

    #[test]
    fn new_bot_starts_created() {
        let bot = sample_bot();
        assert_eq!(bot.status, BotStatus::Created);
        assert!(bot.started_at.is_none());
        assert!(!bot.deleted);
    }

    #[test]
    fn status_transition_stamps_timestamps() {
        let registry = BotRegistry::new();
        let bot = sample_bot();
        let id = bot.id;
        registry.insert(bot);

        assert_eq!(
            registry.set_status(&id, BotStatus::Running),
            Some(BotStatus::Created)
        );
        assert!(registry.get(&id).unwrap().started_at.is_some());

        registry.set_status(&id, BotStatus::Stopped);
        assert!(registry.get(&id).unwrap().stopped_at.is_some());
    }

    #[test]
    fn soft_delete_hides_from_listing_but_keeps_record() {
        let registry = BotRegistry::new();
        let bot = sample_bot();
        let id = bot.id;
        registry.insert(bot);

        assert!(registry.soft_delete(&id));
        assert!(registry.all().is_empty());
        assert!(registry.get(&id).is_some());
    }

    #[test]
    fn trade_results_accumulate() {
        let registry = BotRegistry::new();
        let bot = sample_bot();
        let id = bot.id;
        registry.insert(bot);

        registry.record_trade_result(&id, 10.0, 0.1);
        registry.record_trade_result(&id, -4.0, 0.1);

        let perf = registry.get(&id).unwrap().performance;
        assert_eq!(perf.total_trades, 2);
        assert_eq!(perf.winning_trades, 1);
        assert_eq!(perf.losing_trades, 1);
        assert!((perf.total_pnl - 6.0).abs() < 1e-12);
        assert!((perf.total_fees - 0.2).abs() < 1e-12);
    }

    #[test]
    fn balance_watermark_tracks_drawdown() {
        let registry = BotRegistry::new();
        let bot = sample_bot();
        let id = bot.id;
        registry.insert(bot);

        registry.update_balance_watermark(&id, 1000.0);
        registry.update_balance_watermark(&id, 900.0);
        let perf = registry.get(&id).unwrap().performance;
        assert!((perf.peak_balance - 1000.0).abs() < 1e-12);
        assert!((perf.current_drawdown - 10.0).abs() < 1e-9);

        // Peak never regresses.
        registry.update_balance_watermark(&id, 950.0);
        let perf = registry.get(&id).unwrap().performance;
        assert!((perf.peak_balance - 1000.0).abs() < 1e-12);
        assert!((perf.max_drawdown_reached - 10.0).abs() < 1e-9);
    }

    #[test]
    fn credential_lookup_finds_all_bots_on_key() {
        let registry = BotRegistry::new();
        let cred = Uuid::new_v4();
        let mut a = sample_bot();
        a.credential_id = cred;
        let mut b = sample_bot();
        b.credential_id = cred;
        registry.insert(a);
        registry.insert(b);
        registry.insert(sample_bot());

        assert_eq!(registry.by_credential(&cred).len(), 2);
    }
}
