// =============================================================================
// Strategy Layer — signal types and the strategy variant set
// =============================================================================
//
// Strategies are a closed variant set over a shared capability surface:
// `on_tick`, `on_candle`, `on_orderbook` (hot, market-driven) and
// `on_order_filled`, `on_position_update` (cold, pipeline-driven), plus
// `initialize` / `cleanup` / `validate_params`. New strategies are new
// variants; there is no deep hierarchy.
//
// Callbacks are synchronous and never perform I/O. All I/O belongs to the
// pipeline and adapters.
// =============================================================================

pub mod dca;
pub mod grid;
pub mod runtime;
pub mod scalping;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Candle, Orderbook, Ticker};

pub use dca::DcaStrategy;
pub use grid::GridStrategy;
pub use scalping::ScalpingStrategy;

/// Bounded candle history kept per strategy instance.
const CANDLE_RING_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// The strategy's intent for the bot's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Buy,
    Sell,
    CloseLong,
    CloseShort,
    Hold,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
            Self::Hold => "hold",
        };
        write!(f, "{s}")
    }
}

/// Immutable, short-lived trading signal emitted by a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub quantity: Option<f64>,
    /// In `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub indicators: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

fn default_confidence() -> f64 {
    1.0
}

impl Signal {
    pub fn new(signal_type: SignalType, symbol: impl Into<String>, price: f64) -> Self {
        Self {
            signal_type,
            symbol: symbol.into(),
            price,
            quantity: None,
            confidence: 1.0,
            reason: String::new(),
            stop_loss: None,
            take_profit: None,
            indicators: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_indicators(mut self, indicators: serde_json::Value) -> Self {
        self.indicators = indicators;
        self
    }
}

// ---------------------------------------------------------------------------
// Pipeline -> strategy notifications
// ---------------------------------------------------------------------------

/// Fill details handed back to the owning strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyFill {
    pub symbol: String,
    pub quantity: f64,
    pub price: f64,
}

/// Position snapshot handed back to the owning strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPosition {
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown strategy type: {0}")]
    UnknownStrategy(String),

    #[error("invalid strategy params: {0}")]
    InvalidParams(String),
}

// ---------------------------------------------------------------------------
// Shared instance state
// ---------------------------------------------------------------------------

/// State common to every strategy instance.
#[derive(Debug, Clone)]
pub struct StrategyCore {
    pub symbol: String,
    pub current_price: f64,
    pub candles: VecDeque<Candle>,
    pub orderbook: Option<Orderbook>,
    pub position_size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub is_running: bool,
}

impl StrategyCore {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            current_price: 0.0,
            candles: VecDeque::with_capacity(CANDLE_RING_CAPACITY),
            orderbook: None,
            position_size: 0.0,
            entry_price: 0.0,
            unrealized_pnl: 0.0,
            is_running: false,
        }
    }

    pub fn has_position(&self) -> bool {
        self.position_size != 0.0
    }

    /// Append to the bounded candle ring, evicting the oldest.
    pub fn push_candle(&mut self, candle: Candle) {
        if self.candles.len() == CANDLE_RING_CAPACITY {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
    }

    pub fn apply_position(&mut self, update: &StrategyPosition) {
        self.position_size = update.quantity;
        self.entry_price = update.entry_price;
        self.unrealized_pnl = update.unrealized_pnl;
    }
}

// ---------------------------------------------------------------------------
// Param helpers
// ---------------------------------------------------------------------------

pub(crate) fn required_f64(params: &serde_json::Value, key: &str) -> Result<f64, StrategyError> {
    params[key]
        .as_f64()
        .ok_or_else(|| StrategyError::InvalidParams(format!("missing required param '{key}'")))
}

pub(crate) fn optional_f64(params: &serde_json::Value, key: &str, default: f64) -> f64 {
    params[key].as_f64().unwrap_or(default)
}

pub(crate) fn optional_u32(params: &serde_json::Value, key: &str, default: u32) -> u32 {
    params[key].as_u64().map(|v| v as u32).unwrap_or(default)
}

pub(crate) fn optional_bool(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params[key].as_bool().unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Variant set
// ---------------------------------------------------------------------------

/// The strategy variant set. Dispatch is a plain match; every variant shares
/// the same capability surface.
#[derive(Debug, Clone)]
pub enum Strategy {
    Grid(GridStrategy),
    Dca(DcaStrategy),
    Scalping(ScalpingStrategy),
}

impl Strategy {
    /// Construct a strategy from `(type, symbol, params)`. Parameter
    /// validation happens here, at bot creation, never at runtime.
    pub fn from_config(
        kind: &str,
        symbol: &str,
        params: &serde_json::Value,
    ) -> Result<Self, StrategyError> {
        let strategy = match kind {
            "grid" | "grid_trading" => Self::Grid(GridStrategy::from_params(symbol, params)?),
            "dca" => Self::Dca(DcaStrategy::from_params(symbol, params)?),
            "scalping" => Self::Scalping(ScalpingStrategy::from_params(symbol, params)?),
            other => return Err(StrategyError::UnknownStrategy(other.to_string())),
        };
        strategy.validate_params()?;
        Ok(strategy)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Grid(_) => "grid",
            Self::Dca(_) => "dca",
            Self::Scalping(_) => "scalping",
        }
    }

    fn core(&self) -> &StrategyCore {
        match self {
            Self::Grid(s) => &s.core,
            Self::Dca(s) => &s.core,
            Self::Scalping(s) => &s.core,
        }
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        match self {
            Self::Grid(s) => &mut s.core,
            Self::Dca(s) => &mut s.core,
            Self::Scalping(s) => &mut s.core,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.core().symbol
    }

    pub fn validate_params(&self) -> Result<(), StrategyError> {
        match self {
            Self::Grid(s) => s.validate_params(),
            Self::Dca(s) => s.validate_params(),
            Self::Scalping(s) => s.validate_params(),
        }
    }

    /// Build derived state (ladders, grids) and mark the instance running.
    pub fn initialize(&mut self) {
        match self {
            Self::Grid(s) => s.initialize(),
            Self::Dca(s) => s.initialize(),
            Self::Scalping(s) => s.initialize(),
        }
        self.core_mut().is_running = true;
    }

    pub fn cleanup(&mut self) {
        self.core_mut().is_running = false;
    }

    pub fn on_tick(&mut self, tick: &Ticker) -> Option<Signal> {
        match self {
            Self::Grid(s) => s.on_tick(tick),
            Self::Dca(s) => s.on_tick(tick),
            Self::Scalping(s) => s.on_tick(tick),
        }
    }

    /// Appends to the bounded candle ring before any strategy logic runs.
    pub fn on_candle(&mut self, candle: Candle) -> Option<Signal> {
        self.core_mut().push_candle(candle);
        None
    }

    /// Replaces the instance's current orderbook snapshot.
    pub fn on_orderbook(&mut self, orderbook: Orderbook) -> Option<Signal> {
        match self {
            Self::Scalping(s) => s.on_orderbook(orderbook),
            _ => {
                self.core_mut().orderbook = Some(orderbook);
                None
            }
        }
    }

    pub fn on_order_filled(&mut self, fill: &StrategyFill) {
        match self {
            Self::Dca(s) => s.on_order_filled(fill),
            Self::Grid(_) | Self::Scalping(_) => {}
        }
    }

    pub fn on_position_update(&mut self, update: &StrategyPosition) {
        self.core_mut().apply_position(update);
    }

    /// Inject the symbol's minimum price increment (obtained once per symbol
    /// from the adapter).
    pub fn set_tick_size(&mut self, tick_size: f64) {
        if let Self::Scalping(s) = self {
            s.set_tick_size(tick_size);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_kind_is_refused() {
        let err = Strategy::from_config("martingale", "BTCUSDT", &serde_json::json!({}));
        assert!(matches!(err, Err(StrategyError::UnknownStrategy(_))));
    }

    #[test]
    fn from_config_builds_each_variant() {
        let grid = Strategy::from_config(
            "grid",
            "BTCUSDT",
            &serde_json::json!({
                "upper_price": 110.0, "lower_price": 100.0,
                "grid_count": 10, "order_size": 1.0
            }),
        )
        .unwrap();
        assert_eq!(grid.kind(), "grid");

        let dca = Strategy::from_config(
            "dca",
            "ETHUSDT",
            &serde_json::json!({ "base_order_size": 100.0, "safety_order_size": 100.0 }),
        )
        .unwrap();
        assert_eq!(dca.kind(), "dca");

        let scalping = Strategy::from_config(
            "scalping",
            "BNBUSDT",
            &serde_json::json!({
                "spread_threshold": 0.05, "take_profit_ticks": 10.0, "stop_loss_ticks": 5.0
            }),
        )
        .unwrap();
        assert_eq!(scalping.kind(), "scalping");
    }

    #[test]
    fn candle_ring_is_bounded() {
        let mut strategy = Strategy::from_config(
            "dca",
            "BTCUSDT",
            &serde_json::json!({ "base_order_size": 100.0, "safety_order_size": 100.0 }),
        )
        .unwrap();

        let candle = Candle {
            open_time: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
            close_time: 0,
            is_closed: true,
        };
        for i in 0..(CANDLE_RING_CAPACITY + 50) {
            let mut c = candle;
            c.open_time = i as i64;
            strategy.on_candle(c);
        }
        let core = strategy.core();
        assert_eq!(core.candles.len(), CANDLE_RING_CAPACITY);
        assert_eq!(core.candles.front().unwrap().open_time, 50);
    }

    #[test]
    fn position_update_flows_into_core() {
        let mut strategy = Strategy::from_config(
            "dca",
            "BTCUSDT",
            &serde_json::json!({ "base_order_size": 100.0, "safety_order_size": 100.0 }),
        )
        .unwrap();
        strategy.on_position_update(&StrategyPosition {
            quantity: 2.0,
            entry_price: 100.0,
            unrealized_pnl: 4.0,
        });
        assert!(strategy.core().has_position());
        assert!((strategy.core().entry_price - 100.0).abs() < 1e-12);
    }
}
