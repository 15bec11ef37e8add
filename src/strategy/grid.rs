// =============================================================================
// Grid Strategy — ladder of alternating buy/sell levels in a price range
// =============================================================================
//
// A grid of `grid_count + 1` levels spans [lower_price, upper_price], spaced
// arithmetically (equal steps) or geometrically (equal ratios). Every level
// starts with buy intent and holds at most one outstanding position: a fill
// flips the level's intent, so a bought level waits to sell and a sold level
// waits to buy again.
//
// Each tick fires at most one signal: the first level the price path since
// the previous in-range tick crosses in that level's trigger direction. Ticks
// outside the range mutate nothing; if `trigger_price` is set the grid lies
// dormant until price first reaches it.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::strategy::{required_f64, Signal, SignalType, StrategyCore, StrategyError};
use crate::types::{OrderSide, Ticker};

/// Level spacing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridType {
    Arithmetic,
    Geometric,
}

/// A single grid level and its current intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    pub side: OrderSide,
}

#[derive(Debug, Clone)]
pub struct GridStrategy {
    pub(crate) core: StrategyCore,

    grid_type: GridType,
    upper_price: f64,
    lower_price: f64,
    grid_count: u32,
    order_size: f64,
    trigger_price: Option<f64>,

    levels: Vec<GridLevel>,
    active: bool,
    /// Last in-range price; anchors path-crossing detection.
    last_price: Option<f64>,
}

impl GridStrategy {
    pub fn from_params(symbol: &str, params: &serde_json::Value) -> Result<Self, StrategyError> {
        let grid_type = match params["grid_type"].as_str() {
            Some("geometric") => GridType::Geometric,
            _ => GridType::Arithmetic,
        };

        Ok(Self {
            core: StrategyCore::new(symbol),
            grid_type,
            upper_price: required_f64(params, "upper_price")?,
            lower_price: required_f64(params, "lower_price")?,
            grid_count: params["grid_count"].as_u64().unwrap_or(0) as u32,
            order_size: required_f64(params, "order_size")?,
            trigger_price: params["trigger_price"].as_f64(),
            levels: Vec::new(),
            active: false,
            last_price: None,
        })
    }

    pub fn validate_params(&self) -> Result<(), StrategyError> {
        if self.upper_price <= self.lower_price {
            return Err(StrategyError::InvalidParams(
                "upper_price must exceed lower_price".into(),
            ));
        }
        if self.grid_count < 2 {
            return Err(StrategyError::InvalidParams(
                "grid_count must be at least 2".into(),
            ));
        }
        if self.order_size <= 0.0 {
            return Err(StrategyError::InvalidParams(
                "order_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Build the ladder. Arithmetic: equal linear steps. Geometric: constant
    /// ratio `(upper/lower)^(1/grid_count)`.
    pub fn initialize(&mut self) {
        self.levels.clear();
        let n = self.grid_count as usize;
        match self.grid_type {
            GridType::Arithmetic => {
                let step = (self.upper_price - self.lower_price) / self.grid_count as f64;
                for i in 0..=n {
                    self.levels.push(GridLevel {
                        price: self.lower_price + step * i as f64,
                        side: OrderSide::Buy,
                    });
                }
            }
            GridType::Geometric => {
                let ratio =
                    (self.upper_price / self.lower_price).powf(1.0 / self.grid_count as f64);
                for i in 0..=n {
                    self.levels.push(GridLevel {
                        price: self.lower_price * ratio.powi(i as i32),
                        side: OrderSide::Buy,
                    });
                }
            }
        }
        self.active = false;
        self.last_price = None;
        debug!(
            symbol = %self.core.symbol,
            levels = self.levels.len(),
            grid_type = ?self.grid_type,
            "grid built"
        );
    }

    /// Current levels, for snapshots and tests.
    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn on_tick(&mut self, tick: &Ticker) -> Option<Signal> {
        let price = tick.price;
        if price <= 0.0 {
            return None;
        }
        self.core.current_price = price;

        // Dormant until price first reaches the trigger.
        if !self.active {
            match self.trigger_price {
                Some(trigger) if price < trigger => return None,
                _ => self.active = true,
            }
        }

        // Outside the range: silent no-op, path anchor untouched.
        if price < self.lower_price || price > self.upper_price {
            return None;
        }

        let prev = self.last_price.replace(price);
        let fired = match prev {
            // First in-range tick: take the lowest buy level at or above
            // price (initial inventory entry).
            None => self
                .levels
                .iter_mut()
                .find(|level| level.side == OrderSide::Buy && price <= level.price),
            Some(prev) if price > prev => {
                // Rising path: levels crossed in (prev, price], lowest first.
                self.levels.iter_mut().find(|level| {
                    level.price > prev
                        && level.price <= price
                        && match level.side {
                            OrderSide::Sell => price >= level.price,
                            OrderSide::Buy => price <= level.price,
                        }
                })
            }
            Some(prev) if price < prev => {
                // Falling path: levels crossed in [price, prev), highest first.
                self.levels.iter_mut().rev().find(|level| {
                    level.price < prev
                        && level.price >= price
                        && match level.side {
                            OrderSide::Buy => price <= level.price,
                            OrderSide::Sell => price >= level.price,
                        }
                })
            }
            Some(_) => None,
        }?;

        let level_price = fired.price;
        let signal_type = match fired.side {
            OrderSide::Buy => SignalType::Buy,
            OrderSide::Sell => SignalType::Sell,
        };
        // The fill flips the level's intent.
        fired.side = fired.side.opposite();

        let verb = match signal_type {
            SignalType::Buy => "buy",
            _ => "sell",
        };
        Some(
            Signal::new(signal_type, self.core.symbol.clone(), level_price)
                .with_quantity(self.order_size)
                .with_reason(format!("Grid {verb} at {level_price}"))
                .with_indicators(json!({ "grid_level": level_price })),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tick(price: f64) -> Ticker {
        Ticker {
            symbol: "BTCUSDT".into(),
            price,
            bid: price,
            ask: price,
            volume_24h: 0.0,
            change_24h: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn grid(params: serde_json::Value) -> GridStrategy {
        let mut strategy = GridStrategy::from_params("BTCUSDT", &params).unwrap();
        strategy.validate_params().unwrap();
        strategy.initialize();
        strategy
    }

    fn default_grid() -> GridStrategy {
        grid(serde_json::json!({
            "upper_price": 110.0,
            "lower_price": 100.0,
            "grid_count": 10,
            "order_size": 1.0,
        }))
    }

    #[test]
    fn arithmetic_levels_are_evenly_spaced() {
        let strategy = default_grid();
        let levels = strategy.levels();
        assert_eq!(levels.len(), 11);
        for (i, level) in levels.iter().enumerate() {
            assert!((level.price - (100.0 + i as f64)).abs() < 1e-9);
            assert_eq!(level.side, OrderSide::Buy);
        }
    }

    #[test]
    fn geometric_levels_share_a_constant_ratio() {
        let strategy = grid(serde_json::json!({
            "grid_type": "geometric",
            "upper_price": 200.0,
            "lower_price": 100.0,
            "grid_count": 4,
            "order_size": 1.0,
        }));
        let levels = strategy.levels();
        assert_eq!(levels.len(), 5);
        assert!((levels[0].price - 100.0).abs() < 1e-9);
        assert!((levels[4].price - 200.0).abs() < 1e-6);
        let ratio = levels[1].price / levels[0].price;
        for pair in levels.windows(2) {
            assert!((pair[1].price / pair[0].price - ratio).abs() < 1e-9);
        }
    }

    #[test]
    fn validate_rejects_inverted_range_and_tiny_grid() {
        let bad = GridStrategy::from_params(
            "BTCUSDT",
            &serde_json::json!({
                "upper_price": 100.0, "lower_price": 110.0,
                "grid_count": 10, "order_size": 1.0
            }),
        )
        .unwrap();
        assert!(bad.validate_params().is_err());

        let bad = GridStrategy::from_params(
            "BTCUSDT",
            &serde_json::json!({
                "upper_price": 110.0, "lower_price": 100.0,
                "grid_count": 1, "order_size": 1.0
            }),
        )
        .unwrap();
        assert!(bad.validate_params().is_err());
    }

    #[test]
    fn happy_path_tick_sequence() {
        // Ticks 100, 101, 102, 99, 101, 103: buys on the way down the fresh
        // grid, sells when price returns up through bought levels.
        let mut strategy = default_grid();
        let mut signals = Vec::new();
        for price in [100.0, 101.0, 102.0, 99.0, 101.0, 103.0] {
            if let Some(signal) = strategy.on_tick(&tick(price)) {
                signals.push((signal.signal_type, signal.price));
            }
        }
        assert_eq!(
            signals,
            vec![
                (SignalType::Buy, 100.0),
                (SignalType::Buy, 101.0),
                (SignalType::Buy, 102.0),
                (SignalType::Sell, 101.0),
                (SignalType::Sell, 102.0),
            ]
        );

        // FIFO-paired closed trades earn one grid step each:
        // buy@100/sell@101 and buy@101/sell@102.
        let buys: Vec<f64> = signals
            .iter()
            .filter(|(t, _)| *t == SignalType::Buy)
            .map(|(_, p)| *p)
            .collect();
        let sells: Vec<f64> = signals
            .iter()
            .filter(|(t, _)| *t == SignalType::Sell)
            .map(|(_, p)| *p)
            .collect();
        let pnl: f64 = sells
            .iter()
            .zip(buys.iter())
            .map(|(sell, buy)| sell - buy)
            .sum();
        assert!((pnl - 2.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_ticks_are_silent() {
        let mut strategy = default_grid();
        assert!(strategy.on_tick(&tick(99.0)).is_none());
        assert!(strategy.on_tick(&tick(111.0)).is_none());
        // First in-range tick still performs the initial entry.
        let signal = strategy.on_tick(&tick(105.0)).unwrap();
        assert_eq!(signal.signal_type, SignalType::Buy);
        assert!((signal.price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn trigger_price_keeps_grid_dormant() {
        let mut strategy = grid(serde_json::json!({
            "upper_price": 110.0,
            "lower_price": 100.0,
            "grid_count": 10,
            "order_size": 1.0,
            "trigger_price": 105.0,
        }));
        assert!(strategy.on_tick(&tick(102.0)).is_none());
        assert!(strategy.on_tick(&tick(104.9)).is_none());
        // First touch of the trigger activates and trades the same tick.
        let signal = strategy.on_tick(&tick(105.0)).unwrap();
        assert_eq!(signal.signal_type, SignalType::Buy);
        // Once active it stays active below the trigger too.
        assert!(strategy.on_tick(&tick(104.0)).is_some());
    }

    #[test]
    fn level_set_is_preserved_under_crossings() {
        // Reversibility: after any crossing sequence, buy-levels plus
        // sell-levels still form the full initial grid.
        let mut strategy = default_grid();
        let initial: Vec<f64> = strategy.levels().iter().map(|l| l.price).collect();

        for price in [
            100.0, 103.0, 99.0, 107.0, 101.0, 110.0, 100.0, 105.5, 102.0,
        ] {
            strategy.on_tick(&tick(price));
        }

        let after: Vec<f64> = strategy.levels().iter().map(|l| l.price).collect();
        assert_eq!(initial, after);
    }

    #[test]
    fn bought_level_sells_only_on_return_not_same_tick() {
        let mut strategy = default_grid();
        let s1 = strategy.on_tick(&tick(100.0)).unwrap();
        assert_eq!(s1.signal_type, SignalType::Buy);
        // Same price again: the level just flipped to sell and the path has
        // not moved, so nothing fires.
        assert!(strategy.on_tick(&tick(100.0)).is_none());
        // Price stepping up to the next level buys it rather than instantly
        // selling the one just bought.
        let s2 = strategy.on_tick(&tick(101.0)).unwrap();
        assert_eq!(s2.signal_type, SignalType::Buy);
        assert!((s2.price - 101.0).abs() < 1e-9);
    }
}
