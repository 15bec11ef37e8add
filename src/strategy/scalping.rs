// =============================================================================
// Scalping Strategy — orderbook-imbalance entries, tick-denominated exits
// =============================================================================
//
// Entries require a tight spread and a lopsided top-10 orderbook: heavy bids
// open a long, heavy asks open a short. Exits are symmetric tick targets
// around the entry plus a hard position-time limit that closes regardless of
// PnL. Tick timestamps drive the clock so the time-limit check is
// deterministic under replay.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::strategy::{
    optional_bool, optional_f64, required_f64, Signal, SignalType, StrategyCore, StrategyError,
};
use crate::types::{Orderbook, PositionSide, Ticker};

/// Rolling price window length.
const PRICE_WINDOW: usize = 100;
/// Orderbook levels aggregated per side for the imbalance ratio.
const IMBALANCE_DEPTH: usize = 10;
/// Fallback minimum price increment until the adapter provides one.
const DEFAULT_TICK_SIZE: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct ScalpingStrategy {
    pub(crate) core: StrategyCore,

    spread_threshold: f64,
    take_profit_ticks: f64,
    stop_loss_ticks: f64,
    imbalance_threshold: f64,
    position_time_limit_secs: f64,
    use_market_orders: bool,

    tick_size: f64,
    price_history: VecDeque<f64>,
    imbalance: Option<f64>,
    position_open_time: Option<DateTime<Utc>>,
    entry_side: Option<PositionSide>,
}

impl ScalpingStrategy {
    pub fn from_params(symbol: &str, params: &serde_json::Value) -> Result<Self, StrategyError> {
        Ok(Self {
            core: StrategyCore::new(symbol),
            spread_threshold: required_f64(params, "spread_threshold")?,
            take_profit_ticks: required_f64(params, "take_profit_ticks")?,
            stop_loss_ticks: required_f64(params, "stop_loss_ticks")?,
            imbalance_threshold: optional_f64(params, "order_book_imbalance_threshold", 2.0),
            position_time_limit_secs: optional_f64(params, "position_time_limit", 60.0),
            use_market_orders: optional_bool(params, "use_market_orders", true),
            tick_size: DEFAULT_TICK_SIZE,
            price_history: VecDeque::with_capacity(PRICE_WINDOW),
            imbalance: None,
            position_open_time: None,
            entry_side: None,
        })
    }

    pub fn validate_params(&self) -> Result<(), StrategyError> {
        if self.take_profit_ticks <= 0.0 {
            return Err(StrategyError::InvalidParams(
                "take_profit_ticks must be positive".into(),
            ));
        }
        if self.stop_loss_ticks <= 0.0 {
            return Err(StrategyError::InvalidParams(
                "stop_loss_ticks must be positive".into(),
            ));
        }
        if self.imbalance_threshold <= 1.0 {
            return Err(StrategyError::InvalidParams(
                "order_book_imbalance_threshold must exceed 1".into(),
            ));
        }
        Ok(())
    }

    pub fn initialize(&mut self) {
        self.price_history.clear();
        self.imbalance = None;
        self.position_open_time = None;
        self.entry_side = None;
    }

    /// Minimum price increment, set once per symbol from the adapter.
    pub fn set_tick_size(&mut self, tick_size: f64) {
        if tick_size > 0.0 {
            self.tick_size = tick_size;
        }
    }

    pub fn on_tick(&mut self, tick: &Ticker) -> Option<Signal> {
        let (price, bid, ask) = (tick.price, tick.bid, tick.ask);
        if price <= 0.0 || bid <= 0.0 || ask <= 0.0 {
            return None;
        }
        self.core.current_price = price;
        if self.price_history.len() == PRICE_WINDOW {
            self.price_history.pop_front();
        }
        self.price_history.push_back(price);

        let spread = ((ask - bid) / bid) * 100.0;

        // Hard time limit closes the position regardless of PnL.
        if self.core.has_position() {
            if let Some(opened) = self.position_open_time {
                let held = (tick.timestamp - opened).num_seconds() as f64;
                if held >= self.position_time_limit_secs {
                    return Some(self.close_signal(price, "Position time limit reached"));
                }
            }
            return self.check_exit(price);
        }

        if spread <= self.spread_threshold {
            return self.check_entry(tick.timestamp, bid, ask);
        }

        None
    }

    /// Replace the imbalance snapshot from a fresh orderbook.
    pub fn on_orderbook(&mut self, orderbook: Orderbook) -> Option<Signal> {
        self.imbalance = orderbook.imbalance(IMBALANCE_DEPTH);
        self.core.orderbook = Some(orderbook);
        None
    }

    fn close_signal(&mut self, price: f64, reason: &str) -> Signal {
        let signal_type = match self.entry_side {
            Some(PositionSide::Short) => SignalType::CloseShort,
            _ => SignalType::CloseLong,
        };
        self.position_open_time = None;
        self.entry_side = None;
        Signal::new(signal_type, self.core.symbol.clone(), price).with_reason(reason)
    }

    fn check_entry(&mut self, now: DateTime<Utc>, bid: f64, ask: f64) -> Option<Signal> {
        let imbalance = self.imbalance?;

        if imbalance >= self.imbalance_threshold {
            // Heavy bids: go long at the ask (market) or join the bid (limit).
            self.entry_side = Some(PositionSide::Long);
            self.position_open_time = Some(now);
            let price = if self.use_market_orders { ask } else { bid };
            debug!(symbol = %self.core.symbol, imbalance, "long entry");
            return Some(
                Signal::new(SignalType::Buy, self.core.symbol.clone(), price)
                    .with_reason(format!("Orderbook imbalance: {imbalance:.2}"))
                    .with_indicators(json!({ "imbalance": imbalance }))
                    .with_stops(
                        bid - self.stop_loss_ticks * self.tick_size,
                        ask + self.take_profit_ticks * self.tick_size,
                    ),
            );
        }

        if imbalance <= 1.0 / self.imbalance_threshold {
            // Heavy asks: go short symmetrically.
            self.entry_side = Some(PositionSide::Short);
            self.position_open_time = Some(now);
            let price = if self.use_market_orders { bid } else { ask };
            debug!(symbol = %self.core.symbol, imbalance, "short entry");
            return Some(
                Signal::new(SignalType::Sell, self.core.symbol.clone(), price)
                    .with_reason(format!("Orderbook imbalance: {imbalance:.2}"))
                    .with_indicators(json!({ "imbalance": imbalance }))
                    .with_stops(
                        ask + self.stop_loss_ticks * self.tick_size,
                        bid - self.take_profit_ticks * self.tick_size,
                    ),
            );
        }

        None
    }

    fn check_exit(&mut self, price: f64) -> Option<Signal> {
        let entry = self.core.entry_price;
        if entry <= 0.0 || self.tick_size <= 0.0 {
            return None;
        }

        let pnl_ticks = match self.entry_side {
            Some(PositionSide::Short) => (entry - price) / self.tick_size,
            _ => (price - entry) / self.tick_size,
        };

        if pnl_ticks >= self.take_profit_ticks {
            return Some(self.close_signal(price, &format!("Take profit: {pnl_ticks:.0} ticks")));
        }
        if pnl_ticks <= -self.stop_loss_ticks {
            return Some(self.close_signal(price, &format!("Stop loss: {pnl_ticks:.0} ticks")));
        }
        None
    }
}

impl Signal {
    fn with_stops(mut self, stop_loss: f64, take_profit: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self.take_profit = Some(take_profit);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyPosition;
    use chrono::Duration;

    fn tick_at(price: f64, bid: f64, ask: f64, at: DateTime<Utc>) -> Ticker {
        Ticker {
            symbol: "BTCUSDT".into(),
            price,
            bid,
            ask,
            volume_24h: 0.0,
            change_24h: 0.0,
            timestamp: at,
        }
    }

    fn book(bid_quantity: f64, ask_quantity: f64) -> Orderbook {
        Orderbook {
            symbol: "BTCUSDT".into(),
            bids: vec![[99.99, bid_quantity]],
            asks: vec![[100.01, ask_quantity]],
        }
    }

    fn scalper() -> ScalpingStrategy {
        let mut strategy = ScalpingStrategy::from_params(
            "BTCUSDT",
            &serde_json::json!({
                "spread_threshold": 0.1,
                "take_profit_ticks": 10.0,
                "stop_loss_ticks": 5.0,
                "order_book_imbalance_threshold": 2.0,
                "position_time_limit": 60.0,
            }),
        )
        .unwrap();
        strategy.validate_params().unwrap();
        strategy.initialize();
        strategy
    }

    fn open_long(strategy: &mut ScalpingStrategy, entry: f64, at: DateTime<Utc>) {
        strategy.entry_side = Some(PositionSide::Long);
        strategy.position_open_time = Some(at);
        strategy.core.apply_position(&StrategyPosition {
            quantity: 1.0,
            entry_price: entry,
            unrealized_pnl: 0.0,
        });
    }

    #[test]
    fn heavy_bids_open_long_with_tick_stops() {
        let mut strategy = scalper();
        strategy.set_tick_size(0.01);
        strategy.on_orderbook(book(30.0, 10.0)); // imbalance 3.0

        let now = Utc::now();
        let signal = strategy
            .on_tick(&tick_at(100.0, 99.99, 100.01, now))
            .unwrap();
        assert_eq!(signal.signal_type, SignalType::Buy);
        // Market entry takes the ask.
        assert!((signal.price - 100.01).abs() < 1e-9);
        assert!((signal.stop_loss.unwrap() - (99.99 - 5.0 * 0.01)).abs() < 1e-9);
        assert!((signal.take_profit.unwrap() - (100.01 + 10.0 * 0.01)).abs() < 1e-9);
    }

    #[test]
    fn heavy_asks_open_short() {
        let mut strategy = scalper();
        strategy.on_orderbook(book(10.0, 30.0)); // imbalance 0.33 <= 1/2

        let signal = strategy
            .on_tick(&tick_at(100.0, 99.99, 100.01, Utc::now()))
            .unwrap();
        assert_eq!(signal.signal_type, SignalType::Sell);
        // Market short hits the bid.
        assert!((signal.price - 99.99).abs() < 1e-9);
    }

    #[test]
    fn balanced_book_or_wide_spread_stays_flat() {
        let mut strategy = scalper();
        strategy.on_orderbook(book(10.0, 10.0)); // imbalance 1.0
        assert!(strategy
            .on_tick(&tick_at(100.0, 99.99, 100.01, Utc::now()))
            .is_none());

        // Lopsided book but a spread above threshold: no entry.
        strategy.on_orderbook(book(30.0, 10.0));
        assert!(strategy
            .on_tick(&tick_at(100.0, 99.0, 101.0, Utc::now()))
            .is_none());
    }

    #[test]
    fn time_limit_closes_regardless_of_pnl() {
        let mut strategy = scalper();
        let t0 = Utc::now();
        open_long(&mut strategy, 100.0, t0);

        // 61 seconds later at exactly the entry price.
        let signal = strategy
            .on_tick(&tick_at(100.0, 99.99, 100.01, t0 + Duration::seconds(61)))
            .unwrap();
        assert_eq!(signal.signal_type, SignalType::CloseLong);
        assert_eq!(signal.reason, "Position time limit reached");
    }

    #[test]
    fn tick_denominated_take_profit_and_stop_loss() {
        let mut strategy = scalper();
        strategy.set_tick_size(0.01);
        let t0 = Utc::now();
        open_long(&mut strategy, 100.0, t0);

        // +9 ticks: still holding.
        assert!(strategy
            .on_tick(&tick_at(100.09, 100.08, 100.10, t0 + Duration::seconds(1)))
            .is_none());
        // +10 ticks: take profit.
        let signal = strategy
            .on_tick(&tick_at(100.10, 100.09, 100.11, t0 + Duration::seconds(2)))
            .unwrap();
        assert_eq!(signal.signal_type, SignalType::CloseLong);
        assert!(signal.reason.starts_with("Take profit"));

        // Fresh long, -5 ticks: stop loss.
        open_long(&mut strategy, 100.0, t0);
        let signal = strategy
            .on_tick(&tick_at(99.95, 99.94, 99.96, t0 + Duration::seconds(3)))
            .unwrap();
        assert!(signal.reason.starts_with("Stop loss"));
    }

    #[test]
    fn rolling_window_is_bounded_to_100() {
        let mut strategy = scalper();
        let now = Utc::now();
        for i in 0..250 {
            strategy.on_tick(&tick_at(
                100.0 + i as f64 * 0.001,
                99.99,
                100.01,
                now + Duration::seconds(i),
            ));
        }
        assert_eq!(strategy.price_history.len(), PRICE_WINDOW);
    }

    #[test]
    fn validate_rejects_degenerate_thresholds() {
        let bad = ScalpingStrategy::from_params(
            "BTCUSDT",
            &serde_json::json!({
                "spread_threshold": 0.1,
                "take_profit_ticks": 0.0,
                "stop_loss_ticks": 5.0,
            }),
        )
        .unwrap();
        assert!(bad.validate_params().is_err());

        let bad = ScalpingStrategy::from_params(
            "BTCUSDT",
            &serde_json::json!({
                "spread_threshold": 0.1,
                "take_profit_ticks": 10.0,
                "stop_loss_ticks": 5.0,
                "order_book_imbalance_threshold": 0.9,
            }),
        )
        .unwrap();
        assert!(bad.validate_params().is_err());
    }
}
