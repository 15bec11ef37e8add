// =============================================================================
// DCA Strategy — base order plus a ladder of safety orders
// =============================================================================
//
// A base buy opens the cycle. As price drops, precomputed safety orders fire
// at widening deviations from the entry, lowering the average entry price.
// The whole accumulated quantity exits at `take_profit_percent` above the
// average entry (or at the optional stop loss below it), after which the
// cycle resets and re-arms on the next tick.
//
// `average_entry` is only updated from fills; the per-bot serialization of
// fills and ticks guarantees it is current when the take-profit check runs.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::strategy::{
    optional_f64, optional_u32, required_f64, Signal, SignalType, StrategyCore, StrategyError,
    StrategyFill,
};
use crate::types::Ticker;

/// One rung of the safety-order ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyOrder {
    pub order_num: u32,
    pub deviation_percent: f64,
    pub size: f64,
    pub trigger_price: f64,
    pub is_filled: bool,
}

#[derive(Debug, Clone)]
pub struct DcaStrategy {
    pub(crate) core: StrategyCore,

    base_order_size: f64,
    safety_order_size: f64,
    max_safety_orders: u32,
    price_deviation: f64,
    step_scale: f64,
    volume_scale: f64,
    take_profit_pct: f64,
    stop_loss_pct: Option<f64>,

    safety_orders: Vec<SafetyOrder>,
    base_order_filled: bool,
    average_entry: f64,
    total_quantity: f64,
    total_invested: f64,
}

impl DcaStrategy {
    pub fn from_params(symbol: &str, params: &serde_json::Value) -> Result<Self, StrategyError> {
        Ok(Self {
            core: StrategyCore::new(symbol),
            base_order_size: required_f64(params, "base_order_size")?,
            safety_order_size: required_f64(params, "safety_order_size")?,
            max_safety_orders: optional_u32(params, "max_safety_orders", 5),
            price_deviation: optional_f64(params, "price_deviation_percent", 1.0),
            step_scale: optional_f64(params, "safety_order_step_scale", 1.0),
            volume_scale: optional_f64(params, "safety_order_volume_scale", 1.0),
            take_profit_pct: optional_f64(params, "take_profit_percent", 1.5),
            stop_loss_pct: params["stop_loss_percent"].as_f64(),
            safety_orders: Vec::new(),
            base_order_filled: false,
            average_entry: 0.0,
            total_quantity: 0.0,
            total_invested: 0.0,
        })
    }

    pub fn validate_params(&self) -> Result<(), StrategyError> {
        if self.base_order_size <= 0.0 {
            return Err(StrategyError::InvalidParams(
                "base_order_size must be positive".into(),
            ));
        }
        if self.safety_order_size <= 0.0 {
            return Err(StrategyError::InvalidParams(
                "safety_order_size must be positive".into(),
            ));
        }
        if self.take_profit_pct <= 0.0 {
            return Err(StrategyError::InvalidParams(
                "take_profit_percent must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn initialize(&mut self) {
        self.build_safety_orders();
    }

    /// Precompute the ladder: deviation widens by `step_scale`, size grows by
    /// `volume_scale`, per rung.
    fn build_safety_orders(&mut self) {
        self.safety_orders.clear();
        let mut deviation = self.price_deviation;
        let mut size = self.safety_order_size;
        for i in 0..self.max_safety_orders {
            self.safety_orders.push(SafetyOrder {
                order_num: i + 1,
                deviation_percent: deviation,
                size,
                trigger_price: 0.0,
                is_filled: false,
            });
            deviation += self.price_deviation * self.step_scale;
            size *= self.volume_scale;
        }
    }

    fn update_safety_triggers(&mut self, entry_price: f64) {
        for so in &mut self.safety_orders {
            so.trigger_price = entry_price * (1.0 - so.deviation_percent / 100.0);
        }
    }

    /// Re-arm the cycle after a full exit.
    fn reset_cycle(&mut self) {
        self.base_order_filled = false;
        self.average_entry = 0.0;
        self.total_quantity = 0.0;
        self.total_invested = 0.0;
        self.core.entry_price = 0.0;
        self.build_safety_orders();
        debug!(symbol = %self.core.symbol, "cycle reset");
    }

    /// Ladder snapshot, for dashboards and tests.
    pub fn safety_orders(&self) -> &[SafetyOrder] {
        &self.safety_orders
    }

    pub fn average_entry(&self) -> f64 {
        self.average_entry
    }

    pub fn total_quantity(&self) -> f64 {
        self.total_quantity
    }

    pub fn on_tick(&mut self, tick: &Ticker) -> Option<Signal> {
        let price = tick.price;
        if price <= 0.0 {
            return None;
        }
        self.core.current_price = price;

        // Open the cycle with the base order.
        if !self.base_order_filled {
            self.base_order_filled = true;
            self.core.entry_price = price;
            self.update_safety_triggers(price);

            return Some(
                Signal::new(SignalType::Buy, self.core.symbol.clone(), price)
                    .with_quantity(self.base_order_size)
                    .with_reason("DCA base order")
                    .with_indicators(json!({ "order_type": "base" })),
            );
        }

        // Exits are measured against the fill-derived average entry.
        if self.total_quantity > 0.0 {
            let pnl_percent = ((price - self.average_entry) / self.average_entry) * 100.0;

            if pnl_percent >= self.take_profit_pct {
                let quantity = self.total_quantity;
                self.reset_cycle();
                return Some(
                    Signal::new(SignalType::Sell, self.core.symbol.clone(), price)
                        .with_quantity(quantity)
                        .with_reason(format!("Take profit at {pnl_percent:.2}%"))
                        .with_indicators(json!({ "pnl_percent": pnl_percent })),
                );
            }

            if let Some(stop_loss) = self.stop_loss_pct {
                if pnl_percent <= -stop_loss {
                    let quantity = self.total_quantity;
                    self.reset_cycle();
                    return Some(
                        Signal::new(SignalType::Sell, self.core.symbol.clone(), price)
                            .with_quantity(quantity)
                            .with_reason(format!("Stop loss at {pnl_percent:.2}%"))
                            .with_indicators(json!({ "pnl_percent": pnl_percent })),
                    );
                }
            }
        }

        // Fire the next safety order whose trigger the price has reached.
        for so in &mut self.safety_orders {
            if so.is_filled {
                continue;
            }
            if price <= so.trigger_price {
                so.is_filled = true;
                let order_num = so.order_num;
                let size = so.size;
                return Some(
                    Signal::new(SignalType::Buy, self.core.symbol.clone(), price)
                        .with_quantity(size)
                        .with_reason(format!("Safety order #{order_num}"))
                        .with_indicators(json!({
                            "order_type": "safety",
                            "order_num": order_num,
                        })),
                );
            }
        }

        None
    }

    /// Fold a fill into the running average entry.
    pub fn on_order_filled(&mut self, fill: &StrategyFill) {
        if fill.quantity <= 0.0 || fill.price <= 0.0 {
            return;
        }
        self.total_quantity += fill.quantity;
        self.total_invested += fill.quantity * fill.price;
        self.average_entry = self.total_invested / self.total_quantity;
        debug!(
            symbol = %self.core.symbol,
            total_quantity = self.total_quantity,
            average_entry = self.average_entry,
            "fill folded into average entry"
        );
    }
}
