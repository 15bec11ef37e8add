// =============================================================================
// Position Book — per-bot net exposure with FIFO realized PnL
// =============================================================================
//
// A position is created on the first fill of a directional order and closed
// when its quantity returns to zero. Adds in the same direction re-weight
// the average entry; reductions consume entry lots first-in-first-out and
// realize PnL per consumed lot (net of the reducing fill's fee). A fill
// crossing through zero closes the position and opens a fresh one in the
// opposite direction with the remainder.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{OrderSide, PositionSide, PositionStatus};

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One entry lot, consumed FIFO on reduction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Lot {
    quantity: f64,
    price: f64,
}

/// Net directional exposure on a symbol for one bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub quantity: f64,
    pub initial_quantity: f64,
    pub entry_price: f64,
    pub average_entry_price: f64,
    /// Quote-currency value at the average entry.
    pub entry_value: f64,
    #[serde(default)]
    pub current_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_percent: f64,
    pub realized_pnl: f64,
    pub max_unrealized_pnl: f64,
    pub max_drawdown: f64,
    pub total_fees: f64,
    pub leverage: f64,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
    #[serde(default)]
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub trailing_stop_price: Option<f64>,
    pub safety_orders_filled: u32,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(skip)]
    lots: VecDeque<Lot>,
}

impl Position {
    fn open(bot_id: Uuid, symbol: &str, side: PositionSide, quantity: f64, price: f64, fee: f64, leverage: f64) -> Self {
        let mut lots = VecDeque::new();
        lots.push_back(Lot { quantity, price });
        Self {
            id: Uuid::new_v4(),
            bot_id,
            symbol: symbol.to_string(),
            side,
            status: PositionStatus::Open,
            quantity,
            initial_quantity: quantity,
            entry_price: price,
            average_entry_price: price,
            entry_value: quantity * price,
            current_price: Some(price),
            unrealized_pnl: 0.0,
            unrealized_pnl_percent: 0.0,
            realized_pnl: 0.0,
            max_unrealized_pnl: 0.0,
            max_drawdown: 0.0,
            total_fees: fee,
            leverage,
            liquidation_price: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_price: None,
            safety_orders_filled: 0,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
            lots,
        }
    }

    fn direction(&self) -> f64 {
        match self.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// Recompute unrealized PnL (net of fees) and the PnL watermarks.
    fn mark(&mut self, price: f64) {
        self.current_price = Some(price);
        self.unrealized_pnl =
            self.direction() * (price - self.average_entry_price) * self.quantity
                - self.total_fees;
        self.unrealized_pnl_percent = if self.entry_value > 0.0 {
            (self.unrealized_pnl / self.entry_value) * 100.0
        } else {
            0.0
        };

        if self.unrealized_pnl > self.max_unrealized_pnl {
            self.max_unrealized_pnl = self.unrealized_pnl;
        }
        if self.max_unrealized_pnl > 0.0 {
            let drawdown = self.max_unrealized_pnl - self.unrealized_pnl;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
    }

    fn close(&mut self, reason: &str, price: f64) {
        self.status = PositionStatus::Closed;
        self.current_price = Some(price);
        self.quantity = 0.0;
        self.unrealized_pnl = 0.0;
        self.unrealized_pnl_percent = 0.0;
        self.closed_at = Some(Utc::now());
        self.close_reason = Some(reason.to_string());
        self.lots.clear();
    }
}

/// What a fill did to the bot's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEvent {
    Opened,
    Updated,
    Closed,
}

/// Outcome of applying one fill.
#[derive(Debug, Clone)]
pub struct FillImpact {
    pub event: PositionEvent,
    /// Snapshot after the fill (the closed record when `event == Closed`).
    pub position: Position,
    /// Realized PnL of this fill, net of its fee; zero for adds.
    pub realized_pnl: f64,
    /// A reversal past zero closes and immediately reopens opposite.
    pub flipped_open: Option<Position>,
}

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

/// Thread-safe position projection keyed by (bot, symbol).
pub struct PositionBook {
    open: RwLock<HashMap<(Uuid, String), Position>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Fill application
    // -------------------------------------------------------------------------

    /// Fold a fill into the bot's position on `symbol`.
    pub fn apply_fill(
        &self,
        bot_id: Uuid,
        symbol: &str,
        order_side: OrderSide,
        quantity: f64,
        price: f64,
        fee: f64,
        leverage: f64,
    ) -> FillImpact {
        let key = (bot_id, symbol.to_string());
        let mut open = self.open.write();

        let Some(position) = open.get_mut(&key) else {
            // First fill of a directional order opens the position.
            let side = PositionSide::from_order_side(order_side);
            let position = Position::open(bot_id, symbol, side, quantity, price, fee, leverage);
            let snapshot = position.clone();
            open.insert(key, position);
            info!(
                bot_id = %bot_id,
                symbol,
                side = %snapshot.side,
                quantity,
                price,
                "position opened"
            );
            return FillImpact {
                event: PositionEvent::Opened,
                position: snapshot,
                realized_pnl: 0.0,
                flipped_open: None,
            };
        };

        if PositionSide::from_order_side(order_side) == position.side {
            // Same-direction add: weighted-average entry.
            position.lots.push_back(Lot { quantity, price });
            position.quantity += quantity;
            position.total_fees += fee;
            let (total_quantity, total_value) = position
                .lots
                .iter()
                .fold((0.0, 0.0), |(q, v), lot| {
                    (q + lot.quantity, v + lot.quantity * lot.price)
                });
            position.average_entry_price = total_value / total_quantity;
            position.entry_value = position.average_entry_price * position.quantity;
            position.mark(price);

            let snapshot = position.clone();
            debug!(
                bot_id = %bot_id,
                symbol,
                quantity = snapshot.quantity,
                average_entry = snapshot.average_entry_price,
                "position increased"
            );
            return FillImpact {
                event: PositionEvent::Updated,
                position: snapshot,
                realized_pnl: 0.0,
                flipped_open: None,
            };
        }

        // Reduction: consume entry lots FIFO.
        let direction = position.direction();
        let mut remaining = quantity;
        let mut realized = 0.0;
        while remaining > 0.0 {
            let Some(lot) = position.lots.front_mut() else {
                break;
            };
            let consumed = lot.quantity.min(remaining);
            realized += direction * (price - lot.price) * consumed;
            lot.quantity -= consumed;
            remaining -= consumed;
            if lot.quantity <= f64::EPSILON {
                position.lots.pop_front();
            }
        }
        // The reducing fill's fee nets against its realized PnL.
        realized -= fee;
        position.realized_pnl += realized;
        position.quantity = (position.quantity - (quantity - remaining)).max(0.0);

        if position.quantity <= f64::EPSILON {
            let mut closed = open.remove(&(bot_id, symbol.to_string())).expect("present");
            closed.close("reduced_to_zero", price);
            let closed_snapshot = closed.clone();
            self.closed.write().push(closed);
            info!(
                bot_id = %bot_id,
                symbol,
                realized_pnl = closed_snapshot.realized_pnl,
                "position closed"
            );

            // Quantity beyond the close opens the opposite direction.
            let flipped_open = if remaining > f64::EPSILON {
                let side = PositionSide::from_order_side(order_side);
                let flipped =
                    Position::open(bot_id, symbol, side, remaining, price, 0.0, leverage);
                let snapshot = flipped.clone();
                open.insert((bot_id, symbol.to_string()), flipped);
                Some(snapshot)
            } else {
                None
            };

            return FillImpact {
                event: PositionEvent::Closed,
                position: closed_snapshot,
                realized_pnl: realized,
                flipped_open,
            };
        }

        position.mark(price);
        let snapshot = position.clone();
        FillImpact {
            event: PositionEvent::Updated,
            position: snapshot,
            realized_pnl: realized,
            flipped_open: None,
        }
    }

    // -------------------------------------------------------------------------
    // Mark / metadata updates
    // -------------------------------------------------------------------------

    /// Refresh unrealized PnL for every open position on `symbol`.
    pub fn update_mark(&self, symbol: &str, price: f64) {
        let mut open = self.open.write();
        for position in open.values_mut().filter(|p| p.symbol == symbol) {
            position.mark(price);
        }
    }

    /// Attach protective prices from the originating signal.
    pub fn set_protective_prices(
        &self,
        bot_id: &Uuid,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) {
        let mut open = self.open.write();
        if let Some(position) = open.get_mut(&(*bot_id, symbol.to_string())) {
            if stop_loss.is_some() {
                position.stop_loss_price = stop_loss;
            }
            if take_profit.is_some() {
                position.take_profit_price = take_profit;
            }
        }
    }

    /// Count a safety-order fill against the position.
    pub fn increment_safety_orders(&self, bot_id: &Uuid, symbol: &str) {
        let mut open = self.open.write();
        if let Some(position) = open.get_mut(&(*bot_id, symbol.to_string())) {
            position.safety_orders_filled += 1;
        }
    }

    /// Force-close at a given mark (reconciliation, liquidation).
    pub fn close_at(
        &self,
        bot_id: &Uuid,
        symbol: &str,
        price: f64,
        reason: &str,
    ) -> Option<Position> {
        let mut open = self.open.write();
        let mut position = open.remove(&(*bot_id, symbol.to_string()))?;

        let final_realized =
            position.direction() * (price - position.average_entry_price) * position.quantity;
        position.realized_pnl += final_realized;
        position.close(reason, price);
        let snapshot = position.clone();
        self.closed.write().push(position);
        info!(bot_id = %bot_id, symbol, reason, "position force-closed");
        Some(snapshot)
    }

    // -------------------------------------------------------------------------
    // Queries (snapshot copies)
    // -------------------------------------------------------------------------

    pub fn get(&self, bot_id: &Uuid, symbol: &str) -> Option<Position> {
        self.open
            .read()
            .get(&(*bot_id, symbol.to_string()))
            .cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_for_bot(&self, bot_id: &Uuid) -> Vec<Position> {
        self.open
            .read()
            .values()
            .filter(|p| p.bot_id == *bot_id)
            .cloned()
            .collect()
    }

    pub fn closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}
