// =============================================================================
// Risk Engine — per-user pre-trade validation and portfolio accounting
// =============================================================================
//
// One engine exists per user. `validate_order` evaluates a fixed check order
// and returns the first failure; the signal-to-order pipeline never calls
// the exchange after a rejection. All engine state sits behind a single
// mutex per user with microsecond hold times; no I/O ever happens inside
// the critical section.
//
// Daily tracking resets exactly once per UTC day, when the first equity
// observation after midnight arrives.
// =============================================================================

pub mod kill_switch;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::PositionSide;

pub use kill_switch::{KillSwitch, KillSwitchError, KillSwitchEvent, KillSwitchTrigger};

// ---------------------------------------------------------------------------
// Limits & snapshots
// ---------------------------------------------------------------------------

/// Risk limits configuration. Bot-level overrides layer on top of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_drawdown_percent: f64,
    pub max_position_size_percent: f64,
    pub daily_loss_limit_percent: f64,
    pub max_leverage: u32,
    pub max_open_positions: usize,
    pub max_exposure_per_asset_percent: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown_percent: 10.0,
            max_position_size_percent: 5.0,
            daily_loss_limit_percent: 3.0,
            max_leverage: 10,
            max_open_positions: 10,
            max_exposure_per_asset_percent: 20.0,
        }
    }
}

/// Risk metrics for a single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_percent: f64,
}

/// Portfolio-level snapshot returned by `calculate_portfolio_risk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRisk {
    pub total_equity: f64,
    pub total_exposure: f64,
    pub total_unrealized_pnl: f64,
    pub total_realized_pnl_today: f64,
    pub current_drawdown_percent: f64,
    pub max_drawdown_percent: f64,
    pub open_positions: usize,
    pub daily_pnl_percent: f64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a pre-trade check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Validation {
    fn pass() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateful per-user risk accountant.
#[derive(Debug)]
pub struct RiskEngine {
    limits: RiskLimits,
    peak_equity: f64,
    starting_equity_today: f64,
    realized_pnl_today: f64,
    positions: HashMap<String, PositionRisk>,
    kill_switch: KillSwitch,
    current_day: Option<NaiveDate>,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        info!(
            max_drawdown = limits.max_drawdown_percent,
            max_position_size = limits.max_position_size_percent,
            daily_loss = limits.daily_loss_limit_percent,
            max_leverage = limits.max_leverage,
            "risk engine initialised"
        );
        Self {
            limits,
            peak_equity: 0.0,
            starting_equity_today: 0.0,
            realized_pnl_today: 0.0,
            positions: HashMap::new(),
            kill_switch: KillSwitch::new(),
            current_day: None,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn update_limits(&mut self, limits: RiskLimits) {
        info!(?limits, "risk limits updated");
        self.limits = limits;
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn kill_switch_mut(&mut self) -> &mut KillSwitch {
        &mut self.kill_switch
    }

    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }

    // -------------------------------------------------------------------------
    // Pre-trade validation
    // -------------------------------------------------------------------------

    /// Fixed-order pre-trade checks; the first failure wins.
    pub fn validate_order(
        &mut self,
        symbol: &str,
        _side: PositionSide,
        quantity: f64,
        price: f64,
        leverage: f64,
        portfolio_value: f64,
    ) -> Validation {
        // 1. Kill switch latch.
        if self.kill_switch.is_active() {
            let reason = self
                .kill_switch
                .active_reason()
                .unwrap_or("activated")
                .to_string();
            return Validation::reject(format!("Kill switch active: {reason}"));
        }

        // 2. Leverage cap.
        if leverage > self.limits.max_leverage as f64 {
            return Validation::reject(format!(
                "Leverage {leverage}x exceeds max {}x",
                self.limits.max_leverage
            ));
        }

        // 3. Position size cap as a share of portfolio value.
        let order_value = quantity * price;
        let position_size_percent = if portfolio_value > 0.0 {
            (order_value / portfolio_value) * 100.0
        } else {
            0.0
        };
        if position_size_percent > self.limits.max_position_size_percent {
            return Validation::reject(format!(
                "Position size {position_size_percent:.1}% exceeds max {}%",
                self.limits.max_position_size_percent
            ));
        }

        // 4. Open-position count (adding to an existing symbol is allowed).
        if self.positions.len() >= self.limits.max_open_positions
            && !self.positions.contains_key(symbol)
        {
            return Validation::reject(format!(
                "Max open positions ({}) reached",
                self.limits.max_open_positions
            ));
        }

        // 5. Daily loss limit.
        if self.daily_loss_percent() >= self.limits.daily_loss_limit_percent {
            return Validation::reject(format!(
                "Daily loss limit ({}%) exceeded",
                self.limits.daily_loss_limit_percent
            ));
        }

        // 6. Drawdown from peak equity.
        if self.drawdown_percent(portfolio_value) >= self.limits.max_drawdown_percent {
            return Validation::reject(format!(
                "Max drawdown ({}%) exceeded",
                self.limits.max_drawdown_percent
            ));
        }

        Validation::pass()
    }

    // -------------------------------------------------------------------------
    // Accounting
    // -------------------------------------------------------------------------

    /// Recompute the tracked PnL for a position; zero size drops it.
    pub fn update_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        current_price: f64,
        leverage: f64,
    ) {
        if size == 0.0 {
            self.positions.remove(symbol);
            return;
        }

        let unrealized_pnl = match side {
            PositionSide::Long => (current_price - entry_price) * size,
            PositionSide::Short => (entry_price - current_price) * size,
        };
        let entry_value = entry_price * size;
        let unrealized_pnl_percent = if entry_value > 0.0 {
            (unrealized_pnl / entry_value) * 100.0
        } else {
            0.0
        };

        self.positions.insert(
            symbol.to_string(),
            PositionRisk {
                symbol: symbol.to_string(),
                side,
                size,
                entry_price,
                current_price,
                leverage,
                unrealized_pnl,
                unrealized_pnl_percent,
            },
        );
    }

    /// Fold realized PnL from a closed trade into today's tally.
    pub fn record_realized_pnl(&mut self, pnl: f64) {
        self.realized_pnl_today += pnl;
        debug!(pnl, realized_today = self.realized_pnl_today, "realized pnl recorded");
    }

    /// Roll daily tracking when the first observation after UTC midnight
    /// arrives. Idempotent within a day.
    pub fn observe_equity(&mut self, now: DateTime<Utc>, equity: f64) {
        let today = now.date_naive();
        if self.current_day != Some(today) {
            info!(date = %today, starting_equity = equity, "daily risk tracking reset");
            self.current_day = Some(today);
            self.starting_equity_today = equity;
            self.realized_pnl_today = 0.0;
        }
    }

    /// Portfolio-level snapshot. Advances the peak-equity high-water mark;
    /// the peak never regresses within an engine instance.
    pub fn calculate_portfolio_risk(&mut self, total_equity: f64) -> PortfolioRisk {
        if total_equity > self.peak_equity {
            self.peak_equity = total_equity;
        }

        let total_unrealized: f64 = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let total_exposure: f64 = self
            .positions
            .values()
            .map(|p| p.size * p.current_price * p.leverage)
            .sum();
        let daily_pnl_percent = if self.starting_equity_today > 0.0 {
            ((total_equity - self.starting_equity_today) / self.starting_equity_today) * 100.0
        } else {
            0.0
        };

        PortfolioRisk {
            total_equity,
            total_exposure,
            total_unrealized_pnl: total_unrealized,
            total_realized_pnl_today: self.realized_pnl_today,
            current_drawdown_percent: self.drawdown_percent(total_equity),
            max_drawdown_percent: self.limits.max_drawdown_percent,
            open_positions: self.positions.len(),
            daily_pnl_percent,
            timestamp: Utc::now(),
        }
    }

    /// Evaluate kill-switch conditions from current accounting.
    pub fn check_kill_conditions(
        &mut self,
        portfolio_value: f64,
        exchange_healthy: bool,
    ) -> Option<KillSwitchEvent> {
        let current_dd = self.drawdown_percent(portfolio_value);
        let daily_loss = self.daily_loss_percent();
        let max_dd = self.limits.max_drawdown_percent;
        let max_daily = self.limits.daily_loss_limit_percent;
        self.kill_switch
            .check_conditions(current_dd, max_dd, daily_loss, max_daily, exchange_healthy)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn daily_loss_percent(&self) -> f64 {
        if self.starting_equity_today == 0.0 {
            return 0.0;
        }
        let current = self.starting_equity_today + self.realized_pnl_today;
        ((self.starting_equity_today - current) / self.starting_equity_today) * 100.0
    }

    fn drawdown_percent(&self, equity: f64) -> f64 {
        if self.peak_equity == 0.0 {
            return 0.0;
        }
        ((self.peak_equity - equity) / self.peak_equity) * 100.0
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Process-wide risk state, segmented by user id. Each user's engine sits
/// behind its own mutex; `validate_order` and state updates cannot
/// interleave for one user, while distinct users proceed in parallel.
pub struct RiskManager {
    engines: RwLock<HashMap<Uuid, Arc<Mutex<RiskEngine>>>>,
    default_limits: RiskLimits,
}

impl RiskManager {
    pub fn new(default_limits: RiskLimits) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            default_limits,
        }
    }

    /// The user's engine, created with default limits on first touch.
    pub fn engine_for(&self, user_id: Uuid) -> Arc<Mutex<RiskEngine>> {
        if let Some(engine) = self.engines.read().get(&user_id) {
            return engine.clone();
        }
        let mut engines = self.engines.write();
        engines
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(RiskEngine::new(self.default_limits.clone()))))
            .clone()
    }

    pub fn user_count(&self) -> usize {
        self.engines.read().len()
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("users", &self.user_count())
            .finish()
    }
}
