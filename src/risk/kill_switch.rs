// =============================================================================
// Kill Switch — latching emergency stop for all order submission
// =============================================================================
//
// Activation latches: once set, every order validation fails until an
// explicit `deactivate` with a confirmation code. Triggers cover both
// risk-limit breaches and operational failures.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Why the switch fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchTrigger {
    Manual,
    MaxDrawdown,
    DailyLoss,
    ExchangeError,
    PositionLiquidation,
    AbnormalVolatility,
    ConnectionLoss,
    SystemError,
}

impl std::fmt::Display for KillSwitchTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::MaxDrawdown => "max_drawdown",
            Self::DailyLoss => "daily_loss",
            Self::ExchangeError => "exchange_error",
            Self::PositionLiquidation => "position_liquidation",
            Self::AbnormalVolatility => "abnormal_volatility",
            Self::ConnectionLoss => "connection_loss",
            Self::SystemError => "system_error",
        };
        write!(f, "{s}")
    }
}

/// A single activation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub trigger: KillSwitchTrigger,
    pub reason: String,
    pub affected_bots: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum KillSwitchError {
    #[error("confirmation code required to reset kill switch")]
    ConfirmationRequired,
}

/// Serialisable status for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchStatus {
    pub is_active: bool,
    pub affected_bots: Vec<Uuid>,
    pub last_reason: Option<String>,
    pub total_activations: usize,
}

/// Latching emergency stop.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    active: bool,
    events: Vec<KillSwitchEvent>,
    affected_bots: Vec<Uuid>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Reason of the most recent activation, if any.
    pub fn active_reason(&self) -> Option<&str> {
        if self.active {
            self.events.last().map(|e| e.reason.as_str())
        } else {
            None
        }
    }

    /// Latch the switch. All order submission must stop immediately.
    pub fn activate(
        &mut self,
        trigger: KillSwitchTrigger,
        reason: impl Into<String>,
        bot_ids: Vec<Uuid>,
    ) -> KillSwitchEvent {
        let reason = reason.into();
        self.active = true;
        self.affected_bots = bot_ids.clone();

        let event = KillSwitchEvent {
            trigger,
            reason: reason.clone(),
            affected_bots: bot_ids,
            timestamp: Utc::now(),
        };
        self.events.push(event.clone());

        warn!(
            trigger = %trigger,
            reason = %reason,
            affected_bots = event.affected_bots.len(),
            "KILL SWITCH ACTIVATED"
        );
        event
    }

    /// Unlatch. The confirmation code guards against accidental resets.
    pub fn deactivate(&mut self, confirmation_code: &str) -> Result<(), KillSwitchError> {
        if confirmation_code.trim().is_empty() {
            return Err(KillSwitchError::ConfirmationRequired);
        }
        self.active = false;
        self.affected_bots.clear();
        info!("kill switch deactivated");
        Ok(())
    }

    /// Evaluate breach conditions and latch on the first violated one.
    /// Returns the activation event when the switch fires, `None` when it
    /// stays clear or was already latched.
    pub fn check_conditions(
        &mut self,
        current_drawdown: f64,
        max_drawdown: f64,
        daily_loss: f64,
        max_daily_loss: f64,
        exchange_healthy: bool,
    ) -> Option<KillSwitchEvent> {
        if self.active {
            return None;
        }

        if current_drawdown >= max_drawdown {
            return Some(self.activate(
                KillSwitchTrigger::MaxDrawdown,
                format!("Drawdown {current_drawdown:.2}% exceeded limit {max_drawdown:.2}%"),
                Vec::new(),
            ));
        }

        if daily_loss >= max_daily_loss {
            return Some(self.activate(
                KillSwitchTrigger::DailyLoss,
                format!("Daily loss {daily_loss:.2}% exceeded limit {max_daily_loss:.2}%"),
                Vec::new(),
            ));
        }

        if !exchange_healthy {
            return Some(self.activate(
                KillSwitchTrigger::ExchangeError,
                "Exchange connection unhealthy",
                Vec::new(),
            ));
        }

        None
    }

    pub fn status(&self) -> KillSwitchStatus {
        KillSwitchStatus {
            is_active: self.active,
            affected_bots: self.affected_bots.clone(),
            last_reason: self.events.last().map(|e| e.reason.clone()),
            total_activations: self.events.len(),
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
    fn drawdown_breach_activates_with_trigger() {
        let mut ks = KillSwitch::new();
        let event = ks.check_conditions(11.0, 10.0, 0.0, 3.0, true).unwrap();
        assert_eq!(event.trigger, KillSwitchTrigger::MaxDrawdown);
        assert!(ks.is_active());
    }

    #[test]
    fn daily_loss_breach_activates() {
        let mut ks = KillSwitch::new();
        let event = ks.check_conditions(1.0, 10.0, 3.5, 3.0, true).unwrap();
        assert_eq!(event.trigger, KillSwitchTrigger::DailyLoss);
    }

    #[test]
    fn unhealthy_exchange_activates() {
        let mut ks = KillSwitch::new();
        let event = ks.check_conditions(0.0, 10.0, 0.0, 3.0, false).unwrap();
        assert_eq!(event.trigger, KillSwitchTrigger::ExchangeError);
    }

    #[test]
    fn clear_conditions_stay_clear() {
        let mut ks = KillSwitch::new();
        assert!(ks.check_conditions(5.0, 10.0, 1.0, 3.0, true).is_none());
        assert!(!ks.is_active());
    }

    #[test]
    fn activation_latches_until_confirmed_reset() {
        let mut ks = KillSwitch::new();
        ks.activate(KillSwitchTrigger::Manual, "operator stop", Vec::new());
        assert!(ks.is_active());

        // Re-checking while latched does not double-fire.
        assert!(ks.check_conditions(99.0, 10.0, 99.0, 3.0, false).is_none());
        assert!(ks.is_active());

        // Empty confirmation is refused; the latch holds.
        assert!(ks.deactivate("").is_err());
        assert!(ks.is_active());

        ks.deactivate("CONFIRM-RESET").unwrap();
        assert!(!ks.is_active());
    }

    #[test]
    fn status_reports_history() {
        let mut ks = KillSwitch::new();
        ks.activate(KillSwitchTrigger::Manual, "first", Vec::new());
        ks.deactivate("ok").unwrap();
        ks.activate(KillSwitchTrigger::SystemError, "second", Vec::new());

        let status = ks.status();
        assert!(status.is_active);
        assert_eq!(status.total_activations, 2);
        assert_eq!(status.last_reason.as_deref(), Some("second"));
    }
}
