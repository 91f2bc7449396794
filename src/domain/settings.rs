//! Per-(user, sport) trading parameters and per-user global safety settings.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sport identifier. Kept as an open string rather than a closed enum so a new
/// league can be onboarded without a migration — the phase-accounting table in
/// `crate::engine::sports_client` is the thing that actually needs to know the
/// sport's shape.
pub type Sport = String;

/// Per-(user, sport) trading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SportConfig {
    pub user_id: Uuid,
    pub sport: Sport,
    pub enabled: bool,

    /// Entry requires price to have dropped at least this percent off baseline.
    pub entry_threshold_drop_pct: f64,
    /// Entry also requires the current price to be at or below this floor.
    pub entry_threshold_absolute: Decimal,

    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// Exit unconditionally once this many seconds of game time remain.
    pub exit_before_secs: i64,

    pub position_size_usd: Decimal,
    pub max_concurrent_positions_per_game: u32,
    pub max_concurrent_positions_total: u32,
    pub min_time_remaining_secs: i64,

    /// Overrides the engine-wide default confidence floor (4.E) for this sport.
    pub min_confidence: Option<f64>,

    pub kelly_enabled: bool,
    pub kelly_fraction: f64,
    pub kelly_min_position_usd: Decimal,
    pub kelly_max_position_usd: Decimal,
    pub min_kelly_sample_size: u32,
}

impl SportConfig {
    pub fn min_confidence_or_default(&self, engine_default: f64) -> f64 {
        self.min_confidence.unwrap_or(engine_default)
    }
}

/// Per-user safety and streak-governance settings. The kill switch is a latch,
/// not a predicate: once tripped it stays tripped until an operator clears it,
/// even across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub user_id: Uuid,
    pub bot_enabled: bool,
    pub max_daily_loss_usd: Decimal,

    pub kill_switch_triggered_at: Option<DateTime<Utc>>,
    pub kill_switch_reason: Option<String>,

    pub current_losing_streak: u32,
    pub max_losing_streak: u32,
    pub streak_reduction_enabled: bool,
    pub streak_reduction_pct_per_loss: f64,

    pub min_balance_threshold_usd: Decimal,
    pub balance_check_interval_secs: u64,

    pub notification_webhook_url: Option<String>,
}

impl GlobalSettings {
    pub fn is_kill_switch_latched(&self) -> bool {
        self.kill_switch_triggered_at.is_some()
    }

    /// Clearing the latch requires both an explicit operator action *and* that
    /// the balance is currently above threshold (per 4.H) — callers pass the
    /// freshly observed balance in, this is not a bare setter.
    pub fn try_clear_kill_switch(&mut self, current_balance_usd: Decimal) -> Result<(), String> {
        if current_balance_usd < self.min_balance_threshold_usd {
            return Err(format!(
                "balance {current_balance_usd} still below threshold {}",
                self.min_balance_threshold_usd
            ));
        }
        self.kill_switch_triggered_at = None;
        self.kill_switch_reason = None;
        Ok(())
    }

    pub fn latch_kill_switch(&mut self, reason: impl Into<String>) {
        self.kill_switch_triggered_at = Some(Utc::now());
        self.kill_switch_reason = Some(reason.into());
        self.bot_enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn settings() -> GlobalSettings {
        GlobalSettings {
            user_id: Uuid::new_v4(),
            bot_enabled: true,
            max_daily_loss_usd: dec!(500),
            kill_switch_triggered_at: None,
            kill_switch_reason: None,
            current_losing_streak: 0,
            max_losing_streak: 0,
            streak_reduction_enabled: true,
            streak_reduction_pct_per_loss: 0.1,
            min_balance_threshold_usd: dec!(100),
            balance_check_interval_secs: 30,
            notification_webhook_url: None,
        }
    }

    #[test]
    fn latch_sets_reason_and_disables_bot() {
        let mut s = settings();
        s.latch_kill_switch("balance below threshold");
        assert!(s.is_kill_switch_latched());
        assert!(!s.bot_enabled);
        assert_eq!(s.kill_switch_reason.as_deref(), Some("balance below threshold"));
    }

    #[test]
    fn clear_refuses_while_still_under_threshold() {
        let mut s = settings();
        s.latch_kill_switch("low balance");
        assert!(s.try_clear_kill_switch(dec!(95)).is_err());
        assert!(s.is_kill_switch_latched());
    }

    #[test]
    fn clear_succeeds_once_balance_recovers() {
        let mut s = settings();
        s.latch_kill_switch("low balance");
        assert!(s.try_clear_kill_switch(dec!(200)).is_ok());
        assert!(!s.is_kill_switch_latched());
    }
}
