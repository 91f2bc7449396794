//! Balance guardian: the kill-switch and losing-streak machinery (component H).

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};
use uuid::Uuid;

use crate::domain::{Account, AccountBalanceEntry, AccountSummary, GlobalSettings};
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::persistence::PersistencePort;

const BALANCE_FETCH_RETRIES: u32 = 3;
const BALANCE_FETCH_BACKOFF: Duration = Duration::from_secs(2);

/// Result of one balance sweep across a user's active accounts.
#[derive(Debug, Clone)]
pub struct BalanceCheckResult {
    pub total_balance_usd: Decimal,
    pub per_account: Vec<(Uuid, Decimal)>,
    /// Accounts whose balance fetch exhausted all retries; excluded from the
    /// sum rather than aborting the whole check.
    pub excluded_accounts: Vec<Uuid>,
}

/// What the evaluation loop should do as a result of this guardian pass.
#[derive(Debug, Clone)]
pub enum GuardianDecision {
    Normal { size_multiplier: f64 },
    KillSwitchLatched { reason: String },
    AlreadyLatched,
}

pub struct BalanceGuardian {
    store: Arc<dyn PersistencePort>,
}

impl BalanceGuardian {
    pub fn new(store: Arc<dyn PersistencePort>) -> Self {
        Self { store }
    }

    /// Fetches one account's balance with up to [`BALANCE_FETCH_RETRIES`]
    /// attempts at 2x backoff. A transient failure does not trip the switch;
    /// only total retry exhaustion excludes the account.
    async fn fetch_balance(&self, client: &dyn ExchangeClient) -> Option<Decimal> {
        let mut delay = BALANCE_FETCH_BACKOFF;
        for attempt in 1..=BALANCE_FETCH_RETRIES {
            match client.get_balance().await {
                Ok(balance) => match balance.balance.parse::<Decimal>() {
                    Ok(v) => return Some(v),
                    Err(e) => {
                        warn!(attempt, error = %e, "unparseable balance response");
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "balance fetch failed");
                }
            }
            if attempt < BALANCE_FETCH_RETRIES {
                sleep(delay).await;
                delay *= 2;
            }
        }
        None
    }

    /// Sums balances across `accounts`, excluding any whose adapter call
    /// exhausted retries (logged, not fatal).
    pub async fn check_balances(
        &self,
        accounts: &[Account],
        clients: &HashMap<Uuid, Arc<dyn ExchangeClient>>,
    ) -> BalanceCheckResult {
        let mut total = Decimal::ZERO;
        let mut per_account = Vec::new();
        let mut excluded = Vec::new();

        for account in accounts {
            let Some(client) = clients.get(&account.id) else {
                warn!(account_id = %account.id, "no exchange client bound for account, excluding from balance check");
                excluded.push(account.id);
                continue;
            };

            match self.fetch_balance(client.as_ref()).await {
                Some(balance) => {
                    total += balance;
                    per_account.push((account.id, balance));
                }
                None => {
                    error!(
                        account_id = %account.id,
                        "balance fetch exhausted all retries, excluding from sum"
                    );
                    excluded.push(account.id);
                }
            }
        }

        BalanceCheckResult {
            total_balance_usd: total,
            per_account,
            excluded_accounts: excluded,
        }
    }

    /// Runs one guardian pass: checks balances, latches the kill switch if
    /// the total falls below threshold, and returns the size multiplier the
    /// sizer should apply otherwise.
    pub async fn enforce(
        &self,
        user_id: Uuid,
        accounts: &[Account],
        clients: &HashMap<Uuid, Arc<dyn ExchangeClient>>,
    ) -> Result<GuardianDecision> {
        let mut settings = self.store.get_global_settings(user_id).await?;

        if settings.is_kill_switch_latched() {
            return Ok(GuardianDecision::AlreadyLatched);
        }

        let result = self.check_balances(accounts, clients).await;

        if result.total_balance_usd < settings.min_balance_threshold_usd {
            let reason = format!(
                "balance {} below threshold {}",
                result.total_balance_usd, settings.min_balance_threshold_usd
            );
            settings.latch_kill_switch(reason.clone());
            self.store.upsert_global_settings(&settings).await?;
            error!(user_id = %user_id, reason = %reason, "kill switch latched");
            return Ok(GuardianDecision::KillSwitchLatched { reason });
        }

        Ok(GuardianDecision::Normal {
            size_multiplier: Self::size_multiplier(&settings),
        })
    }

    /// `max(0.1, 1.0 - streak_reduction_pct * streak)` when reduction is
    /// enabled, `1.0` otherwise.
    pub fn size_multiplier(settings: &GlobalSettings) -> f64 {
        if !settings.streak_reduction_enabled {
            return 1.0;
        }
        let reduced = 1.0
            - settings.streak_reduction_pct_per_loss * settings.current_losing_streak as f64;
        reduced.max(0.1)
    }

    /// Updates streak counters after a position closes with realized P&L. A
    /// loss increments the streak (and `max_losing_streak` if it's a new
    /// high); a win resets it to zero.
    pub async fn record_closed_position(
        &self,
        user_id: Uuid,
        realized_pnl: Decimal,
    ) -> Result<()> {
        let mut settings = self.store.get_global_settings(user_id).await?;
        if realized_pnl < Decimal::ZERO {
            settings.current_losing_streak += 1;
            settings.max_losing_streak = settings.max_losing_streak.max(settings.current_losing_streak);
        } else {
            settings.current_losing_streak = 0;
        }
        self.store.upsert_global_settings(&settings).await
    }

    /// Clears the kill switch, but only when the current aggregate balance
    /// is again above threshold — this is an operator action, never automatic.
    pub async fn try_clear_kill_switch(
        &self,
        user_id: Uuid,
        accounts: &[Account],
        clients: &HashMap<Uuid, Arc<dyn ExchangeClient>>,
    ) -> Result<()> {
        let mut settings = self.store.get_global_settings(user_id).await?;
        let result = self.check_balances(accounts, clients).await;
        settings
            .try_clear_kill_switch(result.total_balance_usd)
            .map_err(crate::error::EngineError::Validation)?;
        self.store.upsert_global_settings(&settings).await
    }

    /// Operator read: per-account balances, allocation percentages, and
    /// whether the allocation vector currently sums to 100% (2B).
    pub async fn account_summary(
        &self,
        accounts: &[Account],
        clients: &HashMap<Uuid, Arc<dyn ExchangeClient>>,
    ) -> AccountSummary {
        let result = self.check_balances(accounts, clients).await;
        let balances: HashMap<Uuid, Decimal> = result.per_account.into_iter().collect();

        let entries: Vec<AccountBalanceEntry> = accounts
            .iter()
            .map(|a| AccountBalanceEntry {
                account_id: a.id,
                display_name: a.display_name.clone(),
                platform: a.platform,
                balance_usd: balances.get(&a.id).copied().unwrap_or(Decimal::ZERO),
                allocation_pct: a.allocation_pct,
                is_primary: a.is_primary,
                is_active: a.is_active,
            })
            .collect();

        AccountSummary {
            total_balance_usd: entries.iter().map(|e| e.balance_usd).sum(),
            allocations_valid: Account::allocations_valid(accounts),
            accounts: entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn settings(streak: u32, reduction_enabled: bool, pct: f64) -> GlobalSettings {
        GlobalSettings {
            user_id: Uuid::new_v4(),
            bot_enabled: true,
            max_daily_loss_usd: dec!(500),
            kill_switch_triggered_at: None,
            kill_switch_reason: None,
            current_losing_streak: streak,
            max_losing_streak: streak,
            streak_reduction_enabled: reduction_enabled,
            streak_reduction_pct_per_loss: pct,
            min_balance_threshold_usd: dec!(100),
            balance_check_interval_secs: 30,
            notification_webhook_url: None,
        }
    }

    #[test]
    fn size_multiplier_is_one_without_streak() {
        let s = settings(0, true, 0.1);
        assert_eq!(BalanceGuardian::size_multiplier(&s), 1.0);
    }

    #[test]
    fn size_multiplier_floors_at_point_one() {
        let s = settings(20, true, 0.1);
        assert_eq!(BalanceGuardian::size_multiplier(&s), 0.1);
    }

    #[test]
    fn size_multiplier_ignored_when_reduction_disabled() {
        let s = settings(5, false, 0.1);
        assert_eq!(BalanceGuardian::size_multiplier(&s), 1.0);
    }

    #[test]
    fn size_multiplier_scales_linearly_with_streak() {
        let s = settings(3, true, 0.1);
        assert!((BalanceGuardian::size_multiplier(&s) - 0.70).abs() < 1e-9);
    }
}
