//! Position reconciler: diffs local open positions against each exchange
//! and adopts, closes, or flags the difference (component I).
//!
//! Runs every 5 minutes while the engine is running, and once at startup
//! before the evaluation loop begins (4.J). The reconciler only *proposes*
//! transitions; in this implementation it is the sole writer of
//! reconciliation-driven state, but it never touches a position the
//! evaluation/monitor loops are mid-transaction with, since all writes go
//! through [`crate::persistence::PersistencePort`]'s single-row operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, warn};
use uuid::Uuid;

use super::notifier::{Notification, Notifier};
use crate::domain::{
    Account, EnginePosition, ExitReason, FillStatus, MarketSide, PositionStatus,
    ReconciliationRun, SyncStatus,
};
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::persistence::{OpenPositionFilter, PersistencePort};

/// Orphaned on-exchange positions beyond this count in one run additionally
/// raise a critical alert rather than only per-item ones (4.I step 5).
pub const ORPHAN_ALERT_THRESHOLD: u32 = 3;

/// One on-exchange holding, normalized across adapters to (account, market,
/// side) plus the quantity/avg-cost the reconciler needs to recover a
/// position from it.
#[derive(Debug, Clone)]
struct ExchangeHolding {
    account_id: Uuid,
    market_id: String,
    side: MarketSide,
    quantity: u64,
    avg_cost: Decimal,
}

pub struct PositionReconciler {
    store: Arc<dyn PersistencePort>,
    notifier: Arc<Notifier>,
}

impl PositionReconciler {
    pub fn new(store: Arc<dyn PersistencePort>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }

    async fn fetch_exchange_holdings(
        &self,
        accounts: &[Account],
        clients: &HashMap<Uuid, Arc<dyn ExchangeClient>>,
    ) -> Vec<ExchangeHolding> {
        let mut holdings = Vec::new();
        for account in accounts {
            let Some(client) = clients.get(&account.id) else {
                continue;
            };
            match client.get_positions().await {
                Ok(positions) => {
                    for p in positions {
                        let Some(market_id) = p.condition_id.clone().or_else(|| p.token_id.clone())
                        else {
                            continue;
                        };
                        let Ok(quantity) = p.size.parse::<f64>() else {
                            continue;
                        };
                        if quantity <= 0.0 {
                            continue;
                        }
                        let avg_cost = p
                            .avg_price
                            .as_ref()
                            .and_then(|s| s.parse::<Decimal>().ok())
                            .unwrap_or(Decimal::ZERO);
                        let side = match p.outcome.as_deref() {
                            Some(o) if o.eq_ignore_ascii_case("no") => MarketSide::No,
                            _ => MarketSide::Yes,
                        };
                        holdings.push(ExchangeHolding {
                            account_id: account.id,
                            market_id,
                            side,
                            quantity: quantity.round() as u64,
                            avg_cost,
                        });
                    }
                }
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "reconciler failed to fetch exchange positions, excluding account this pass");
                }
            }
        }
        holdings
    }

    /// Runs one reconciliation pass for `user_id` across `accounts`.
    pub async fn run(
        &self,
        user_id: Uuid,
        accounts: &[Account],
        clients: &HashMap<Uuid, Arc<dyn ExchangeClient>>,
    ) -> Result<ReconciliationRun> {
        let started_at = chrono::Utc::now();
        let mut run = ReconciliationRun {
            id: Uuid::new_v4(),
            user_id,
            started_at,
            finished_at: None,
            synced_count: 0,
            recovered_count: 0,
            closed_count: 0,
            orphaned_count: 0,
            errors: Vec::new(),
        };

        let webhook_url = self
            .store
            .get_global_settings(user_id)
            .await
            .ok()
            .and_then(|s| s.notification_webhook_url);

        let holdings = self.fetch_exchange_holdings(accounts, clients).await;
        let local = self
            .store
            .get_open_positions(OpenPositionFilter {
                user_id: Some(user_id),
                account_id: None,
                tracked_market_id: None,
            })
            .await?;

        // (account_id, market_id, side) -> local position, resolved via each
        // position's tracked market.
        let mut local_by_key: HashMap<(Uuid, String, MarketSide), EnginePosition> = HashMap::new();
        for pos in local {
            match self.store.get_tracked_market(pos.tracked_market_id).await {
                Ok(Some(market)) => {
                    local_by_key.insert((pos.account_id, market.market_id.clone(), pos.side), pos);
                }
                Ok(None) => {
                    run.errors.push(format!(
                        "position {} references missing tracked market {}",
                        pos.id, pos.tracked_market_id
                    ));
                }
                Err(e) => {
                    run.errors.push(format!("failed to load tracked market: {e}"));
                }
            }
        }

        let mut matched_local_keys: HashSet<(Uuid, String, MarketSide)> = HashSet::new();

        for holding in &holdings {
            let key = (holding.account_id, holding.market_id.clone(), holding.side);
            if let Some(local_pos) = local_by_key.get(&key) {
                matched_local_keys.insert(key);
                if local_pos.sync_status != SyncStatus::Synced {
                    let mut synced = local_pos.clone();
                    synced.sync_status = SyncStatus::Synced;
                    synced.updated_at = chrono::Utc::now();
                    self.store.update_position(&synced).await?;
                }
                run.synced_count += 1;
                continue;
            }

            // E \ L: an on-exchange holding this bot has no local record of.
            run.orphaned_count += 1;
            run.recovered_count += 1;

            let adapter_kind = clients
                .get(&holding.account_id)
                .map(|c| c.kind().as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());

            let tracked_market = match self
                .store
                .get_tracked_market_by_market_id(user_id, &holding.market_id)
                .await
            {
                Ok(Some(m)) => m,
                Ok(None) => {
                    run.errors.push(format!(
                        "no tracked market for recovered holding {}/{}",
                        holding.account_id, holding.market_id
                    ));
                    continue;
                }
                Err(e) => {
                    run.errors.push(format!("failed to load tracked market: {e}"));
                    continue;
                }
            };

            let recovered = EnginePosition {
                id: Uuid::new_v4(),
                user_id,
                account_id: holding.account_id,
                tracked_market_id: tracked_market.id,
                side: holding.side,
                requested_entry_price: holding.avg_cost,
                actual_entry_price: Some(holding.avg_cost),
                entry_size: holding.quantity,
                fill_status: FillStatus::Filled,
                confirmation_attempts: 0,
                slippage: None,
                sync_status: SyncStatus::Recovered,
                recovery_source: Some(adapter_kind),
                entry_reason: crate::domain::EntryReason::ManualOverride,
                exit_reason: None,
                exit_price: None,
                exit_size: None,
                realized_pnl: None,
                status: PositionStatus::Open,
                opened_at: chrono::Utc::now(),
                closed_at: None,
                updated_at: chrono::Utc::now(),
            };

            if let Err(e) = self.store.insert_position(&recovered).await {
                run.errors.push(format!("failed to insert recovered position: {e}"));
                continue;
            }

            warn!(
                account_id = %holding.account_id,
                market_id = %holding.market_id,
                quantity = holding.quantity,
                "recovered position with no local record"
            );
            self.notifier
                .notify(
                    webhook_url.as_deref(),
                    &Notification::orphaned_order(
                        &holding.market_id,
                        holding.account_id,
                        holding.side,
                        holding.quantity,
                        holding.avg_cost,
                    ),
                )
                .await;
        }

        // L \ E: locally open positions the exchange no longer reports.
        for (key, local_pos) in local_by_key.iter() {
            if matched_local_keys.contains(key) {
                continue;
            }
            let mut closed = local_pos.clone();
            closed.sync_status = SyncStatus::ClosedReconciled;
            closed.close(
                closed.actual_entry_price.unwrap_or(closed.requested_entry_price),
                closed.entry_size,
                Decimal::ZERO,
                ExitReason::NotFoundOnExchange,
            );
            if let Err(e) = self.store.update_position(&closed).await {
                run.errors.push(format!("failed to close orphaned local position: {e}"));
                continue;
            }
            run.closed_count += 1;
            warn!(position_id = %local_pos.id, "local position closed, not found on exchange");
        }

        if run.closed_count > ORPHAN_ALERT_THRESHOLD {
            self.notifier
                .notify(
                    webhook_url.as_deref(),
                    &Notification::reconciliation_anomaly(format!(
                        "{} local positions closed as not found on exchange in one run",
                        run.closed_count
                    )),
                )
                .await;
        }

        run.finished_at = Some(chrono::Utc::now());
        if let Err(e) = self.store.insert_reconciliation_run(&run).await {
            error!(error = %e, "failed to persist reconciliation run");
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_alert_threshold_matches_spec_default() {
        assert_eq!(ORPHAN_ALERT_THRESHOLD, 3);
    }
}
