//! Postgres-backed implementation of [`PersistencePort`].
//!
//! Plain `sqlx::query` with manual row mapping rather than `query_as`, so the
//! mapping stays explicit at the one place types cross the DB boundary.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{
    Account, AccountBalanceEntry, AccountSummary, DiscoveredMarket, EnginePosition, EngineTrade,
    EntryReason, ExitReason, FillStatus, GlobalSettings, MarketSide, OrderIdempotencyRecord,
    OrderSide, PositionStatus, ReconciliationRun, SportConfig, SyncStatus, SyncStatusSummary,
    TrackedMarket,
};
use crate::error::{EngineError, Result};
use crate::exchange::ExchangeKind;

use super::port::{OpenPositionFilter, PersistencePort};

#[derive(Clone)]
pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Engine store migrations completed");
        Ok(())
    }
}

fn fill_status_from_str(s: &str) -> FillStatus {
    match s {
        "partial" => FillStatus::Partial,
        "filled" => FillStatus::Filled,
        "cancelled" => FillStatus::Cancelled,
        "rejected" => FillStatus::Rejected,
        "timeout" => FillStatus::Timeout,
        _ => FillStatus::Pending,
    }
}

fn fill_status_as_str(s: FillStatus) -> &'static str {
    match s {
        FillStatus::Pending => "pending",
        FillStatus::Partial => "partial",
        FillStatus::Filled => "filled",
        FillStatus::Cancelled => "cancelled",
        FillStatus::Rejected => "rejected",
        FillStatus::Timeout => "timeout",
    }
}

fn sync_status_from_str(s: &str) -> SyncStatus {
    match s {
        "recovered" => SyncStatus::Recovered,
        "drift" => SyncStatus::Drift,
        "closed_reconciled" => SyncStatus::ClosedReconciled,
        _ => SyncStatus::Synced,
    }
}

fn sync_status_as_str(s: SyncStatus) -> &'static str {
    match s {
        SyncStatus::Synced => "synced",
        SyncStatus::Recovered => "recovered",
        SyncStatus::Drift => "drift",
        SyncStatus::ClosedReconciled => "closed_reconciled",
    }
}

fn entry_reason_as_str(r: EntryReason) -> &'static str {
    match r {
        EntryReason::BaselineDropSignal => "baseline_drop_signal",
        EntryReason::ManualOverride => "manual_override",
    }
}

fn entry_reason_from_str(s: &str) -> EntryReason {
    match s {
        "manual_override" => EntryReason::ManualOverride,
        _ => EntryReason::BaselineDropSignal,
    }
}

fn exit_reason_as_str(r: ExitReason) -> &'static str {
    match r {
        ExitReason::TakeProfit => "take_profit",
        ExitReason::StopLoss => "stop_loss",
        ExitReason::TimeExpiry => "time_expiry",
        ExitReason::Settlement => "settlement",
        ExitReason::ManualClose => "manual_close",
        ExitReason::NotFoundOnExchange => "not_found_on_exchange",
    }
}

fn exit_reason_from_str(s: &str) -> Option<ExitReason> {
    Some(match s {
        "take_profit" => ExitReason::TakeProfit,
        "stop_loss" => ExitReason::StopLoss,
        "time_expiry" => ExitReason::TimeExpiry,
        "settlement" => ExitReason::Settlement,
        "manual_close" => ExitReason::ManualClose,
        "not_found_on_exchange" => ExitReason::NotFoundOnExchange,
        _ => return None,
    })
}

fn row_to_position(row: &sqlx::postgres::PgRow) -> EnginePosition {
    let side: String = row.get("side");
    let fill_status: String = row.get("fill_status");
    let sync_status: String = row.get("sync_status");
    let status: String = row.get("status");
    let entry_reason: String = row.get("entry_reason");
    let exit_reason: Option<String> = row.get("exit_reason");

    EnginePosition {
        id: row.get("id"),
        user_id: row.get("user_id"),
        account_id: row.get("account_id"),
        tracked_market_id: row.get("tracked_market_id"),
        side: if side == "yes" {
            MarketSide::Yes
        } else {
            MarketSide::No
        },
        requested_entry_price: row.get("requested_entry_price"),
        actual_entry_price: row.get("actual_entry_price"),
        entry_size: row.get::<i64, _>("entry_size") as u64,
        fill_status: fill_status_from_str(&fill_status),
        confirmation_attempts: row.get::<i32, _>("confirmation_attempts") as u32,
        slippage: row.get("slippage"),
        sync_status: sync_status_from_str(&sync_status),
        recovery_source: row.get("recovery_source"),
        entry_reason: entry_reason_from_str(&entry_reason),
        exit_reason: exit_reason.and_then(|s| exit_reason_from_str(&s)),
        exit_price: row.get("exit_price"),
        exit_size: row
            .get::<Option<i64>, _>("exit_size")
            .map(|v| v as u64),
        realized_pnl: row.get("realized_pnl"),
        status: if status == "closed" {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        },
        opened_at: row.get("opened_at"),
        closed_at: row.get("closed_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl PersistencePort for PostgresEngineStore {
    async fn get_accounts(&self, user_id: Uuid) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"SELECT id, user_id, platform, display_name, credentials, is_primary,
                      is_active, allocation_pct, created_at, updated_at
               FROM engine_accounts WHERE user_id = $1 ORDER BY display_name"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let platform: String = r.get("platform");
                Account {
                    id: r.get("id"),
                    user_id: r.get("user_id"),
                    platform: ExchangeKind::from_str(&platform).unwrap_or(ExchangeKind::Polymarket),
                    display_name: r.get("display_name"),
                    credentials: r.get("credentials"),
                    is_primary: r.get("is_primary"),
                    is_active: r.get("is_active"),
                    allocation_pct: r.get("allocation_pct"),
                    created_at: r.get("created_at"),
                    updated_at: r.get("updated_at"),
                }
            })
            .collect())
    }

    async fn get_active_accounts(&self, user_id: Uuid) -> Result<Vec<Account>> {
        Ok(self
            .get_accounts(user_id)
            .await?
            .into_iter()
            .filter(|a| a.is_active)
            .collect())
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_accounts
                (id, user_id, platform, display_name, credentials, is_primary,
                 is_active, allocation_pct, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                credentials = EXCLUDED.credentials,
                is_primary = EXCLUDED.is_primary,
                is_active = EXCLUDED.is_active,
                allocation_pct = EXCLUDED.allocation_pct,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(account.id)
        .bind(account.user_id)
        .bind(account.platform.as_str())
        .bind(&account.display_name)
        .bind(&account.credentials)
        .bind(account.is_primary)
        .bind(account.is_active)
        .bind(account.allocation_pct)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_allocations(&self, user_id: Uuid, allocations: &[(Uuid, Decimal)]) -> Result<()> {
        let sum: Decimal = allocations.iter().map(|(_, pct)| *pct).sum();
        if (sum - Decimal::from(100)).abs() > Decimal::new(1, 2) {
            return Err(EngineError::Validation(format!(
                "allocations must sum to 100 +/- 0.01, got {sum}"
            )));
        }

        let mut tx = self.pool.begin().await?;
        for (account_id, pct) in allocations {
            sqlx::query(
                r#"UPDATE engine_accounts SET allocation_pct = $1, updated_at = NOW()
                   WHERE id = $2 AND user_id = $3"#,
            )
            .bind(pct)
            .bind(account_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_primary(&self, user_id: Uuid, account_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE engine_accounts SET is_primary = FALSE WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE engine_accounts SET is_primary = TRUE WHERE id = $1 AND user_id = $2",
        )
        .bind(account_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn account_summary(&self, user_id: Uuid) -> Result<AccountSummary> {
        let accounts = self.get_active_accounts(user_id).await?;
        // Balances are fetched live via the exchange adapters by the caller
        // (the guardian); the store only knows the routing-relevant fields.
        let entries: Vec<AccountBalanceEntry> = accounts
            .iter()
            .map(|a| AccountBalanceEntry {
                account_id: a.id,
                display_name: a.display_name.clone(),
                platform: a.platform,
                balance_usd: Decimal::ZERO,
                allocation_pct: a.allocation_pct,
                is_primary: a.is_primary,
                is_active: a.is_active,
            })
            .collect();
        Ok(AccountSummary {
            total_balance_usd: Decimal::ZERO,
            allocations_valid: Account::allocations_valid(&accounts),
            accounts: entries,
        })
    }

    async fn get_sport_config(&self, user_id: Uuid, sport: &str) -> Result<Option<SportConfig>> {
        let row = sqlx::query(
            r#"SELECT * FROM sport_configs WHERE user_id = $1 AND sport = $2"#,
        )
        .bind(user_id)
        .bind(sport)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_sport_config))
    }

    async fn get_sport_configs(&self, user_id: Uuid) -> Result<Vec<SportConfig>> {
        let rows = sqlx::query(r#"SELECT * FROM sport_configs WHERE user_id = $1"#)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_sport_config).collect())
    }

    async fn upsert_sport_config(&self, c: &SportConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sport_configs
                (user_id, sport, enabled, entry_threshold_drop_pct, entry_threshold_absolute,
                 take_profit_pct, stop_loss_pct, exit_before_secs, position_size_usd,
                 max_concurrent_positions_per_game, max_concurrent_positions_total,
                 min_time_remaining_secs, min_confidence, kelly_enabled, kelly_fraction,
                 kelly_min_position_usd, kelly_max_position_usd, min_kelly_sample_size)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            ON CONFLICT (user_id, sport) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                entry_threshold_drop_pct = EXCLUDED.entry_threshold_drop_pct,
                entry_threshold_absolute = EXCLUDED.entry_threshold_absolute,
                take_profit_pct = EXCLUDED.take_profit_pct,
                stop_loss_pct = EXCLUDED.stop_loss_pct,
                exit_before_secs = EXCLUDED.exit_before_secs,
                position_size_usd = EXCLUDED.position_size_usd,
                max_concurrent_positions_per_game = EXCLUDED.max_concurrent_positions_per_game,
                max_concurrent_positions_total = EXCLUDED.max_concurrent_positions_total,
                min_time_remaining_secs = EXCLUDED.min_time_remaining_secs,
                min_confidence = EXCLUDED.min_confidence,
                kelly_enabled = EXCLUDED.kelly_enabled,
                kelly_fraction = EXCLUDED.kelly_fraction,
                kelly_min_position_usd = EXCLUDED.kelly_min_position_usd,
                kelly_max_position_usd = EXCLUDED.kelly_max_position_usd,
                min_kelly_sample_size = EXCLUDED.min_kelly_sample_size
            "#,
        )
        .bind(c.user_id)
        .bind(&c.sport)
        .bind(c.enabled)
        .bind(c.entry_threshold_drop_pct)
        .bind(c.entry_threshold_absolute)
        .bind(c.take_profit_pct)
        .bind(c.stop_loss_pct)
        .bind(c.exit_before_secs)
        .bind(c.position_size_usd)
        .bind(c.max_concurrent_positions_per_game as i32)
        .bind(c.max_concurrent_positions_total as i32)
        .bind(c.min_time_remaining_secs)
        .bind(c.min_confidence)
        .bind(c.kelly_enabled)
        .bind(c.kelly_fraction)
        .bind(c.kelly_min_position_usd)
        .bind(c.kelly_max_position_usd)
        .bind(c.min_kelly_sample_size as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_global_settings(&self, user_id: Uuid) -> Result<GlobalSettings> {
        let row = sqlx::query(r#"SELECT * FROM global_settings WHERE user_id = $1"#)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => row_to_global_settings(&r),
            None => GlobalSettings {
                user_id,
                bot_enabled: false,
                max_daily_loss_usd: Decimal::ZERO,
                kill_switch_triggered_at: None,
                kill_switch_reason: None,
                current_losing_streak: 0,
                max_losing_streak: 0,
                streak_reduction_enabled: false,
                streak_reduction_pct_per_loss: 0.0,
                min_balance_threshold_usd: Decimal::ZERO,
                balance_check_interval_secs: 30,
                notification_webhook_url: None,
            },
        })
    }

    async fn upsert_global_settings(&self, s: &GlobalSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO global_settings
                (user_id, bot_enabled, max_daily_loss_usd, kill_switch_triggered_at,
                 kill_switch_reason, current_losing_streak, max_losing_streak,
                 streak_reduction_enabled, streak_reduction_pct_per_loss,
                 min_balance_threshold_usd, balance_check_interval_secs,
                 notification_webhook_url)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            ON CONFLICT (user_id) DO UPDATE SET
                bot_enabled = EXCLUDED.bot_enabled,
                max_daily_loss_usd = EXCLUDED.max_daily_loss_usd,
                kill_switch_triggered_at = EXCLUDED.kill_switch_triggered_at,
                kill_switch_reason = EXCLUDED.kill_switch_reason,
                current_losing_streak = EXCLUDED.current_losing_streak,
                max_losing_streak = EXCLUDED.max_losing_streak,
                streak_reduction_enabled = EXCLUDED.streak_reduction_enabled,
                streak_reduction_pct_per_loss = EXCLUDED.streak_reduction_pct_per_loss,
                min_balance_threshold_usd = EXCLUDED.min_balance_threshold_usd,
                balance_check_interval_secs = EXCLUDED.balance_check_interval_secs,
                notification_webhook_url = EXCLUDED.notification_webhook_url
            "#,
        )
        .bind(s.user_id)
        .bind(s.bot_enabled)
        .bind(s.max_daily_loss_usd)
        .bind(s.kill_switch_triggered_at)
        .bind(&s.kill_switch_reason)
        .bind(s.current_losing_streak as i32)
        .bind(s.max_losing_streak as i32)
        .bind(s.streak_reduction_enabled)
        .bind(s.streak_reduction_pct_per_loss)
        .bind(s.min_balance_threshold_usd)
        .bind(s.balance_check_interval_secs as i64)
        .bind(&s.notification_webhook_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tracked_market(&self, id: Uuid) -> Result<Option<TrackedMarket>> {
        let row = sqlx::query(r#"SELECT * FROM tracked_markets WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_tracked_market))
    }

    async fn get_tracked_market_by_market_id(
        &self,
        user_id: Uuid,
        market_id: &str,
    ) -> Result<Option<TrackedMarket>> {
        let row = sqlx::query(
            r#"SELECT * FROM tracked_markets WHERE user_id = $1 AND market_id = $2"#,
        )
        .bind(user_id)
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_tracked_market))
    }

    async fn get_live_tracked_markets(&self, user_id: Uuid) -> Result<Vec<TrackedMarket>> {
        let rows = sqlx::query(
            r#"SELECT * FROM tracked_markets
               WHERE user_id = $1 AND is_live = TRUE AND is_finished = FALSE"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_tracked_market).collect())
    }

    async fn upsert_tracked_market_capturing_baseline(
        &self,
        market: &TrackedMarket,
    ) -> Result<TrackedMarket> {
        // Baseline columns are only written on INSERT; ON CONFLICT leaves
        // them untouched, which is the write-once guarantee from spec
        // section 5 ("baseline capture is write-once ... protected by a
        // conditional insert").
        let row = sqlx::query(
            r#"
            INSERT INTO tracked_markets
                (id, user_id, exchange, market_id, sport, external_event_id, home_team,
                 away_team, game_start_time, baseline_yes_price, baseline_no_price,
                 baseline_captured_at, current_yes_price, current_no_price, current_phase,
                 total_phases, clock_time_remaining_secs, clock_captured_at, match_confidence,
                 is_live, is_finished, is_user_selected, auto_discovered, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25)
            ON CONFLICT (user_id, market_id) DO UPDATE SET
                current_yes_price = tracked_markets.current_yes_price,
                current_phase = EXCLUDED.current_phase,
                total_phases = EXCLUDED.total_phases,
                clock_time_remaining_secs = EXCLUDED.clock_time_remaining_secs,
                clock_captured_at = EXCLUDED.clock_captured_at,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(market.id)
        .bind(market.user_id)
        .bind(market.exchange.as_str())
        .bind(&market.market_id)
        .bind(&market.sport)
        .bind(&market.external_event_id)
        .bind(&market.home_team)
        .bind(&market.away_team)
        .bind(market.game_start_time)
        .bind(market.baseline_yes_price)
        .bind(market.baseline_no_price)
        .bind(market.baseline_captured_at)
        .bind(market.current_yes_price)
        .bind(market.current_no_price)
        .bind(market.current_phase as i32)
        .bind(market.total_phases as i32)
        .bind(market.clock_time_remaining_secs)
        .bind(market.clock_captured_at)
        .bind(market.match_confidence)
        .bind(market.is_live)
        .bind(market.is_finished)
        .bind(market.is_user_selected)
        .bind(market.auto_discovered)
        .bind(market.created_at)
        .bind(market.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_tracked_market(&row))
    }

    async fn update_tracked_market_price(
        &self,
        id: Uuid,
        yes_price: Decimal,
        no_price: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE tracked_markets SET current_yes_price = $1, current_no_price = $2,
               updated_at = NOW() WHERE id = $3"#,
        )
        .bind(yes_price)
        .bind(no_price)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_tracked_market_finished(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE tracked_markets SET is_finished = TRUE, is_live = FALSE,
               updated_at = NOW() WHERE id = $1"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_open_positions(&self, filter: OpenPositionFilter) -> Result<Vec<EnginePosition>> {
        // Hot path for the monitor loop; relies on the partial index on
        // status = 'open' described in spec section 6.
        let rows = sqlx::query(
            r#"SELECT * FROM engine_positions
               WHERE status = 'open'
                 AND ($1::uuid IS NULL OR user_id = $1)
                 AND ($2::uuid IS NULL OR account_id = $2)
                 AND ($3::uuid IS NULL OR tracked_market_id = $3)"#,
        )
        .bind(filter.user_id)
        .bind(filter.account_id)
        .bind(filter.tracked_market_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_position).collect())
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<EnginePosition>> {
        let row = sqlx::query(r#"SELECT * FROM engine_positions WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_position))
    }

    async fn insert_position(&self, p: &EnginePosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_positions
                (id, user_id, account_id, tracked_market_id, side, requested_entry_price,
                 actual_entry_price, entry_size, fill_status, confirmation_attempts, slippage,
                 sync_status, recovery_source, entry_reason, exit_reason, exit_price, exit_size,
                 realized_pnl, status, opened_at, closed_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22)
            "#,
        )
        .bind(p.id)
        .bind(p.user_id)
        .bind(p.account_id)
        .bind(p.tracked_market_id)
        .bind(if p.side == MarketSide::Yes { "yes" } else { "no" })
        .bind(p.requested_entry_price)
        .bind(p.actual_entry_price)
        .bind(p.entry_size as i64)
        .bind(fill_status_as_str(p.fill_status))
        .bind(p.confirmation_attempts as i32)
        .bind(p.slippage)
        .bind(sync_status_as_str(p.sync_status))
        .bind(&p.recovery_source)
        .bind(entry_reason_as_str(p.entry_reason))
        .bind(p.exit_reason.map(exit_reason_as_str))
        .bind(p.exit_price)
        .bind(p.exit_size.map(|v| v as i64))
        .bind(p.realized_pnl)
        .bind(if p.status == PositionStatus::Closed {
            "closed"
        } else {
            "open"
        })
        .bind(p.opened_at)
        .bind(p.closed_at)
        .bind(p.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_position(&self, p: &EnginePosition) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE engine_positions SET
                actual_entry_price = $1, fill_status = $2, confirmation_attempts = $3,
                slippage = $4, sync_status = $5, recovery_source = $6, exit_reason = $7,
                exit_price = $8, exit_size = $9, realized_pnl = $10, status = $11,
                closed_at = $12, updated_at = $13
            WHERE id = $14
            "#,
        )
        .bind(p.actual_entry_price)
        .bind(fill_status_as_str(p.fill_status))
        .bind(p.confirmation_attempts as i32)
        .bind(p.slippage)
        .bind(sync_status_as_str(p.sync_status))
        .bind(&p.recovery_source)
        .bind(p.exit_reason.map(exit_reason_as_str))
        .bind(p.exit_price)
        .bind(p.exit_size.map(|v| v as i64))
        .bind(p.realized_pnl)
        .bind(if p.status == PositionStatus::Closed {
            "closed"
        } else {
            "open"
        })
        .bind(p.closed_at)
        .bind(p.updated_at)
        .bind(p.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_position_with_trade(
        &self,
        position: &EnginePosition,
        trade: &EngineTrade,
    ) -> Result<()> {
        trade
            .validate()
            .map_err(EngineError::Validation)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE engine_positions SET
                status = 'closed', exit_price = $1, exit_size = $2, realized_pnl = $3,
                exit_reason = $4, closed_at = $5, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(position.exit_price)
        .bind(position.exit_size.map(|v| v as i64))
        .bind(position.realized_pnl)
        .bind(position.exit_reason.map(exit_reason_as_str))
        .bind(position.closed_at)
        .bind(position.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO engine_trades
                (id, position_id, order_side, price, size, exchange_order_id, executed_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(trade.id)
        .bind(trade.position_id)
        .bind(trade.order_side.to_string())
        .bind(trade.price)
        .bind(trade.size as i64)
        .bind(&trade.exchange_order_id)
        .bind(trade.executed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_pending_confirmations(&self, user_id: Uuid) -> Result<Vec<EnginePosition>> {
        let rows = sqlx::query(
            r#"SELECT * FROM engine_positions
               WHERE user_id = $1 AND fill_status IN ('pending', 'partial')"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_position).collect())
    }

    async fn try_create_idempotency_record(
        &self,
        record: &OrderIdempotencyRecord,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO order_idempotency_records
                (account_id, idempotency_key, order_result, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, idempotency_key) DO NOTHING
            RETURNING account_id
            "#,
        )
        .bind(record.account_id)
        .bind(&record.idempotency_key)
        .bind(&record.order_result)
        .bind(record.created_at)
        .bind(record.expires_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_idempotency_record(
        &self,
        account_id: Uuid,
        key: &str,
    ) -> Result<Option<OrderIdempotencyRecord>> {
        let row = sqlx::query(
            r#"SELECT * FROM order_idempotency_records
               WHERE account_id = $1 AND idempotency_key = $2 AND expires_at > NOW()"#,
        )
        .bind(account_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| OrderIdempotencyRecord {
            account_id: r.get("account_id"),
            idempotency_key: r.get("idempotency_key"),
            order_result: r.get("order_result"),
            created_at: r.get("created_at"),
            expires_at: r.get("expires_at"),
        }))
    }

    async fn complete_idempotency_record(
        &self,
        account_id: Uuid,
        key: &str,
        order_result: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE order_idempotency_records SET order_result = $1
               WHERE account_id = $2 AND idempotency_key = $3"#,
        )
        .bind(order_result)
        .bind(account_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_reconciliation_run(&self, run: &ReconciliationRun) -> Result<()> {
        if run.orphaned_count > 3 {
            warn!(
                user_id = %run.user_id,
                orphaned = run.orphaned_count,
                "reconciliation run exceeded orphan alert threshold"
            );
        }
        sqlx::query(
            r#"
            INSERT INTO reconciliation_runs
                (id, user_id, started_at, finished_at, synced_count, recovered_count,
                 closed_count, orphaned_count, errors)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(run.id)
        .bind(run.user_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.synced_count as i32)
        .bind(run.recovered_count as i32)
        .bind(run.closed_count as i32)
        .bind(run.orphaned_count as i32)
        .bind(serde_json::to_value(&run.errors).unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sync_status_summary(&self, user_id: Uuid) -> Result<SyncStatusSummary> {
        let rows = sqlx::query(
            r#"SELECT sync_status, COUNT(*) as cnt FROM engine_positions
               WHERE user_id = $1 AND status = 'open' GROUP BY sync_status"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SyncStatusSummary::default();
        for row in rows {
            let status: String = row.get("sync_status");
            let count: i64 = row.get("cnt");
            match sync_status_from_str(&status) {
                SyncStatus::Synced => summary.synced = count as u32,
                SyncStatus::Recovered => summary.recovered = count as u32,
                SyncStatus::Drift => summary.drift = count as u32,
                SyncStatus::ClosedReconciled => summary.closed_reconciled = count as u32,
            }
        }
        Ok(summary)
    }

    async fn cache_discovered_markets(&self, markets: &[DiscoveredMarket]) -> Result<()> {
        for m in markets {
            sqlx::query(
                r#"
                INSERT INTO discovered_markets_cache
                    (exchange, market_id, title, sport, end_time, liquidity, volume_24h,
                     yes_price, no_price, spread_pct, status_open, cached_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,NOW())
                ON CONFLICT (exchange, market_id) DO UPDATE SET
                    yes_price = EXCLUDED.yes_price,
                    no_price = EXCLUDED.no_price,
                    spread_pct = EXCLUDED.spread_pct,
                    status_open = EXCLUDED.status_open,
                    cached_at = NOW()
                "#,
            )
            .bind(m.exchange.as_str())
            .bind(&m.market_id)
            .bind(&m.title)
            .bind(&m.sport)
            .bind(m.end_time)
            .bind(m.liquidity)
            .bind(m.volume_24h)
            .bind(m.yes_price)
            .bind(m.no_price)
            .bind(m.spread_pct)
            .bind(m.status_open)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

fn row_to_sport_config(row: sqlx::postgres::PgRow) -> SportConfig {
    SportConfig {
        user_id: row.get("user_id"),
        sport: row.get("sport"),
        enabled: row.get("enabled"),
        entry_threshold_drop_pct: row.get("entry_threshold_drop_pct"),
        entry_threshold_absolute: row.get("entry_threshold_absolute"),
        take_profit_pct: row.get("take_profit_pct"),
        stop_loss_pct: row.get("stop_loss_pct"),
        exit_before_secs: row.get("exit_before_secs"),
        position_size_usd: row.get("position_size_usd"),
        max_concurrent_positions_per_game: row
            .get::<i32, _>("max_concurrent_positions_per_game")
            as u32,
        max_concurrent_positions_total: row.get::<i32, _>("max_concurrent_positions_total") as u32,
        min_time_remaining_secs: row.get("min_time_remaining_secs"),
        min_confidence: row.get("min_confidence"),
        kelly_enabled: row.get("kelly_enabled"),
        kelly_fraction: row.get("kelly_fraction"),
        kelly_min_position_usd: row.get("kelly_min_position_usd"),
        kelly_max_position_usd: row.get("kelly_max_position_usd"),
        min_kelly_sample_size: row.get::<i32, _>("min_kelly_sample_size") as u32,
    }
}

fn row_to_global_settings(row: &sqlx::postgres::PgRow) -> GlobalSettings {
    GlobalSettings {
        user_id: row.get("user_id"),
        bot_enabled: row.get("bot_enabled"),
        max_daily_loss_usd: row.get("max_daily_loss_usd"),
        kill_switch_triggered_at: row.get("kill_switch_triggered_at"),
        kill_switch_reason: row.get("kill_switch_reason"),
        current_losing_streak: row.get::<i32, _>("current_losing_streak") as u32,
        max_losing_streak: row.get::<i32, _>("max_losing_streak") as u32,
        streak_reduction_enabled: row.get("streak_reduction_enabled"),
        streak_reduction_pct_per_loss: row.get("streak_reduction_pct_per_loss"),
        min_balance_threshold_usd: row.get("min_balance_threshold_usd"),
        balance_check_interval_secs: row.get::<i64, _>("balance_check_interval_secs") as u64,
        notification_webhook_url: row.get("notification_webhook_url"),
    }
}

fn row_to_tracked_market(row: &sqlx::postgres::PgRow) -> TrackedMarket {
    let exchange: String = row.get("exchange");
    TrackedMarket {
        id: row.get("id"),
        user_id: row.get("user_id"),
        exchange: ExchangeKind::from_str(&exchange).unwrap_or(ExchangeKind::Polymarket),
        market_id: row.get("market_id"),
        sport: row.get("sport"),
        external_event_id: row.get("external_event_id"),
        home_team: row.get("home_team"),
        away_team: row.get("away_team"),
        game_start_time: row.get("game_start_time"),
        baseline_yes_price: row.get("baseline_yes_price"),
        baseline_no_price: row.get("baseline_no_price"),
        baseline_captured_at: row.get("baseline_captured_at"),
        current_yes_price: row.get("current_yes_price"),
        current_no_price: row.get("current_no_price"),
        current_phase: row.get::<i32, _>("current_phase").max(0) as u32,
        total_phases: row.get::<i32, _>("total_phases").max(1) as u32,
        clock_time_remaining_secs: row.get("clock_time_remaining_secs"),
        clock_captured_at: row.get("clock_captured_at"),
        match_confidence: row.get("match_confidence"),
        is_live: row.get("is_live"),
        is_finished: row.get("is_finished"),
        is_user_selected: row.get("is_user_selected"),
        auto_discovered: row.get("auto_discovered"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
