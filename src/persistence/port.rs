//! Abstract persistence port for the live trading engine (component K).
//!
//! One method family per entity from the data model: fetch by id / by
//! filter, upsert, the atomic multi-row allocation update, and the
//! transactional "close position + write trade" operation. A concrete
//! `sqlx`-backed implementation lives in [`super::engine_store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    Account, AccountSummary, DiscoveredMarket, EnginePosition, EngineTrade, ExitReason,
    GlobalSettings, OrderIdempotencyRecord, ReconciliationRun, SportConfig, SyncStatusSummary,
    TrackedMarket,
};
use crate::error::Result;

/// Filter for open positions, used by the monitor loop and the reconciler.
#[derive(Debug, Clone, Default)]
pub struct OpenPositionFilter {
    pub user_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub tracked_market_id: Option<Uuid>,
}

#[async_trait]
pub trait PersistencePort: Send + Sync {
    // ---- Accounts ----
    async fn get_accounts(&self, user_id: Uuid) -> Result<Vec<Account>>;
    async fn get_active_accounts(&self, user_id: Uuid) -> Result<Vec<Account>>;
    async fn upsert_account(&self, account: &Account) -> Result<()>;
    /// Atomic multi-row allocation update — all account rows in one
    /// transaction, partial updates are forbidden.
    async fn set_allocations(&self, user_id: Uuid, allocations: &[(Uuid, Decimal)]) -> Result<()>;
    async fn set_primary(&self, user_id: Uuid, account_id: Uuid) -> Result<()>;
    async fn account_summary(&self, user_id: Uuid) -> Result<AccountSummary>;

    // ---- Settings ----
    async fn get_sport_config(&self, user_id: Uuid, sport: &str) -> Result<Option<SportConfig>>;
    async fn get_sport_configs(&self, user_id: Uuid) -> Result<Vec<SportConfig>>;
    async fn upsert_sport_config(&self, config: &SportConfig) -> Result<()>;
    async fn get_global_settings(&self, user_id: Uuid) -> Result<GlobalSettings>;
    async fn upsert_global_settings(&self, settings: &GlobalSettings) -> Result<()>;

    // ---- Tracked markets ----
    async fn get_tracked_market(&self, id: Uuid) -> Result<Option<TrackedMarket>>;
    async fn get_tracked_market_by_market_id(
        &self,
        user_id: Uuid,
        market_id: &str,
    ) -> Result<Option<TrackedMarket>>;
    async fn get_live_tracked_markets(&self, user_id: Uuid) -> Result<Vec<TrackedMarket>>;
    /// Conditional insert: only writes `baseline_*` fields the first time a
    /// market is observed. Returns the row as it now stands (existing row if
    /// one was already there, inserted row otherwise) — baseline capture is
    /// write-once per the invariant in spec section 3/5.
    async fn upsert_tracked_market_capturing_baseline(
        &self,
        market: &TrackedMarket,
    ) -> Result<TrackedMarket>;
    async fn update_tracked_market_price(
        &self,
        id: Uuid,
        yes_price: Decimal,
        no_price: Decimal,
    ) -> Result<()>;
    async fn mark_tracked_market_finished(&self, id: Uuid) -> Result<()>;

    // ---- Positions & trades ----
    async fn get_open_positions(&self, filter: OpenPositionFilter) -> Result<Vec<EnginePosition>>;
    async fn get_position(&self, id: Uuid) -> Result<Option<EnginePosition>>;
    async fn insert_position(&self, position: &EnginePosition) -> Result<()>;
    async fn update_position(&self, position: &EnginePosition) -> Result<()>;
    /// Transactional close: writes the position's terminal state and the
    /// corresponding trade row in one DB transaction.
    async fn close_position_with_trade(
        &self,
        position: &EnginePosition,
        trade: &EngineTrade,
    ) -> Result<()>;
    async fn get_pending_confirmations(&self, user_id: Uuid) -> Result<Vec<EnginePosition>>;

    // ---- Idempotency ----
    /// Atomic check-or-create: `INSERT ... ON CONFLICT DO NOTHING RETURNING`.
    /// Returns `true` when this call created the row (i.e. this is a new
    /// order), `false` when a live record already existed.
    async fn try_create_idempotency_record(&self, record: &OrderIdempotencyRecord)
        -> Result<bool>;
    async fn get_idempotency_record(
        &self,
        account_id: Uuid,
        key: &str,
    ) -> Result<Option<OrderIdempotencyRecord>>;
    async fn complete_idempotency_record(
        &self,
        account_id: Uuid,
        key: &str,
        order_result: serde_json::Value,
    ) -> Result<()>;

    // ---- Reconciliation ----
    async fn insert_reconciliation_run(&self, run: &ReconciliationRun) -> Result<()>;
    async fn sync_status_summary(&self, user_id: Uuid) -> Result<SyncStatusSummary>;

    // ---- Discovery cache (component C hand-off) ----
    async fn cache_discovered_markets(&self, markets: &[DiscoveredMarket]) -> Result<()>;
}

/// Convenience struct the monitor loop uses to close a position; kept
/// separate from [`EnginePosition`] so callers don't need a mutable handle on
/// the entity to describe an exit.
#[derive(Debug, Clone)]
pub struct PositionExit {
    pub position_id: Uuid,
    pub exit_price: Decimal,
    pub exit_size: u64,
    pub realized_pnl: Decimal,
    pub reason: ExitReason,
    pub at: DateTime<Utc>,
}
