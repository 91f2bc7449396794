//! Held stakes, executions, and the bookkeeping that keeps order submission
//! idempotent and reconciliation auditable.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tracked_market::MarketSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Timeout,
}

impl FillStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FillStatus::Filled
                | FillStatus::Cancelled
                | FillStatus::Rejected
                | FillStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Recovered,
    Drift,
    ClosedReconciled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    BaselineDropSignal,
    ManualOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TimeExpiry,
    Settlement,
    ManualClose,
    NotFoundOnExchange,
}

/// A held stake, one row per account/market/side the engine has opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePosition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub tracked_market_id: Uuid,

    pub side: MarketSide,
    pub requested_entry_price: Decimal,
    pub actual_entry_price: Option<Decimal>,
    pub entry_size: u64,

    pub fill_status: FillStatus,
    pub confirmation_attempts: u32,
    pub slippage: Option<Decimal>,

    pub sync_status: SyncStatus,
    pub recovery_source: Option<String>,

    pub entry_reason: EntryReason,
    pub exit_reason: Option<ExitReason>,
    pub exit_price: Option<Decimal>,
    pub exit_size: Option<u64>,

    pub realized_pnl: Option<Decimal>,
    pub status: PositionStatus,

    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EnginePosition {
    /// `0 <= entry_price <= 1`, `entry_size > 0`, `exit_price in [0,1]` — the
    /// quantified invariants from spec section 8.
    pub fn validate(&self) -> Result<(), String> {
        if !(Decimal::ZERO..=Decimal::ONE).contains(&self.requested_entry_price) {
            return Err(format!(
                "requested_entry_price {} out of [0,1]",
                self.requested_entry_price
            ));
        }
        if self.entry_size == 0 {
            return Err("entry_size must be > 0".into());
        }
        if let Some(exit) = self.exit_price {
            if !(Decimal::ZERO..=Decimal::ONE).contains(&exit) {
                return Err(format!("exit_price {exit} out of [0,1]"));
            }
        }
        Ok(())
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Option<Decimal> {
        let entry = self.actual_entry_price?;
        Some((current_price - entry) * Decimal::from(self.entry_size))
    }

    pub fn profit_pct(&self, current_price: Decimal) -> Option<f64> {
        let entry = self.actual_entry_price?;
        if entry <= Decimal::ZERO {
            return None;
        }
        let pct = (current_price - entry) / entry * Decimal::from(100);
        pct.to_string().parse::<f64>().ok()
    }

    /// Close a position exactly once; a second call is a programming error in
    /// the caller (positions transition to closed exactly once per the
    /// invariant in spec section 3), so this is a hard assertion, not a
    /// recoverable error path.
    pub fn close(
        &mut self,
        exit_price: Decimal,
        exit_size: u64,
        realized_pnl: Decimal,
        reason: ExitReason,
    ) {
        assert_eq!(
            self.status,
            PositionStatus::Open,
            "position {} already closed",
            self.id
        );
        self.exit_price = Some(exit_price);
        self.exit_size = Some(exit_size);
        self.realized_pnl = Some(realized_pnl);
        self.exit_reason = Some(reason);
        self.status = PositionStatus::Closed;
        self.closed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

/// An individual execution record associated with a position; immutable once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTrade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub order_side: super::order::OrderSide,
    pub price: Decimal,
    pub size: u64,
    pub exchange_order_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl EngineTrade {
    pub fn validate(&self) -> Result<(), String> {
        if !(Decimal::ZERO..=Decimal::ONE).contains(&self.price) {
            return Err(format!("trade price {} out of [0,1]", self.price));
        }
        if self.size == 0 {
            return Err("trade size must be > 0".into());
        }
        Ok(())
    }
}

/// Short-lived dedup record for order submission (TTL ~= 60s per spec). Keyed
/// on `H(token, side, price, size, time_bucket)`; persisted so dedup survives
/// a process restart, backed by a unique `(account_id, idempotency_key)`
/// index and an atomic `INSERT ... ON CONFLICT DO NOTHING RETURNING`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIdempotencyRecord {
    pub account_id: Uuid,
    pub idempotency_key: String,
    pub order_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One pass of the position reconciler; append-only audit row, not load
/// bearing for live logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub synced_count: u32,
    pub recovered_count: u32,
    pub closed_count: u32,
    pub orphaned_count: u32,
    pub errors: Vec<String>,
}

/// Grouped count of positions by sync status (2B operator read).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatusSummary {
    pub synced: u32,
    pub recovered: u32,
    pub drift: u32,
    pub closed_reconciled: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_position() -> EnginePosition {
        EnginePosition {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            tracked_market_id: Uuid::new_v4(),
            side: MarketSide::Yes,
            requested_entry_price: dec!(0.48),
            actual_entry_price: Some(dec!(0.48)),
            entry_size: 104,
            fill_status: FillStatus::Filled,
            confirmation_attempts: 1,
            slippage: Some(dec!(0.00)),
            sync_status: SyncStatus::Synced,
            recovery_source: None,
            entry_reason: EntryReason::BaselineDropSignal,
            exit_reason: None,
            exit_price: None,
            exit_size: None,
            realized_pnl: None,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_rejects_out_of_range_entry_price() {
        let mut pos = open_position();
        pos.requested_entry_price = dec!(1.2);
        assert!(pos.validate().is_err());
    }

    #[test]
    fn take_profit_scenario_matches_spec_8_2() {
        let pos = open_position();
        let profit_pct = pos.profit_pct(dec!(0.58)).unwrap();
        assert!((profit_pct - 20.833).abs() < 0.01);
        let pnl = pos.unrealized_pnl(dec!(0.58)).unwrap();
        assert!((pnl - dec!(10.40)).abs() < dec!(0.01));
    }

    #[test]
    fn close_transitions_exactly_once() {
        let mut pos = open_position();
        pos.close(dec!(0.58), 104, dec!(10.40), ExitReason::TakeProfit);
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    #[should_panic(expected = "already closed")]
    fn close_twice_panics() {
        let mut pos = open_position();
        pos.close(dec!(0.58), 104, dec!(10.40), ExitReason::TakeProfit);
        pos.close(dec!(0.58), 104, dec!(10.40), ExitReason::TakeProfit);
    }

    #[test]
    fn fill_status_terminal_set_matches_spec() {
        assert!(FillStatus::Filled.is_terminal());
        assert!(FillStatus::Cancelled.is_terminal());
        assert!(FillStatus::Rejected.is_terminal());
        assert!(FillStatus::Timeout.is_terminal());
        assert!(!FillStatus::Pending.is_terminal());
        assert!(!FillStatus::Partial.is_terminal());
    }
}
