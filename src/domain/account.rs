//! Users and funded exchange accounts.
//!
//! An `Account` is one funded identity on one exchange (Kalshi-style CLOB-REST
//! or the Polymarket-style EVM CLOB). A `User` owns every other entity in the
//! engine; all process-wide state is partitioned by `user_id`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exchange::ExchangeKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub bot_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A single funded identity on one exchange.
///
/// Credentials are opaque to the core — they arrive already decrypted by the
/// out-of-scope credential-at-rest layer and are handed straight to the
/// matching exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform: ExchangeKind,
    pub display_name: String,
    /// Opaque credential blob (API key, RSA key, or wallet key material).
    #[serde(skip_serializing)]
    pub credentials: Vec<u8>,
    pub is_primary: bool,
    pub is_active: bool,
    pub allocation_pct: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Epsilon used when comparing allocation sums to 100%.
    pub const ALLOCATION_EPSILON: f64 = 0.01;

    /// `true` when the allocations of the given active accounts sum to 100%
    /// within [`Account::ALLOCATION_EPSILON`]. Per the data model invariant,
    /// this must hold before the set is used for routing.
    pub fn allocations_valid(active: &[Account]) -> bool {
        if active.is_empty() {
            return true;
        }
        let sum: Decimal = active.iter().map(|a| a.allocation_pct).sum();
        let target = Decimal::from(100);
        let diff = (sum - target).abs();
        diff.to_string().parse::<f64>().unwrap_or(f64::MAX) <= Self::ALLOCATION_EPSILON
    }

    /// At most one primary account per user — callers enforce this at the
    /// persistence boundary (a partial unique index on `is_primary = true`);
    /// this is a pure-function check usable before a write lands.
    pub fn at_most_one_primary(accounts: &[Account]) -> bool {
        accounts.iter().filter(|a| a.is_primary).count() <= 1
    }

    /// Sort accounts so account-id pooling and remainder-absorption are
    /// deterministic: primary first, then by display name.
    pub fn ordered_for_routing(mut accounts: Vec<Account>) -> Vec<Account> {
        accounts.sort_by(|a, b| {
            b.is_primary
                .cmp(&a.is_primary)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        accounts
    }
}

/// Read-only account summary surfaced to operators (2B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub total_balance_usd: Decimal,
    pub accounts: Vec<AccountBalanceEntry>,
    pub allocations_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalanceEntry {
    pub account_id: Uuid,
    pub display_name: String,
    pub platform: ExchangeKind,
    pub balance_usd: Decimal,
    pub allocation_pct: Decimal,
    pub is_primary: bool,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn account(pct: Decimal, primary: bool, name: &str) -> Account {
        Account {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            platform: ExchangeKind::Kalshi,
            display_name: name.to_string(),
            credentials: vec![],
            is_primary: primary,
            is_active: true,
            allocation_pct: pct,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn allocations_valid_within_epsilon() {
        let accounts = vec![account(dec!(60), true, "a"), account(dec!(40), false, "b")];
        assert!(Account::allocations_valid(&accounts));
    }

    #[test]
    fn allocations_invalid_when_not_summing_to_100() {
        let accounts = vec![account(dec!(60), true, "a"), account(dec!(30), false, "b")];
        assert!(!Account::allocations_valid(&accounts));
    }

    #[test]
    fn at_most_one_primary_enforced() {
        let accounts = vec![account(dec!(50), true, "a"), account(dec!(50), true, "b")];
        assert!(!Account::at_most_one_primary(&accounts));
    }

    #[test]
    fn routing_order_is_primary_first() {
        let accounts = vec![
            account(dec!(33), false, "b"),
            account(dec!(33), false, "c"),
            account(dec!(34), true, "a"),
        ];
        let ordered = Account::ordered_for_routing(accounts);
        assert!(ordered[0].is_primary);
    }
}
