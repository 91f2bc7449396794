//! Idempotent order submission (component G's supporting machinery).
//!
//! The key is `H(token, side, price, size, time_bucket)`: two submit attempts
//! for the same account inside the same time bucket collapse to one order.
//! Dedup is enforced twice — a process-wide [`DashMap`] catches the common
//! case (a retry a few hundred milliseconds later, same process) without a
//! database round trip, and [`crate::persistence::PersistencePort::try_create_idempotency_record`]
//! enforces it for real via a unique `(account_id, idempotency_key)` index so
//! a second engine process (or a restart) can't double-submit either.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{OrderIdempotencyRecord, OrderSide};
use crate::error::Result;
use crate::persistence::PersistencePort;

/// Width of the time bucket an order is hashed into. Two submits for the same
/// (account, token, side, price, size) land on the same key only if they fall
/// within the same 60s window.
pub const TIME_BUCKET_SECS: i64 = 60;

/// TTL for an idempotency record once created.
pub const RECORD_TTL_SECS: i64 = 60;

/// `H(token, side, price, size, time_bucket)`, hex-encoded SHA-256.
pub fn idempotency_key(
    token_id: &str,
    side: OrderSide,
    price: Decimal,
    size: u64,
    now: DateTime<Utc>,
) -> String {
    let bucket = now.timestamp() / TIME_BUCKET_SECS;
    let mut hasher = Sha256::new();
    hasher.update(token_id.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:?}", side).as_bytes());
    hasher.update(b"|");
    hasher.update(price.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(size.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Process-wide dedup map plus the persisted check-or-create call.
pub struct IdempotencyGuard {
    store: Arc<dyn PersistencePort>,
    in_flight: DashMap<(Uuid, String), ()>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn PersistencePort>) -> Self {
        Self {
            store,
            in_flight: DashMap::new(),
        }
    }

    /// Returns `true` when this call reserved the key (the caller should
    /// submit the order), `false` when the key is already claimed (the caller
    /// should treat this as a retry and look up the prior result instead).
    pub async fn reserve(&self, account_id: Uuid, key: &str) -> Result<bool> {
        let map_key = (account_id, key.to_string());
        if self.in_flight.contains_key(&map_key) {
            return Ok(false);
        }

        let now = Utc::now();
        let record = OrderIdempotencyRecord {
            account_id,
            idempotency_key: key.to_string(),
            order_result: None,
            created_at: now,
            expires_at: now + Duration::seconds(RECORD_TTL_SECS),
        };

        let created = self.store.try_create_idempotency_record(&record).await?;
        if created {
            self.in_flight.insert(map_key, ());
        }
        Ok(created)
    }

    pub async fn complete(
        &self,
        account_id: Uuid,
        key: &str,
        order_result: serde_json::Value,
    ) -> Result<()> {
        self.store
            .complete_idempotency_record(account_id, key, order_result)
            .await?;
        self.in_flight.remove(&(account_id, key.to_string()));
        Ok(())
    }

    pub async fn lookup(
        &self,
        account_id: Uuid,
        key: &str,
    ) -> Result<Option<OrderIdempotencyRecord>> {
        self.store.get_idempotency_record(account_id, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn same_inputs_same_bucket_produce_same_key() {
        let now = Utc::now();
        let a = idempotency_key("tok-1", OrderSide::Buy, dec!(0.48), 100, now);
        let b = idempotency_key("tok-1", OrderSide::Buy, dec!(0.48), 100, now);
        assert_eq!(a, b);
    }

    #[test]
    fn different_price_changes_key() {
        let now = Utc::now();
        let a = idempotency_key("tok-1", OrderSide::Buy, dec!(0.48), 100, now);
        let b = idempotency_key("tok-1", OrderSide::Buy, dec!(0.49), 100, now);
        assert_ne!(a, b);
    }

    #[test]
    fn different_time_bucket_changes_key() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(TIME_BUCKET_SECS + 5);
        let a = idempotency_key("tok-1", OrderSide::Buy, dec!(0.48), 100, t0);
        let b = idempotency_key("tok-1", OrderSide::Buy, dec!(0.48), 100, t1);
        assert_ne!(a, b);
    }
}
