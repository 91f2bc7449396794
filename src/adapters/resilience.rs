//! Shared resilience machinery for exchange adapters (4.A): exponential
//! backoff retries plus a small per-adapter circuit breaker, adapted from the
//! coordination layer's `TradingCircuitBreaker` down to the exact knobs the
//! adapters need — three consecutive failures open the breaker for 30s.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{EngineError, Result};

const FAILURE_THRESHOLD: u32 = 3;
const OPEN_DURATION_SECS: i64 = 30;
const MAX_RETRY_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-adapter-instance circuit breaker. Three consecutive failures open the
/// breaker for 30s; calls made while open fail fast tagged as `Transport`
/// rather than waiting on the network. One trial call is allowed through
/// once the window elapses (half-open); its outcome closes or reopens.
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    opened_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    half_open_in_flight: Arc<RwLock<bool>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at: Arc::new(RwLock::new(None)),
            half_open_in_flight: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn state(&self) -> BreakerState {
        let opened_at = *self.opened_at.read().await;
        match opened_at {
            None => BreakerState::Closed,
            Some(at) => {
                let elapsed = (Utc::now() - at).num_seconds();
                if elapsed >= OPEN_DURATION_SECS {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    /// Returns an error with the transport tag if the breaker is open, else
    /// reserves the single half-open trial slot if applicable.
    async fn admit(&self) -> Result<()> {
        match self.state().await {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(EngineError::Transport(
                "circuit breaker open, failing fast".to_string(),
            )),
            BreakerState::HalfOpen => {
                let mut in_flight = self.half_open_in_flight.write().await;
                if *in_flight {
                    return Err(EngineError::Transport(
                        "circuit breaker half-open trial already in flight".to_string(),
                    ));
                }
                *in_flight = true;
                Ok(())
            }
        }
    }

    async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.write().await = None;
        *self.half_open_in_flight.write().await = false;
    }

    async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.half_open_in_flight.write().await = false;
        if failures >= FAILURE_THRESHOLD {
            let mut opened_at = self.opened_at.write().await;
            if opened_at.is_none()
                || (Utc::now() - opened_at.unwrap()).num_seconds() >= OPEN_DURATION_SECS
            {
                warn!(failures, "circuit breaker opening for 30s");
            }
            *opened_at = Some(Utc::now());
        }
    }

    /// Runs `op` (itself already wrapped in [`retry_with_backoff`] by the
    /// caller as needed) through the breaker, recording the outcome.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.admit().await?;
        match op().await {
            Ok(v) => {
                self.record_success().await;
                Ok(v)
            }
            Err(e) => {
                self.record_failure().await;
                Err(e)
            }
        }
    }
}

/// Retries `op` up to [`MAX_RETRY_ATTEMPTS`] times with exponential (base 2x)
/// backoff starting at 500ms, retrying only transient-looking failures
/// (`Transport`/`RateLimited`). Other error kinds are returned immediately.
pub async fn retry_with_backoff<F, Fut, T>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = BACKOFF_BASE;
    let mut last_err = None;

    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e @ (EngineError::Transport(_) | EngineError::RateLimited(_))) => {
                warn!(attempt, error = %e, "transient adapter failure, retrying");
                last_err = Some(e);
                if attempt < MAX_RETRY_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| EngineError::Transport("retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;

    #[tokio::test]
    async fn opens_after_three_consecutive_failures() {
        let cb = CircuitBreaker::new();
        for _ in 0..3 {
            let _ = cb
                .call(|| async { Err::<(), _>(EngineError::Transport("boom".into())) })
                .await;
        }
        assert_eq!(cb.state().await, BreakerState::Open);

        let result = cb.call(|| async { Ok::<_, EngineError>(()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn closed_on_success() {
        let cb = CircuitBreaker::new();
        let result = cb.call(|| async { Ok::<_, EngineError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let attempts = Counter::new(0);
        let result: Result<()> = retry_with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Transport("always fails".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_with_backoff_stops_on_non_transient_error() {
        let attempts = Counter::new(0);
        let result: Result<()> = retry_with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Validation("bad request".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
