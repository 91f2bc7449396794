use thiserror::Error;

/// Crate-wide error type. Variants double as the error-kind taxonomy the
/// engine's loop layer dispatches on (section 7): `Transport` and
/// `RateLimited` are retried with backoff, `Auth` and `Fatal` halt the
/// affected user, `InsufficientBalance` triggers an immediate guardian
/// check, `Validation` and `Reconcile` are logged and the caller moves on,
/// `Conflict` returns the already-cached result instead of retrying.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Transport-level failures, distinct from a well-formed error response —
    // covers connect/read timeouts and connection resets the circuit
    // breaker and backoff policy react to.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Insufficient balance: need ${needed}, have ${available}")]
    InsufficientBalance {
        needed: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    // A write lost a race it should have won atomically (idempotency key
    // already claimed, allocation update conflicted with a concurrent one).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Reconciliation error: {0}")]
    Reconcile(String),

    // Unrecoverable: halts the affected user rather than retrying. Distinct
    // from Internal, which may still be transient.
    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Order-execution-specific errors (component G), collapsed into
/// [`EngineError::OrderSubmission`] at the engine boundary.
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Order already filled")]
    AlreadyFilled,

    #[error("Order already cancelled")]
    AlreadyCancelled,

    #[error("Partial fill: requested {requested}, filled {filled}")]
    PartialFill { requested: u64, filled: u64 },

    #[error("Price slippage exceeded: limit {limit}, actual {actual}")]
    SlippageExceeded {
        limit: rust_decimal::Decimal,
        actual: rust_decimal::Decimal,
    },

    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u8 },
}

/// Risk/guardian-specific errors (components H/J), collapsed into
/// [`EngineError::RiskLimitExceeded`] at the engine boundary.
#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("Max exposure exceeded: limit ${limit}, requested ${requested}")]
    MaxExposureExceeded {
        limit: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
    },

    #[error("Consecutive failures: {count} >= {threshold}")]
    ConsecutiveFailures { count: u32, threshold: u32 },

    #[error("Daily loss limit: current ${current}, limit ${limit}")]
    DailyLossLimit {
        current: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("Insufficient time remaining: {remaining_secs}s < {min_secs}s")]
    InsufficientTime { remaining_secs: u64, min_secs: u64 },

    #[error("Spread too wide: {spread_bps} bps > {max_bps} bps")]
    SpreadTooWide { spread_bps: u32, max_bps: u32 },

    #[error("Trading halted: {reason}")]
    TradingHalted { reason: String },
}

impl From<OrderError> for EngineError {
    fn from(err: OrderError) -> Self {
        EngineError::OrderSubmission(err.to_string())
    }
}

impl From<RiskError> for EngineError {
    fn from(err: RiskError) -> Self {
        EngineError::RiskLimitExceeded(err.to_string())
    }
}
