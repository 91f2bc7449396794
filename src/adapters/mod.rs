//! Exchange adapters (component A): one module per exchange, sharing the
//! `ExchangeClient` capability trait in [`crate::exchange`], plus the
//! resilience primitives (retry/backoff + circuit breaker) both adapters
//! wrap their transport calls in.

pub mod kalshi_rest;
pub mod polymarket_clob;
pub mod resilience;

pub use kalshi_rest::KalshiClient;
pub use polymarket_clob::{
    AccountSummary, BalanceResponse, GammaEventInfo, MarketResponse, MarketSummary, OrderResponse,
    PolymarketClient, PositionResponse, TradeResponse,
};
pub use resilience::{BreakerState, CircuitBreaker};
