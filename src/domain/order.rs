use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tracked_market::MarketSide;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
    /// Immediate Or Cancel
    IOC,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order created but not yet submitted
    Pending,
    /// Order submitted to exchange
    Submitted,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by exchange
    Rejected,
    /// Order expired
    Expired,
    /// Order failed (internal error)
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

/// An order we want an exchange adapter to place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub token_id: String,
    pub market_side: MarketSide,
    pub order_side: OrderSide,
    pub shares: u64,
    pub limit_price: Decimal,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn buy_limit(
        token_id: String,
        market_side: MarketSide,
        shares: u64,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id,
            market_side,
            order_side: OrderSide::Buy,
            shares,
            limit_price: price,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GTC,
        }
    }

    pub fn sell_limit(
        token_id: String,
        market_side: MarketSide,
        shares: u64,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id,
            market_side,
            order_side: OrderSide::Sell,
            shares,
            limit_price: price,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GTC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_limit_defaults_to_gtc() {
        let req = OrderRequest::buy_limit("token-1".to_string(), MarketSide::Yes, 100, dec!(0.45));
        assert_eq!(req.order_side, OrderSide::Buy);
        assert_eq!(req.order_type, OrderType::Limit);
        assert!(matches!(req.time_in_force, TimeInForce::GTC));
    }

    #[test]
    fn sell_limit_sets_sell_side() {
        let req = OrderRequest::sell_limit("token-1".to_string(), MarketSide::No, 50, dec!(0.30));
        assert_eq!(req.order_side, OrderSide::Sell);
        assert_eq!(req.market_side, MarketSide::No);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::Submitted.is_active());
    }
}
