//! Order model and bot-role classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Side, TrailingLevel};

/// Client order id prefixes for orders this engine places.
pub const CLIENT_ID_ENTRY: &str = "pm-en-";
pub const CLIENT_ID_STOP_LOSS: &str = "pm-sl-";
pub const CLIENT_ID_TAKE_PROFIT: &str = "pm-tp-";
pub const CLIENT_ID_PARTIAL_REDUCE: &str = "pm-pr-";

/// Exchange order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    /// Parse an exchange status string. `EXPIRED_IN_MATCH` and `NEW_*`
    /// variants fold into their base statuses.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" | "NEW_INSURANCE" | "NEW_ADL" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// Exchange order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopMarket,
    TakeProfit,
    TakeProfitMarket,
    TrailingStopMarket,
    Liquidation,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderType::TrailingStopMarket => "TRAILING_STOP_MARKET",
            OrderType::Liquidation => "LIQUIDATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            "STOP" => Some(OrderType::Stop),
            "STOP_MARKET" => Some(OrderType::StopMarket),
            "TAKE_PROFIT" => Some(OrderType::TakeProfit),
            "TAKE_PROFIT_MARKET" => Some(OrderType::TakeProfitMarket),
            "TRAILING_STOP_MARKET" => Some(OrderType::TrailingStopMarket),
            "LIQUIDATION" => Some(OrderType::Liquidation),
            _ => None,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            OrderType::Stop | OrderType::StopMarket | OrderType::TrailingStopMarket
        )
    }

    pub fn is_take_profit(&self) -> bool {
        matches!(self, OrderType::TakeProfit | OrderType::TakeProfitMarket)
    }
}

/// What the engine uses an order for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotRole {
    Entry,
    StopLoss,
    TakeProfit,
    PartialReduce,
    Liquidation,
    Adl,
    Settlement,
    Manual,
}

impl BotRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotRole::Entry => "ENTRY",
            BotRole::StopLoss => "STOP_LOSS",
            BotRole::TakeProfit => "TAKE_PROFIT",
            BotRole::PartialReduce => "PARTIAL_REDUCE",
            BotRole::Liquidation => "LIQUIDATION",
            BotRole::Adl => "ADL",
            BotRole::Settlement => "SETTLEMENT",
            BotRole::Manual => "MANUAL",
        }
    }

    /// Roles whose fill closes or shrinks exposure.
    pub fn is_exit(&self) -> bool {
        !matches!(self, BotRole::Entry | BotRole::Manual)
    }
}

/// Infer the role of an order the engine has never seen.
///
/// Exchange-generated client ids take precedence, then our own prefixes,
/// then the order type and flags.
pub fn infer_role(
    order_type: OrderType,
    client_order_id: &str,
    reduce_only: bool,
    close_position: bool,
) -> BotRole {
    if client_order_id.starts_with("adl_autoclose") {
        return BotRole::Adl;
    }
    if client_order_id.starts_with("settlement_autoclose") {
        return BotRole::Settlement;
    }
    if client_order_id.starts_with("autoclose-") || order_type == OrderType::Liquidation {
        return BotRole::Liquidation;
    }
    if client_order_id.starts_with(CLIENT_ID_ENTRY) {
        return BotRole::Entry;
    }
    if client_order_id.starts_with(CLIENT_ID_STOP_LOSS) {
        return BotRole::StopLoss;
    }
    if client_order_id.starts_with(CLIENT_ID_TAKE_PROFIT) {
        return BotRole::TakeProfit;
    }
    if client_order_id.starts_with(CLIENT_ID_PARTIAL_REDUCE) {
        return BotRole::PartialReduce;
    }
    if order_type.is_stop() {
        return BotRole::StopLoss;
    }
    if order_type.is_take_profit() {
        return BotRole::TakeProfit;
    }
    if reduce_only || close_position {
        return BotRole::PartialReduce;
    }
    BotRole::Manual
}

/// Build a fresh client order id with the given role prefix.
pub fn new_client_order_id(prefix: &str) -> String {
    // Exchange limit is 36 chars
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &suffix[..24])
}

/// Live order row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub external_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub stop_price: f64,
    pub quantity: f64,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub status: OrderStatus,
    pub bot_role: BotRole,
    pub reduce_only: bool,
    pub close_position: bool,
    pub position_id: Option<i64>,
    pub trailing_level: Option<TrailingLevel>,
    pub signal_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new order row.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account_id: i64,
    pub external_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub stop_price: f64,
    pub quantity: f64,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub status: OrderStatus,
    pub bot_role: BotRole,
    pub reduce_only: bool,
    pub close_position: bool,
    pub position_id: Option<i64>,
    pub trailing_level: Option<TrailingLevel>,
    pub signal_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_role_from_type() {
        assert_eq!(infer_role(OrderType::StopMarket, "web_abc", false, true), BotRole::StopLoss);
        assert_eq!(
            infer_role(OrderType::TakeProfitMarket, "web_abc", false, true),
            BotRole::TakeProfit
        );
        assert_eq!(infer_role(OrderType::Limit, "web_abc", true, false), BotRole::PartialReduce);
        assert_eq!(infer_role(OrderType::Market, "web_abc", false, false), BotRole::Manual);
    }

    #[test]
    fn test_infer_role_from_client_id() {
        assert_eq!(infer_role(OrderType::Market, "autoclose-123", true, false), BotRole::Liquidation);
        assert_eq!(infer_role(OrderType::Market, "adl_autoclose", true, false), BotRole::Adl);
        assert_eq!(
            infer_role(OrderType::Limit, "settlement_autoclose-9", true, false),
            BotRole::Settlement
        );
        let entry_id = new_client_order_id(CLIENT_ID_ENTRY);
        assert_eq!(infer_role(OrderType::Market, &entry_id, false, false), BotRole::Entry);
        assert!(entry_id.len() <= 36);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(OrderStatus::parse("EXPIRED_IN_MATCH"), Some(OrderStatus::Expired));
        assert_eq!(OrderStatus::parse("PARTIALLY_FILLED"), Some(OrderStatus::PartiallyFilled));
        assert_eq!(OrderStatus::parse("bogus"), None);
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
