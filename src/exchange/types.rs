//! Wire types for the futures exchange (WS API results, REST bodies, stream events).

use std::time::Instant;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer};

use crate::models::{OrderStatus, OrderType, Side};

/// Accept numbers encoded either as JSON strings or JSON numbers.
pub(crate) fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        Str(String),
        F(f64),
    }

    match Num::deserialize(deserializer)? {
        Num::F(f) => Ok(f),
        Num::Str(s) if s.is_empty() => Ok(0.0),
        Num::Str(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
    }
}

/// Accept order ids encoded as numbers or strings.
pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Int(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Int(i) => i.to_string(),
    })
}

/// Order as reported by `order.place`, `order.status`, `openOrders`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOrder {
    #[serde(deserialize_with = "de_id")]
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: String,
    pub status: String,
    #[serde(default, deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub orig_qty: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub executed_qty: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub stop_price: f64,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub update_time: i64,
}

impl ExchangeOrder {
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }

    pub fn order_type(&self) -> Option<OrderType> {
        OrderType::parse(&self.order_type)
    }
}

/// Position as reported by `positionRisk`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed quantity: positive long, negative short
    #[serde(deserialize_with = "de_f64")]
    pub position_amt: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub entry_price: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub mark_price: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub leverage: f64,
}

impl ExchangePosition {
    pub fn side(&self) -> Option<Side> {
        if self.position_amt > 0.0 {
            Some(Side::Buy)
        } else if self.position_amt < 0.0 {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// Exchange says the order does not exist; treat as already gone.
    NotFound,
}

/// Price/quantity precision for a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRules {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
}

impl SymbolRules {
    /// Round a price to the nearest tick.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        ((price / self.tick_size).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            * self.tick_size)
            .normalize()
    }

    /// Round a quantity down to the step size.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        if self.step_size.is_zero() {
            return qty;
        }
        ((qty / self.step_size).floor() * self.step_size).normalize()
    }
}

/// Order to submit.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_order_id: String,
}

impl OrderRequest {
    /// Market order opening or adding to exposure.
    pub fn market(symbol: &str, side: Side, quantity: f64, client_order_id: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity: Decimal::from_f64(quantity),
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
            client_order_id,
        }
    }

    /// Stop-market order that closes the whole position when triggered.
    pub fn stop_loss(symbol: &str, side: Side, stop_price: f64, client_order_id: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::StopMarket,
            quantity: None,
            price: None,
            stop_price: Decimal::from_f64(stop_price),
            reduce_only: false,
            close_position: true,
            client_order_id,
        }
    }

    /// Take-profit-market order that closes the whole position when triggered.
    pub fn take_profit(symbol: &str, side: Side, stop_price: f64, client_order_id: String) -> Self {
        Self {
            order_type: OrderType::TakeProfitMarket,
            ..Self::stop_loss(symbol, side, stop_price, client_order_id)
        }
    }

    /// Apply the symbol's precision rules.
    pub fn rounded(mut self, rules: &SymbolRules) -> Self {
        self.quantity = self.quantity.map(|q| rules.round_qty(q));
        self.price = self.price.map(|p| rules.round_price(p));
        self.stop_price = self.stop_price.map(|p| rules.round_price(p));
        self
    }

    pub fn stop_price_f64(&self) -> f64 {
        self.stop_price.and_then(|p| p.to_f64()).unwrap_or(0.0)
    }

    pub fn quantity_f64(&self) -> f64 {
        self.quantity.and_then(|q| q.to_f64()).unwrap_or(0.0)
    }

    /// Request parameters in exchange naming. `closePosition` orders carry
    /// neither quantity nor `reduceOnly`.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), self.side.as_str().to_string()),
            ("type".to_string(), self.order_type.as_str().to_string()),
            ("newClientOrderId".to_string(), self.client_order_id.clone()),
            ("newOrderRespType".to_string(), "RESULT".to_string()),
        ];

        if self.close_position {
            params.push(("closePosition".to_string(), "true".to_string()));
        } else {
            if let Some(q) = self.quantity {
                params.push(("quantity".to_string(), q.normalize().to_string()));
            }
            if self.reduce_only {
                params.push(("reduceOnly".to_string(), "true".to_string()));
            }
        }

        if let Some(p) = self.price {
            params.push(("price".to_string(), p.normalize().to_string()));
            params.push(("timeInForce".to_string(), "GTC".to_string()));
        }
        if let Some(sp) = self.stop_price {
            params.push(("stopPrice".to_string(), sp.normalize().to_string()));
            params.push(("workingType".to_string(), "MARK_PRICE".to_string()));
        }

        params
    }
}

/// Canonical order-state update, from the private stream or from polling.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub account_id: i64,
    pub symbol: String,
    pub external_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: f64,
    pub stop_price: f64,
    pub quantity: f64,
    pub executed_qty: f64,
    pub avg_price: f64,
    /// Quantity filled by this event alone (0 for polled snapshots)
    pub last_fill_qty: f64,
    pub reduce_only: bool,
    pub close_position: bool,
    pub event_time: i64,
}

impl OrderUpdate {
    /// Build from a polled order snapshot. `None` for unknown status/type strings.
    pub fn from_exchange_order(account_id: i64, order: &ExchangeOrder) -> Option<Self> {
        Some(Self {
            account_id,
            symbol: order.symbol.clone(),
            external_id: order.order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            order_type: order.order_type()?,
            status: order.status()?,
            price: order.price,
            stop_price: order.stop_price,
            quantity: order.orig_qty,
            executed_qty: order.executed_qty,
            avg_price: order.avg_price,
            last_fill_qty: 0.0,
            reduce_only: order.reduce_only,
            close_position: order.close_position,
            event_time: order.update_time,
        })
    }

    /// Price to book a fill at: average fill price, else limit, else stop.
    pub fn fill_price(&self) -> f64 {
        [self.avg_price, self.price, self.stop_price]
            .into_iter()
            .find(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(0.0)
    }
}

/// One wallet balance from an account snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceEntry {
    pub asset: String,
    pub wallet_balance: f64,
    pub cross_wallet_balance: f64,
}

/// Balance/position snapshot from the private stream.
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    pub account_id: i64,
    pub reason: String,
    pub balances: Vec<BalanceEntry>,
    pub positions: Vec<ExchangePosition>,
    pub event_time: i64,
}

/// Where a normalized price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    /// Close price of a full ticker frame
    Ticker,
    /// Midpoint of best bid/ask
    BookMid,
}

/// Normalized price tick for one symbol and account.
#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub account_id: i64,
    pub symbol: String,
    pub price: f64,
    pub source: PriceSource,
    pub received_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exchange_order_from_ws_result() {
        let json = r#"{
            "orderId": 325078477,
            "symbol": "BTCUSDT",
            "status": "NEW",
            "clientOrderId": "pm-en-abc",
            "price": "0.00",
            "avgPrice": "0.00",
            "origQty": "0.010",
            "executedQty": "0.000",
            "type": "MARKET",
            "reduceOnly": false,
            "closePosition": false,
            "side": "BUY",
            "stopPrice": "0.00",
            "updateTime": 1700000000000
        }"#;

        let order: ExchangeOrder = serde_json::from_str(json).unwrap();
        assert_eq!(order.order_id, "325078477");
        assert_eq!(order.orig_qty, 0.01);
        assert_eq!(order.status(), Some(OrderStatus::New));
        assert_eq!(order.order_type(), Some(OrderType::Market));
    }

    #[test]
    fn test_symbol_rules_rounding() {
        let rules = SymbolRules {
            tick_size: dec!(0.10),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
        };

        assert_eq!(rules.round_price(dec!(43187.06)), dec!(43187.1));
        assert_eq!(rules.round_qty(dec!(0.01999)), dec!(0.019));
    }

    #[test]
    fn test_close_position_params_omit_quantity() {
        let req = OrderRequest::stop_loss("BTCUSDT", Side::Sell, 95.0, "pm-sl-1".to_string());
        let params = req.to_params();

        assert!(params.iter().any(|(k, v)| k == "closePosition" && v == "true"));
        assert!(params.iter().any(|(k, v)| k == "stopPrice" && v == "95"));
        assert!(!params.iter().any(|(k, _)| k == "quantity" || k == "reduceOnly"));
    }

    #[test]
    fn test_fill_price_fallbacks() {
        let order = ExchangeOrder {
            order_id: "1".to_string(),
            client_order_id: String::new(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            order_type: "STOP_MARKET".to_string(),
            status: "FILLED".to_string(),
            price: 0.0,
            avg_price: 0.0,
            orig_qty: 0.0,
            executed_qty: 1.0,
            stop_price: 95.0,
            reduce_only: false,
            close_position: true,
            update_time: 0,
        };
        let update = OrderUpdate::from_exchange_order(1, &order).unwrap();
        assert_eq!(update.fill_price(), 95.0);
    }
}
