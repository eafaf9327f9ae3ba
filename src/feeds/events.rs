//! Parsing of public and private stream frames.

use serde::Deserialize;
use serde_json::Value;

use crate::exchange::{de_f64, AccountUpdate, BalanceEntry, ExchangePosition, OrderUpdate, PriceSource};
use crate::models::{OrderStatus, OrderType, Side};

/// Normalized price from one market frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub source: PriceSource,
}

#[derive(Debug, Deserialize)]
struct BookTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b", deserialize_with = "de_f64")]
    bid: f64,
    #[serde(rename = "a", deserialize_with = "de_f64")]
    ask: f64,
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", deserialize_with = "de_f64")]
    close: f64,
}

/// Unwrap a combined-stream envelope (`{"stream": .., "data": ..}`).
fn payload(frame: &Value) -> &Value {
    match frame.get("data") {
        Some(data) if frame.get("stream").is_some() => data,
        _ => frame,
    }
}

/// Normalize a market frame to a single price.
///
/// Full tickers use the close price; book tickers use the bid/ask midpoint
/// and require `0 < bid < ask`. Anything else, or a non-finite or
/// non-positive result, yields `None`.
pub fn normalize_tick(frame: &Value) -> Option<Tick> {
    let data = payload(frame);
    let event = data.get("e").and_then(Value::as_str);

    let tick = match event {
        Some("24hrTicker") => {
            let t: Ticker24h = serde_json::from_value(data.clone()).ok()?;
            Tick {
                symbol: t.symbol,
                price: t.close,
                source: PriceSource::Ticker,
            }
        }
        // Futures book tickers carry "e"; spot-style ones do not
        Some("bookTicker") | None if data.get("b").is_some() && data.get("a").is_some() => {
            let b: BookTicker = serde_json::from_value(data.clone()).ok()?;
            if !(b.bid > 0.0 && b.ask > 0.0 && b.bid < b.ask) {
                return None;
            }
            Tick {
                symbol: b.symbol,
                price: (b.bid + b.ask) / 2.0,
                source: PriceSource::BookMid,
            }
        }
        _ => return None,
    };

    (tick.price.is_finite() && tick.price > 0.0).then_some(tick)
}

#[derive(Debug, Deserialize)]
struct OrderTradeEvent {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "o")]
    order: OrderPayload,
}

#[derive(Debug, Deserialize)]
struct OrderPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", default)]
    client_order_id: String,
    #[serde(rename = "S")]
    side: Side,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "q", default, deserialize_with = "de_f64")]
    quantity: f64,
    #[serde(rename = "p", default, deserialize_with = "de_f64")]
    price: f64,
    #[serde(rename = "ap", default, deserialize_with = "de_f64")]
    avg_price: f64,
    #[serde(rename = "sp", default, deserialize_with = "de_f64")]
    stop_price: f64,
    #[serde(rename = "z", default, deserialize_with = "de_f64")]
    executed_qty: f64,
    #[serde(rename = "l", default, deserialize_with = "de_f64")]
    last_fill_qty: f64,
    #[serde(rename = "R", default)]
    reduce_only: bool,
    #[serde(rename = "cp", default)]
    close_position: bool,
}

#[derive(Debug, Deserialize)]
struct AccountEvent {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "a")]
    data: AccountPayload,
}

#[derive(Debug, Deserialize)]
struct AccountPayload {
    #[serde(rename = "m", default)]
    reason: String,
    #[serde(rename = "B", default)]
    balances: Vec<BalancePayload>,
    #[serde(rename = "P", default)]
    positions: Vec<PositionPayload>,
}

#[derive(Debug, Deserialize)]
struct BalancePayload {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "wb", deserialize_with = "de_f64")]
    wallet_balance: f64,
    #[serde(rename = "cw", default, deserialize_with = "de_f64")]
    cross_wallet_balance: f64,
}

#[derive(Debug, Deserialize)]
struct PositionPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa", deserialize_with = "de_f64")]
    amount: f64,
    #[serde(rename = "ep", default, deserialize_with = "de_f64")]
    entry_price: f64,
}

/// Decoded private stream event.
#[derive(Debug)]
pub enum UserEvent {
    Order(OrderUpdate),
    Account(AccountUpdate),
    ListenKeyExpired,
    /// Recognized but irrelevant, or unparseable
    Ignored(String),
}

pub fn parse_user_event(account_id: i64, frame: &Value) -> UserEvent {
    let data = payload(frame);
    let kind = data.get("e").and_then(Value::as_str).unwrap_or_default();

    match kind {
        "ORDER_TRADE_UPDATE" => match order_update(account_id, data) {
            Ok(update) => UserEvent::Order(update),
            Err(reason) => UserEvent::Ignored(reason),
        },
        "ACCOUNT_UPDATE" => match serde_json::from_value::<AccountEvent>(data.clone()) {
            Ok(event) => UserEvent::Account(AccountUpdate {
                account_id,
                reason: event.data.reason,
                balances: event
                    .data
                    .balances
                    .into_iter()
                    .map(|b| BalanceEntry {
                        asset: b.asset,
                        wallet_balance: b.wallet_balance,
                        cross_wallet_balance: b.cross_wallet_balance,
                    })
                    .collect(),
                positions: event
                    .data
                    .positions
                    .into_iter()
                    .map(|p| ExchangePosition {
                        symbol: p.symbol,
                        position_amt: p.amount,
                        entry_price: p.entry_price,
                        mark_price: 0.0,
                        leverage: 0.0,
                    })
                    .collect(),
                event_time: event.event_time,
            }),
            Err(e) => UserEvent::Ignored(format!("bad ACCOUNT_UPDATE: {}", e)),
        },
        "listenKeyExpired" => UserEvent::ListenKeyExpired,
        other => UserEvent::Ignored(other.to_string()),
    }
}

fn order_update(account_id: i64, data: &Value) -> Result<OrderUpdate, String> {
    let event: OrderTradeEvent =
        serde_json::from_value(data.clone()).map_err(|e| format!("bad ORDER_TRADE_UPDATE: {}", e))?;
    let o = event.order;

    let status = OrderStatus::parse(&o.status).ok_or_else(|| format!("unknown status {}", o.status))?;
    let order_type =
        OrderType::parse(&o.order_type).ok_or_else(|| format!("unknown order type {}", o.order_type))?;

    Ok(OrderUpdate {
        account_id,
        symbol: o.symbol,
        external_id: o.order_id.to_string(),
        client_order_id: o.client_order_id,
        side: o.side,
        order_type,
        status,
        price: o.price,
        stop_price: o.stop_price,
        quantity: o.quantity,
        executed_qty: o.executed_qty,
        avg_price: o.avg_price,
        last_fill_qty: o.last_fill_qty,
        reduce_only: o.reduce_only,
        close_position: o.close_position,
        event_time: event.event_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ticker_uses_close_price() {
        let frame = json!({
            "stream": "btcusdt@ticker",
            "data": {"e": "24hrTicker", "s": "BTCUSDT", "c": "43100.5"}
        });
        let tick = normalize_tick(&frame).unwrap();
        assert_eq!(tick.price, 43100.5);
        assert_eq!(tick.source, PriceSource::Ticker);
    }

    #[test]
    fn test_book_ticker_uses_midpoint() {
        let frame = json!({"e": "bookTicker", "s": "BTCUSDT", "b": "100.0", "B": "1", "a": "102.0", "A": "1"});
        let tick = normalize_tick(&frame).unwrap();
        assert_eq!(tick.price, 101.0);
        assert_eq!(tick.source, PriceSource::BookMid);
    }

    #[test]
    fn test_invalid_books_dropped() {
        // Crossed, zero and garbage books are all dropped
        for (bid, ask) in [("102", "100"), ("0", "100"), ("100", "100"), ("abc", "100")] {
            let frame = json!({"e": "bookTicker", "s": "BTCUSDT", "b": bid, "a": ask});
            assert!(normalize_tick(&frame).is_none(), "bid={} ask={}", bid, ask);
        }

        let frame = json!({"e": "24hrTicker", "s": "BTCUSDT", "c": "0"});
        assert!(normalize_tick(&frame).is_none());
        assert!(normalize_tick(&json!({"result": null, "id": 1})).is_none());
    }

    #[test]
    fn test_parse_order_trade_update() {
        let frame = json!({
            "e": "ORDER_TRADE_UPDATE",
            "E": 1700000000123i64,
            "T": 1700000000120i64,
            "o": {
                "s": "BTCUSDT", "c": "pm-sl-abc", "S": "SELL", "o": "STOP_MARKET",
                "f": "GTC", "q": "0", "p": "0", "ap": "94.9", "sp": "95",
                "x": "TRADE", "X": "FILLED", "i": 8886774, "l": "0.01", "z": "0.01",
                "L": "94.9", "T": 1700000000120i64, "R": false, "cp": true, "ot": "STOP_MARKET"
            }
        });

        match parse_user_event(3, &frame) {
            UserEvent::Order(update) => {
                assert_eq!(update.account_id, 3);
                assert_eq!(update.external_id, "8886774");
                assert_eq!(update.status, OrderStatus::Filled);
                assert_eq!(update.order_type, OrderType::StopMarket);
                assert!(update.close_position);
                assert_eq!(update.fill_price(), 94.9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_account_update_and_expiry() {
        let frame = json!({
            "e": "ACCOUNT_UPDATE",
            "E": 1700000000000i64,
            "a": {
                "m": "ORDER",
                "B": [{"a": "USDT", "wb": "1000.5", "cw": "900.25", "bc": "0"}],
                "P": [{"s": "BTCUSDT", "pa": "-0.01", "ep": "100", "up": "0", "mt": "cross", "ps": "BOTH"}]
            }
        });

        match parse_user_event(3, &frame) {
            UserEvent::Account(update) => {
                assert_eq!(update.balances[0].wallet_balance, 1000.5);
                assert_eq!(update.positions[0].side(), Some(Side::Sell));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            parse_user_event(3, &json!({"e": "listenKeyExpired", "E": 1})),
            UserEvent::ListenKeyExpired
        ));
    }
}
