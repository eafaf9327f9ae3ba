//! REST fallback client for the futures API.
//!
//! Used when the WS API session is not authenticated, and for endpoints the
//! session does not carry (exchange info). Signed endpoints use HMAC-SHA256
//! over the query string.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::error::ExchangeError;
use super::types::{de_f64, ExchangeOrder, ExchangePosition, OrderRequest, SymbolRules};
use crate::signing::{hmac_sha256_hex, SIGNATURE_KEY};

/// Binance USDⓈ-M production REST base.
pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";

const RECV_WINDOW_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[serde(deserialize_with = "de_f64")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

/// REST client for one account.
pub struct RestClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl RestClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        if api_secret.is_empty() {
            return Err(ExchangeError::Config("REST API secret is empty".to_string()));
        }

        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    // ==================== Orders ====================

    pub async fn place_order(&self, req: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let body = self
            .signed(Method::POST, "/fapi/v1/order", req.to_params())
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let body = self
            .signed(Method::DELETE, "/fapi/v1/order", order_ref(symbol, order_id))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let body = self
            .signed(Method::GET, "/fapi/v1/order", order_ref(symbol, order_id))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Look an order up by the client id it was submitted with.
    pub async fn order_by_client_id(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("origClientOrderId".to_string(), client_order_id.to_string()),
        ];
        let body = self.signed(Method::GET, "/fapi/v1/order", params).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let params = symbol
            .map(|s| vec![("symbol".to_string(), s.to_string())])
            .unwrap_or_default();
        let body = self.signed(Method::GET, "/fapi/v1/openOrders", params).await?;
        Ok(serde_json::from_value(body)?)
    }

    // ==================== Account ====================

    pub async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let body = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: i64) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.signed(Method::POST, "/fapi/v1/leverage", params).await?;
        Ok(())
    }

    // ==================== Market ====================

    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let body = self.send(self.http.get(&url)).await?;
        let ticker: TickerPrice = serde_json::from_value(body)?;
        Ok(ticker.price)
    }

    pub async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let body = self.send(self.http.get(&url)).await?;
        parse_symbol_rules(&body, symbol)
    }

    // ==================== Transport ====================

    async fn signed(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        let query = signed_query(&self.api_secret, params, Utc::now().timestamp_millis())?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        debug!(%method, path, "REST request");

        let request = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key);
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ExchangeError> {
        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &text));
        }

        Ok(serde_json::from_str(&text)?)
    }
}

fn order_ref(symbol: &str, order_id: &str) -> Vec<(String, String)> {
    vec![
        ("symbol".to_string(), symbol.to_string()),
        ("orderId".to_string(), order_id.to_string()),
    ]
}

/// Query string with `recvWindow`, `timestamp` and the HMAC signature last.
fn signed_query(
    secret: &str,
    mut params: Vec<(String, String)>,
    timestamp_ms: i64,
) -> Result<String, ExchangeError> {
    params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
    params.push(("timestamp".to_string(), timestamp_ms.to_string()));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let signature = hmac_sha256_hex(secret, &query)?;

    Ok(format!("{}&{}={}", query, SIGNATURE_KEY, signature))
}

fn api_error(status: u16, text: &str) -> ExchangeError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => ExchangeError::Api {
            status,
            code: body.code,
            msg: body.msg,
        },
        Err(_) => ExchangeError::Api {
            status,
            code: 0,
            msg: text.to_string(),
        },
    }
}

fn parse_symbol_rules(info: &Value, symbol: &str) -> Result<SymbolRules, ExchangeError> {
    let entry = info["symbols"]
        .as_array()
        .and_then(|symbols| symbols.iter().find(|s| s["symbol"] == symbol))
        .ok_or_else(|| ExchangeError::Protocol(format!("symbol {} not in exchange info", symbol)))?;

    let filter = |kind: &str, field: &str| -> Option<Decimal> {
        entry["filters"]
            .as_array()?
            .iter()
            .find(|f| f["filterType"] == kind)?[field]
            .as_str()
            .and_then(|v| Decimal::from_str(v).ok())
    };

    Ok(SymbolRules {
        tick_size: filter("PRICE_FILTER", "tickSize").unwrap_or_default(),
        step_size: filter("LOT_SIZE", "stepSize").unwrap_or_default(),
        min_qty: filter("LOT_SIZE", "minQty").unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_signed_query_appends_signature_last() {
        let params = vec![("symbol".to_string(), "BTCUSDT".to_string())];
        let query = signed_query("secret", params, 1700000000000).unwrap();

        let (unsigned, signature) = query.rsplit_once("&signature=").unwrap();
        assert_eq!(unsigned, "symbol=BTCUSDT&recvWindow=5000&timestamp=1700000000000");
        assert_eq!(signature, hmac_sha256_hex("secret", unsigned).unwrap());
    }

    #[test]
    fn test_api_error_parsing() {
        let err = api_error(400, r#"{"code":-2011,"msg":"Unknown order sent."}"#);
        assert!(err.is_order_not_found());

        let err = api_error(502, "Bad Gateway");
        assert!(matches!(err, ExchangeError::Api { status: 502, code: 0, .. }));
    }

    #[test]
    fn test_parse_symbol_rules() {
        let info = json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}
                ]
            }]
        });

        let rules = parse_symbol_rules(&info, "BTCUSDT").unwrap();
        assert_eq!(rules.tick_size, dec!(0.10));
        assert_eq!(rules.step_size, dec!(0.001));
        assert!(parse_symbol_rules(&info, "ETHUSDT").is_err());
    }
}
