//! Per-account exchange gateway: WS API session first, REST fallback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::error::ExchangeError;
use super::rest::RestClient;
use super::session::ConnectionSession;
use super::types::{CancelOutcome, ExchangeOrder, ExchangePosition, OrderRequest, SymbolRules};
use super::ExchangeApi;

pub struct Gateway {
    account_id: i64,
    session: Arc<ConnectionSession>,
    rest: RestClient,
    rules: RwLock<HashMap<String, SymbolRules>>,
}

impl Gateway {
    pub fn new(account_id: i64, session: Arc<ConnectionSession>, rest: RestClient) -> Self {
        Self {
            account_id,
            session,
            rest,
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    /// Call the WS API when the session is up. `None` means "use REST":
    /// the session is down or failed at the transport level.
    async fn via_session(
        &self,
        method: &str,
        params: Vec<(String, String)>,
    ) -> Option<Result<Value, ExchangeError>> {
        if !self.session.is_authenticated().await {
            debug!(account_id = self.account_id, method, "Session down, using REST");
            return None;
        }
        match self.session.call(method, params).await {
            Err(e) if e.is_transport() => {
                warn!(account_id = self.account_id, method, error = %e, "Session call failed, retrying over REST");
                None
            }
            other => Some(other),
        }
    }

    /// Submit an order exactly once. REST takes over only when the session
    /// request never went out; a lost reply is resolved by looking the
    /// client order id up instead of resubmitting.
    async fn place_once(&self, req: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        if !self.session.is_authenticated().await {
            debug!(account_id = self.account_id, "Session down, placing over REST");
            return self.rest.place_order(req).await;
        }
        match self.session.call("order.place", req.to_params()).await {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(e) if e.is_unsent() => {
                warn!(account_id = self.account_id, error = %e, "Order not sent on session, placing over REST");
                self.rest.place_order(req).await
            }
            Err(e) if e.is_outcome_unknown() => self.recover_placement(req, e).await,
            Err(e) => Err(e),
        }
    }

    async fn recover_placement(
        &self,
        req: &OrderRequest,
        cause: ExchangeError,
    ) -> Result<ExchangeOrder, ExchangeError> {
        match self.rest.order_by_client_id(&req.symbol, &req.client_order_id).await {
            Ok(order) => {
                info!(
                    account_id = self.account_id,
                    client_order_id = %req.client_order_id,
                    order_id = %order.order_id,
                    "Order reply lost but the order exists"
                );
                Ok(order)
            }
            Err(e) => {
                warn!(
                    account_id = self.account_id,
                    client_order_id = %req.client_order_id,
                    error = %e,
                    "Order outcome unknown, not resubmitting"
                );
                Err(cause)
            }
        }
    }

    /// Cached precision rules; fetched once per symbol.
    async fn rules_for(&self, symbol: &str) -> Option<SymbolRules> {
        if let Some(rules) = self.rules.read().await.get(symbol) {
            return Some(rules.clone());
        }
        match self.rest.symbol_rules(symbol).await {
            Ok(rules) => {
                self.rules
                    .write()
                    .await
                    .insert(symbol.to_string(), rules.clone());
                Some(rules)
            }
            Err(e) => {
                warn!(account_id = self.account_id, symbol, error = %e, "No symbol rules, sending unrounded");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_rules(&self, symbol: &str, rules: SymbolRules) {
        self.rules.write().await.insert(symbol.to_string(), rules);
    }
}

#[async_trait]
impl ExchangeApi for Gateway {
    async fn place_order(&self, req: OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let req = match self.rules_for(&req.symbol).await {
            Some(rules) => {
                let rounded = req.rounded(&rules);
                if let Some(qty) = rounded.quantity {
                    if qty < rules.min_qty || qty <= Decimal::ZERO {
                        return Err(ExchangeError::InvalidOrder(format!(
                            "quantity {} below minimum {} for {}",
                            qty, rules.min_qty, rounded.symbol
                        )));
                    }
                }
                rounded
            }
            None => req,
        };

        self.place_once(&req).await
    }

    async fn cancel_order(&self, symbol: &str, external_id: &str) -> Result<CancelOutcome, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), external_id.to_string()),
        ];
        let result = match self.via_session("order.cancel", params).await {
            Some(result) => result.map(|_| ()),
            None => self.rest.cancel_order(symbol, external_id).await.map(|_| ()),
        };

        match result {
            Ok(()) => Ok(CancelOutcome::Canceled),
            Err(e) if e.is_order_not_found() => Ok(CancelOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.rest.open_orders(symbol).await
    }

    async fn order_status(&self, symbol: &str, external_id: &str) -> Result<ExchangeOrder, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), external_id.to_string()),
        ];
        match self.via_session("order.status", params).await {
            Some(result) => Ok(serde_json::from_value(result?)?),
            None => self.rest.order_status(symbol, external_id).await,
        }
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        match self.via_session("v2/account.position", Vec::new()).await {
            Some(result) => Ok(serde_json::from_value(result?)?),
            None => self.rest.positions().await,
        }
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        match self.via_session("ticker.price", params).await {
            Some(result) => {
                let value = result?;
                value["price"]
                    .as_str()
                    .and_then(|p| p.parse::<f64>().ok())
                    .ok_or_else(|| ExchangeError::Protocol(format!("bad ticker.price result: {}", value)))
            }
            None => self.rest.ticker_price(symbol).await,
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: i64) -> Result<(), ExchangeError> {
        self.rest.set_leverage(symbol, leverage).await
    }
}
