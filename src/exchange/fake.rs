//! In-process exchange for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CancelOutcome, ExchangeApi, ExchangeError, ExchangeOrder, ExchangePosition, OrderRequest};
use crate::models::{OrderStatus, OrderType, Side};

#[derive(Default)]
struct State {
    next_id: u64,
    orders: HashMap<String, ExchangeOrder>,
    positions: HashMap<String, f64>,
    prices: HashMap<String, f64>,
    placed: Vec<OrderRequest>,
    canceled: Vec<String>,
    leverage: Vec<(String, i64)>,
    failing_types: HashSet<OrderType>,
    positions_unavailable: bool,
}

/// Market orders fill at the configured price; stop and take-profit orders
/// rest as NEW until canceled.
#[derive(Default)]
pub(crate) struct FakeExchange {
    state: Mutex<State>,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().unwrap().prices.insert(symbol.to_string(), price);
    }

    /// Signed position amount; 0 removes it.
    pub fn set_position(&self, symbol: &str, amount: f64) {
        let mut state = self.state.lock().unwrap();
        if amount == 0.0 {
            state.positions.remove(symbol);
        } else {
            state.positions.insert(symbol.to_string(), amount);
        }
    }

    pub fn fail_orders_of_type(&self, order_type: OrderType) {
        self.state.lock().unwrap().failing_types.insert(order_type);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_types.clear();
        state.positions_unavailable = false;
    }

    pub fn fail_position_queries(&self) {
        self.state.lock().unwrap().positions_unavailable = true;
    }

    pub fn insert_order(&self, order: ExchangeOrder) {
        self.state
            .lock()
            .unwrap()
            .orders
            .insert(order.order_id.clone(), order);
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state.lock().unwrap().canceled.clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().leverage.clone()
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.status == "NEW")
            .map(|o| o.order_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

pub(crate) fn exchange_order(
    id: &str,
    symbol: &str,
    side: Side,
    order_type: OrderType,
    status: OrderStatus,
) -> ExchangeOrder {
    ExchangeOrder {
        order_id: id.to_string(),
        client_order_id: format!("web_{}", id),
        symbol: symbol.to_string(),
        side,
        order_type: order_type.as_str().to_string(),
        status: status.as_str().to_string(),
        price: 0.0,
        avg_price: 0.0,
        orig_qty: 0.0,
        executed_qty: 0.0,
        stop_price: 0.0,
        reduce_only: false,
        close_position: false,
        update_time: 0,
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn place_order(&self, req: OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.placed.push(req.clone());

        if state.failing_types.contains(&req.order_type) {
            return Err(ExchangeError::Api {
                status: 400,
                code: -2019,
                msg: "Margin is insufficient.".to_string(),
            });
        }

        state.next_id += 1;
        let id = format!("{}", 9000 + state.next_id);
        let price = state.prices.get(&req.symbol).copied().unwrap_or(100.0);
        let qty = req.quantity_f64();

        let mut order = exchange_order(&id, &req.symbol, req.side, req.order_type, OrderStatus::New);
        order.client_order_id = req.client_order_id.clone();
        order.orig_qty = qty;
        order.stop_price = req.stop_price_f64();
        order.reduce_only = req.reduce_only;
        order.close_position = req.close_position;

        if req.order_type == OrderType::Market {
            order.status = OrderStatus::Filled.as_str().to_string();
            order.executed_qty = qty;
            order.avg_price = price;
            let signed = if req.side == Side::Buy { qty } else { -qty };
            *state.positions.entry(req.symbol.clone()).or_insert(0.0) += signed;
        }

        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, external_id: &str) -> Result<CancelOutcome, ExchangeError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match state.orders.get_mut(external_id) {
            Some(order) if order.status == "NEW" => {
                order.status = OrderStatus::Canceled.as_str().to_string();
                state.canceled.push(external_id.to_string());
                Ok(CancelOutcome::Canceled)
            }
            _ => Ok(CancelOutcome::NotFound),
        }
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .values()
            .filter(|o| o.status == "NEW")
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn order_status(&self, _symbol: &str, external_id: &str) -> Result<ExchangeOrder, ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .orders
            .get(external_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Api {
                status: 400,
                code: -2013,
                msg: "Order does not exist.".to_string(),
            })
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let state = self.state.lock().unwrap();
        if state.positions_unavailable {
            return Err(ExchangeError::Closed);
        }
        Ok(state
            .positions
            .iter()
            .filter(|(_, amt)| amt.abs() > 1e-9)
            .map(|(symbol, amt)| ExchangePosition {
                symbol: symbol.clone(),
                position_amt: *amt,
                entry_price: 0.0,
                mark_price: state.prices.get(symbol).copied().unwrap_or(0.0),
                leverage: 0.0,
            })
            .collect())
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Protocol(format!("no price for {}", symbol)))
    }

    async fn set_leverage(&self, symbol: &str, leverage: i64) -> Result<(), ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .leverage
            .push((symbol.to_string(), leverage));
        Ok(())
    }
}
