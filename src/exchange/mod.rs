//! Exchange connectivity for one account.
//!
//! - `session`: authenticated WS API session with request correlation
//! - `rest`: HMAC-signed REST fallback
//! - `gateway`: [`ExchangeApi`] over both, session first

mod error;
pub mod gateway;
pub mod rest;
pub mod session;
mod types;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(test)]
pub(crate) mod testing;

pub use error::ExchangeError;
pub use gateway::Gateway;
pub use rest::{RestClient, DEFAULT_REST_URL};
pub use session::{ConnectionSession, SessionOptions};
pub use types::{
    AccountUpdate, BalanceEntry, CancelOutcome, ExchangeOrder, ExchangePosition, OrderRequest,
    OrderUpdate, PriceSource, PriceUpdate,
};

pub(crate) use types::de_f64;

use async_trait::async_trait;

/// Default WS API endpoint.
pub const DEFAULT_WS_API_URL: &str = "wss://ws-fapi.binance.com/ws-fapi/v1";
/// Default market/user stream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://fstream.binance.com";

/// Exchange operations the engine depends on.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place_order(&self, req: OrderRequest) -> Result<ExchangeOrder, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, external_id: &str) -> Result<CancelOutcome, ExchangeError>;

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn order_status(&self, symbol: &str, external_id: &str) -> Result<ExchangeOrder, ExchangeError>;

    /// Non-flat positions.
    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: i64) -> Result<(), ExchangeError>;
}
