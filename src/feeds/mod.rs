//! Streaming data feeds for one account.
//!
//! - `market`: public book/ticker streams per symbol, normalized to prices
//! - `user`: private order and account updates behind a listen key
//!
//! Neither feed reconnects by itself; the runner's health check calls
//! `ensure` again for anything that died.

mod events;
pub mod market;
pub mod user;

pub use events::{normalize_tick, parse_user_event, UserEvent};
pub use market::MarketFeedManager;
pub use user::UserFeedManager;

use async_trait::async_trait;

use crate::exchange::{AccountUpdate, OrderUpdate, PriceUpdate};

/// Receives every normalized price of the account's subscribed symbols.
#[async_trait]
pub trait PriceListener: Send + Sync {
    async fn on_price(&self, update: PriceUpdate);
}

/// Receives private order-state updates, in stream order.
#[async_trait]
pub trait OrderUpdateListener: Send + Sync {
    async fn on_order_update(&self, update: OrderUpdate);
}

/// Receives balance/position snapshots from the private stream.
#[async_trait]
pub trait AccountUpdateListener: Send + Sync {
    async fn on_account_update(&self, update: AccountUpdate);
}
