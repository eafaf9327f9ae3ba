//! Position and order lifecycle engine for one account.
//!
//! - `evaluator`: turns PENDING signals into entries on price ticks
//! - `reconciler`: applies order updates to local orders and positions
//! - `trailing`: ratchets the protective stop up the target ladder
//! - `archival`: periodic expiry, migration and ghost/orphan cleanup

pub mod archival;
pub mod evaluator;
pub mod reconciler;
pub mod trailing;

pub use archival::ArchivalJob;
pub use evaluator::SignalEvaluator;
pub use reconciler::OrderReconciler;
pub use trailing::TrailingStopEngine;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::exchange::ExchangeApi;
use crate::feeds::MarketFeedManager;
use crate::notify::Notifier;

/// Handles shared by every engine component of one account.
#[derive(Clone)]
pub struct EngineContext {
    pub account_id: i64,
    pub db: Database,
    pub exchange: Arc<dyn ExchangeApi>,
    pub notifier: Arc<dyn Notifier>,
    pub config: EngineConfig,
}

/// Market feed operations the engine needs; lets tests run without sockets.
#[async_trait]
pub trait FeedControl: Send + Sync {
    async fn has_live_feed(&self, symbol: &str) -> bool;

    async fn subscribed_symbols(&self) -> Vec<String>;

    async fn stop(&self, symbol: &str);
}

#[async_trait]
impl FeedControl for MarketFeedManager {
    async fn has_live_feed(&self, symbol: &str) -> bool {
        MarketFeedManager::has_live_feed(self, symbol).await
    }

    async fn subscribed_symbols(&self) -> Vec<String> {
        MarketFeedManager::subscribed_symbols(self).await
    }

    async fn stop(&self, symbol: &str) {
        MarketFeedManager::stop(self, symbol).await
    }
}
