//! Per-account connection state and the registry that owns it.
//!
//! Everything an account needs (session, gateway, feeds, engine components,
//! balance snapshot) is built once from its credentials and torn down
//! together through the account's cancellation token. Accounts never share
//! anything but the database pool, notifier and credential source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::credentials::{AccountCredentials, CredentialStore};
use crate::db::Database;
use crate::engine::{ArchivalJob, EngineContext, OrderReconciler, SignalEvaluator, TrailingStopEngine};
use crate::exchange::{AccountUpdate, ConnectionSession, ExchangeApi, Gateway, RestClient, SessionOptions};
use crate::feeds::{AccountUpdateListener, MarketFeedManager, UserFeedManager};
use crate::notify::Notifier;

/// Latest wallet balances from `ACCOUNT_UPDATE` events.
#[derive(Default)]
pub struct BalanceTracker {
    account_id: i64,
    balances: StdMutex<HashMap<String, f64>>,
    updated_at: StdMutex<Option<DateTime<Utc>>>,
}

impl BalanceTracker {
    pub fn new(account_id: i64) -> Self {
        Self {
            account_id,
            ..Default::default()
        }
    }

    pub fn wallet_balance(&self, asset: &str) -> Option<f64> {
        self.balances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(asset)
            .copied()
    }

    /// Balances sorted by asset.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut balances: Vec<(String, f64)> = self
            .balances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(asset, amount)| (asset.clone(), *amount))
            .collect();
        balances.sort_by(|a, b| a.0.cmp(&b.0));
        balances
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        *self.updated_at.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl AccountUpdateListener for BalanceTracker {
    async fn on_account_update(&self, update: AccountUpdate) {
        {
            let mut balances = self.balances.lock().unwrap_or_else(|p| p.into_inner());
            for entry in &update.balances {
                balances.insert(entry.asset.clone(), entry.wallet_balance);
            }
        }
        *self.updated_at.lock().unwrap_or_else(|p| p.into_inner()) =
            Utc.timestamp_millis_opt(update.event_time).single().or_else(|| Some(Utc::now()));

        debug!(
            account_id = self.account_id,
            reason = %update.reason,
            balances = update.balances.len(),
            positions = update.positions.len(),
            "Account snapshot"
        );
    }
}

/// Connection state and engine components of one account.
pub struct AccountContext {
    pub account_id: i64,
    pub credentials: AccountCredentials,
    pub session: Arc<ConnectionSession>,
    pub exchange: Arc<dyn ExchangeApi>,
    pub market: Arc<MarketFeedManager>,
    pub user: Arc<UserFeedManager>,
    pub engine: EngineContext,
    pub evaluator: Arc<SignalEvaluator>,
    pub reconciler: Arc<OrderReconciler>,
    pub trailing: Arc<TrailingStopEngine>,
    pub archival: Arc<ArchivalJob>,
    pub balances: Arc<BalanceTracker>,
    pub cancel: CancellationToken,
}

impl AccountContext {
    /// Build and wire every component. Nothing connects yet; a key that
    /// cannot sign fails here.
    pub async fn build(
        credentials: AccountCredentials,
        db: Database,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let account_id = credentials.account_id;

        let session = Arc::new(
            ConnectionSession::new(
                account_id,
                &credentials.ws_api_url,
                &credentials.streaming_key,
                &credentials.signing_key,
                SessionOptions {
                    connect_timeout: config.connect_timeout(),
                    request_timeout: config.request_timeout(),
                },
            )
            .with_context(|| format!("Account {} session", account_id))?,
        );
        let rest = RestClient::new(
            &credentials.rest_url,
            &credentials.api_key,
            &credentials.api_secret,
            config.request_timeout(),
        )
        .with_context(|| format!("Account {} REST client", account_id))?;
        let exchange: Arc<dyn ExchangeApi> = Arc::new(Gateway::new(account_id, session.clone(), rest));

        let market = Arc::new(MarketFeedManager::new(
            account_id,
            &credentials.stream_url,
            config.connect_timeout(),
            config.price_ttl(),
            cancel.child_token(),
        ));
        let user = Arc::new(UserFeedManager::new(
            account_id,
            &credentials.stream_url,
            session.clone(),
            config.connect_timeout(),
            config.listen_key_keepalive(),
            cancel.child_token(),
        ));

        let engine = EngineContext {
            account_id,
            db,
            exchange: exchange.clone(),
            notifier,
            config,
        };
        let reconciler = Arc::new(OrderReconciler::new(engine.clone()));
        let evaluator = Arc::new(SignalEvaluator::new(engine.clone(), reconciler.clone()));
        let trailing = Arc::new(TrailingStopEngine::new(engine.clone(), reconciler.clone()));
        let archival = Arc::new(ArchivalJob::new(engine.clone(), reconciler.clone(), market.clone()));
        let balances = Arc::new(BalanceTracker::new(account_id));

        market.add_listener(evaluator.clone()).await;
        market.add_listener(trailing.clone()).await;
        user.set_order_listener(reconciler.clone()).await;
        user.set_account_listener(balances.clone()).await;

        Ok(Self {
            account_id,
            credentials,
            session,
            exchange,
            market,
            user,
            engine,
            evaluator,
            reconciler,
            trailing,
            archival,
            balances,
            cancel,
        })
    }

    /// Stop every task the account owns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.market.stop_all().await;
        self.user.stop().await;
        self.session.stop().await;
        info!(account_id = self.account_id, "Account shut down");
    }
}

/// Owns the live accounts of this process.
pub struct AccountRegistry {
    db: Database,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    credentials: Arc<dyn CredentialStore>,
    accounts: RwLock<HashMap<i64, Arc<AccountContext>>>,
    cancel: CancellationToken,
}

impl AccountRegistry {
    pub fn new(
        db: Database,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            db,
            notifier,
            config,
            credentials,
            accounts: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Context for `account_id`, built on first use.
    pub async fn open(&self, account_id: i64) -> Result<Arc<AccountContext>> {
        if let Some(existing) = self.accounts.read().await.get(&account_id) {
            return Ok(existing.clone());
        }

        let mut accounts = self.accounts.write().await;
        if let Some(existing) = accounts.get(&account_id) {
            return Ok(existing.clone());
        }

        let credentials = self
            .credentials
            .load(account_id)
            .with_context(|| format!("Failed to load credentials for account {}", account_id))?;
        let context = Arc::new(
            AccountContext::build(
                credentials,
                self.db.clone(),
                self.notifier.clone(),
                self.config.clone(),
                self.cancel.child_token(),
            )
            .await?,
        );

        accounts.insert(account_id, context.clone());
        info!(account_id, "Account registered");
        Ok(context)
    }

    pub async fn get(&self, account_id: i64) -> Option<Arc<AccountContext>> {
        self.accounts.read().await.get(&account_id).cloned()
    }

    pub async fn account_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.accounts.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Tear down one account. False if it was not registered.
    pub async fn close(&self, account_id: i64) -> bool {
        let removed = self.accounts.write().await.remove(&account_id);
        match removed {
            Some(context) => {
                context.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<AccountContext>> = self.accounts.write().await.drain().map(|(_, c)| c).collect();
        for context in drained {
            context.shutdown().await;
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exchange::testing::TEST_SIGNING_KEY;
    use crate::exchange::BalanceEntry;
    use crate::notify::RecordingNotifier;

    /// Credentials for any positive account id, all endpoints at `url`.
    pub(crate) struct StaticCredentials {
        pub url: String,
        pub ws_api_url: Option<String>,
        pub signing_key: String,
    }

    impl StaticCredentials {
        pub fn at(url: &str) -> Self {
            Self {
                url: url.to_string(),
                ws_api_url: None,
                signing_key: TEST_SIGNING_KEY.to_string(),
            }
        }
    }

    impl CredentialStore for StaticCredentials {
        fn load(&self, account_id: i64) -> Result<AccountCredentials> {
            anyhow::ensure!(account_id > 0, "Invalid account id {}", account_id);
            Ok(AccountCredentials {
                account_id,
                api_key: format!("key-{}", account_id),
                api_secret: format!("secret-{}", account_id),
                streaming_key: format!("stream-{}", account_id),
                signing_key: self.signing_key.clone(),
                rest_url: "http://127.0.0.1:9".to_string(),
                stream_url: self.url.clone(),
                ws_api_url: self.ws_api_url.clone().unwrap_or_else(|| self.url.clone()),
            })
        }
    }

    pub(crate) async fn registry(credentials: StaticCredentials) -> AccountRegistry {
        AccountRegistry::new(
            Database::in_memory().await.unwrap(),
            Arc::new(RecordingNotifier::default()),
            EngineConfig::immediate(),
            Arc::new(credentials),
        )
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let registry = registry(StaticCredentials::at("ws://127.0.0.1:9")).await;

        let first = registry.open(3).await.unwrap();
        let second = registry.open(3).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.account_ids().await, vec![3]);
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let registry = registry(StaticCredentials::at("ws://127.0.0.1:9")).await;

        let a = registry.open(1).await.unwrap();
        let b = registry.open(2).await.unwrap();
        assert_eq!(a.session.account_id(), 1);
        assert_eq!(b.session.account_id(), 2);
        assert!(!Arc::ptr_eq(&a.session, &b.session));

        assert!(registry.close(1).await);
        assert!(a.cancel.is_cancelled());
        assert!(!b.cancel.is_cancelled());
        assert_eq!(registry.account_ids().await, vec![2]);
        assert!(!registry.close(1).await);

        registry.close_all().await;
        assert!(b.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_unusable_signing_key_fails_the_account() {
        let mut credentials = StaticCredentials::at("ws://127.0.0.1:9");
        credentials.signing_key = "not-a-key!".to_string();
        let registry = registry(credentials).await;

        assert!(registry.open(5).await.is_err());
        assert!(registry.get(5).await.is_none());
    }

    #[test]
    fn test_balance_tracker_keeps_latest_snapshot() {
        let tracker = BalanceTracker::new(1);
        let update = |usdt: f64| AccountUpdate {
            account_id: 1,
            reason: "ORDER".to_string(),
            balances: vec![BalanceEntry {
                asset: "USDT".to_string(),
                wallet_balance: usdt,
                cross_wallet_balance: usdt,
            }],
            positions: Vec::new(),
            event_time: 1_700_000_000_000,
        };

        tokio_test::block_on(tracker.on_account_update(update(50.0)));
        tokio_test::block_on(tracker.on_account_update(update(75.5)));

        assert_eq!(tracker.wallet_balance("USDT"), Some(75.5));
        assert_eq!(tracker.snapshot(), vec![("USDT".to_string(), 75.5)]);
        assert!(tracker.updated_at().is_some());
        assert_eq!(tracker.wallet_balance("BNB"), None);
    }
}
