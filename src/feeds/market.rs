//! Market data subscriptions for one account.
//!
//! Every subscription writes into one per-account queue that keeps only the
//! latest price of each symbol. A single dispatch task drains it and calls
//! the listeners one update at a time, so a burst of ticks never piles up
//! and the engine sees the account's prices in order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{normalize_tick, PriceListener};
use crate::exchange::PriceUpdate;

type Listeners = Arc<RwLock<Vec<Arc<dyn PriceListener>>>>;
type PriceCache = Arc<RwLock<HashMap<String, (f64, Instant)>>>;

/// Latest undelivered price per symbol, in first-arrival order.
#[derive(Default)]
struct PriceQueue {
    slots: StdMutex<(VecDeque<String>, HashMap<String, PriceUpdate>)>,
    ready: Notify,
}

impl PriceQueue {
    /// Queue `update`, superseding an undelivered price of the same symbol.
    fn push(&self, update: PriceUpdate) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let (order, latest) = &mut *slots;
            if latest.insert(update.symbol.clone(), update.clone()).is_none() {
                order.push_back(update.symbol);
            }
        }
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<PriceUpdate> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (order, latest) = &mut *slots;
        let symbol = order.pop_front()?;
        latest.remove(&symbol)
    }
}

async fn run_dispatcher(queue: Arc<PriceQueue>, listeners: Listeners, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = queue.ready.notified() => {}
        }
        while let Some(update) = queue.pop() {
            let listeners: Vec<Arc<dyn PriceListener>> = listeners.read().await.clone();
            for listener in listeners {
                listener.on_price(update.clone()).await;
            }
        }
    }
}

/// One combined book-ticker/ticker subscription per symbol.
pub struct MarketFeedManager {
    account_id: i64,
    stream_url: String,
    connect_timeout: Duration,
    ttl: Duration,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    cache: PriceCache,
    listeners: Listeners,
    queue: Arc<PriceQueue>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MarketFeedManager {
    pub fn new(
        account_id: i64,
        stream_url: &str,
        connect_timeout: Duration,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            account_id,
            stream_url: stream_url.trim_end_matches('/').to_string(),
            connect_timeout,
            ttl,
            subscriptions: Mutex::new(HashMap::new()),
            cache: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            queue: Arc::new(PriceQueue::default()),
            dispatcher: Mutex::new(None),
            cancel,
        }
    }

    async fn ensure_dispatcher(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        *dispatcher = Some(tokio::spawn(run_dispatcher(
            self.queue.clone(),
            self.listeners.clone(),
            self.cancel.child_token(),
        )));
    }

    pub async fn add_listener(&self, listener: Arc<dyn PriceListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Subscribe to `symbol` unless a live subscription exists.
    ///
    /// Returns true when a new subscription was started; a dead one is
    /// replaced.
    pub async fn ensure(&self, symbol: &str) -> bool {
        let symbol = symbol.to_uppercase();
        self.ensure_dispatcher().await;
        let mut subs = self.subscriptions.lock().await;

        if let Some(handle) = subs.get(&symbol) {
            if !handle.is_finished() {
                return false;
            }
            debug!(account_id = self.account_id, symbol = %symbol, "Replacing dead market feed");
        }

        let url = format!(
            "{}/stream?streams={sym}@bookTicker/{sym}@ticker",
            self.stream_url,
            sym = symbol.to_lowercase()
        );
        let handle = tokio::spawn(run_subscription(
            self.account_id,
            symbol.clone(),
            url,
            self.connect_timeout,
            self.cache.clone(),
            self.queue.clone(),
            self.cancel.child_token(),
        ));
        subs.insert(symbol.clone(), handle);
        info!(account_id = self.account_id, symbol = %symbol, "Market feed subscribed");

        true
    }

    /// Close the subscription and drop its cached price.
    pub async fn stop(&self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        if let Some(handle) = self.subscriptions.lock().await.remove(&symbol) {
            handle.abort();
            info!(account_id = self.account_id, symbol = %symbol, "Market feed stopped");
        }
        self.cache.write().await.remove(&symbol);
    }

    pub async fn stop_all(&self) {
        let symbols: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        for symbol in symbols {
            self.stop(&symbol).await;
        }
        if let Some(handle) = self.dispatcher.lock().await.take() {
            handle.abort();
        }
    }

    /// Symbols with a live subscription.
    pub async fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(s, _)| s.clone())
            .collect();
        symbols.sort();
        symbols
    }

    /// Symbols with a subscription entry, live or dead.
    pub async fn subscribed_symbols(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    pub async fn has_live_feed(&self, symbol: &str) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(&symbol.to_uppercase())
            .map_or(false, |h| !h.is_finished())
    }

    /// Last price if younger than the TTL.
    pub async fn cached_price(&self, symbol: &str) -> Option<f64> {
        let cache = self.cache.read().await;
        let (price, at) = cache.get(&symbol.to_uppercase())?;
        (at.elapsed() < self.ttl).then_some(*price)
    }
}

async fn run_subscription(
    account_id: i64,
    symbol: String,
    url: String,
    connect_timeout: Duration,
    cache: PriceCache,
    queue: Arc<PriceQueue>,
    cancel: CancellationToken,
) {
    let mut ws = match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            warn!(account_id, symbol = %symbol, error = %e, "Market feed connect failed");
            return;
        }
        Err(_) => {
            warn!(account_id, symbol = %symbol, "Market feed connect timed out");
            return;
        }
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }
            frame = ws.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    debug!(account_id, symbol = %symbol, "Dropping unparseable market frame");
                    continue;
                };
                let Some(tick) = normalize_tick(&value) else {
                    continue;
                };

                cache
                    .write()
                    .await
                    .insert(tick.symbol.clone(), (tick.price, Instant::now()));

                queue.push(PriceUpdate {
                    account_id,
                    symbol: tick.symbol,
                    price: tick.price,
                    source: tick.source,
                    received_at: Instant::now(),
                });
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(account_id, symbol = %symbol, "Market feed closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(account_id, symbol = %symbol, error = %e, "Market feed error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::spawn_stream_server;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Collector {
        prices: std::sync::Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl PriceListener for Collector {
        async fn on_price(&self, update: PriceUpdate) {
            self.prices.lock().unwrap().push(update.price);
        }
    }

    /// Slow listener tracking how many calls overlap.
    #[derive(Default)]
    struct SlowListener {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        last: std::sync::Mutex<Option<f64>>,
    }

    #[async_trait]
    impl PriceListener for SlowListener {
        async fn on_price(&self, update: PriceUpdate) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            *self.last.lock().unwrap() = Some(update.price);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn update(symbol: &str, price: f64) -> PriceUpdate {
        PriceUpdate {
            account_id: 1,
            symbol: symbol.to_string(),
            price,
            source: crate::exchange::PriceSource::Ticker,
            received_at: Instant::now(),
        }
    }

    fn frames() -> Vec<String> {
        vec![
            json!({"stream": "btcusdt@bookTicker", "data": {"e": "bookTicker", "s": "BTCUSDT", "b": "99", "a": "101"}}).to_string(),
            json!({"stream": "btcusdt@bookTicker", "data": {"e": "bookTicker", "s": "BTCUSDT", "b": "105", "a": "101"}}).to_string(),
            "not json".to_string(),
            json!({"stream": "btcusdt@ticker", "data": {"e": "24hrTicker", "s": "BTCUSDT", "c": "102.5"}}).to_string(),
        ]
    }

    fn manager(url: &str, ttl: Duration) -> MarketFeedManager {
        MarketFeedManager::new(1, url, Duration::from_secs(2), ttl, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let server = spawn_stream_server(frames(), false).await;
        let feeds = manager(&server.url, Duration::from_secs(30));

        assert!(feeds.ensure("BTCUSDT").await);
        assert!(!feeds.ensure("btcusdt").await);
        assert_eq!(feeds.active_symbols().await, vec!["BTCUSDT".to_string()]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connection_count(), 1);
        assert_eq!(
            server.paths(),
            vec!["/stream?streams=btcusdt@bookTicker/btcusdt@ticker".to_string()]
        );
    }

    #[tokio::test]
    async fn test_prices_normalized_cached_and_fanned_out() {
        let server = spawn_stream_server(frames(), false).await;
        let feeds = manager(&server.url, Duration::from_secs(30));
        let collector = Arc::new(Collector::default());
        feeds.add_listener(collector.clone()).await;

        feeds.ensure("BTCUSDT").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Crossed book and garbage frame dropped; an undelivered tick may be
        // superseded by a newer one, never reordered
        let prices = collector.prices.lock().unwrap().clone();
        assert!(prices == vec![100.0, 102.5] || prices == vec![102.5], "{:?}", prices);
        assert_eq!(feeds.cached_price("BTCUSDT").await, Some(102.5));

        feeds.stop("BTCUSDT").await;
        assert_eq!(feeds.cached_price("BTCUSDT").await, None);
        assert!(!feeds.has_live_feed("BTCUSDT").await);
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let server = spawn_stream_server(frames(), false).await;
        let feeds = manager(&server.url, Duration::from_millis(100));

        feeds.ensure("BTCUSDT").await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(feeds.cached_price("BTCUSDT").await, None);
    }

    #[tokio::test]
    async fn test_dead_feed_is_replaced() {
        let server = spawn_stream_server(frames(), true).await;
        let feeds = manager(&server.url, Duration::from_secs(30));

        assert!(feeds.ensure("BTCUSDT").await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!feeds.has_live_feed("BTCUSDT").await);

        assert!(feeds.ensure("BTCUSDT").await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn test_queue_keeps_latest_price_per_symbol() {
        let queue = PriceQueue::default();
        queue.push(update("BTCUSDT", 100.0));
        queue.push(update("ETHUSDT", 10.0));
        queue.push(update("BTCUSDT", 101.0));

        let first = queue.pop().unwrap();
        assert_eq!((first.symbol.as_str(), first.price), ("BTCUSDT", 101.0));
        let second = queue.pop().unwrap();
        assert_eq!((second.symbol.as_str(), second.price), ("ETHUSDT", 10.0));
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_burst_is_delivered_serially_and_coalesced() {
        let queue = Arc::new(PriceQueue::default());
        let listener = Arc::new(SlowListener::default());
        let listeners: Listeners = Arc::new(RwLock::new(vec![listener.clone() as Arc<dyn PriceListener>]));
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(queue.clone(), listeners, cancel.clone()));

        for i in 0..200 {
            queue.push(update("BTCUSDT", 100.0 + i as f64));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(listener.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(listener.calls.load(Ordering::SeqCst) <= 3);
        assert_eq!(*listener.last.lock().unwrap(), Some(299.0));

        cancel.cancel();
        dispatcher.await.unwrap();
    }
}
