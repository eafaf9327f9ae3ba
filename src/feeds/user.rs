//! Private user-data stream for one account.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_user_event, AccountUpdateListener, OrderUpdateListener, UserEvent};
use crate::exchange::{ConnectionSession, ExchangeError};

struct Running {
    reader: JoinHandle<()>,
    keepalive: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Listen-key lifecycle and dispatch of order/account updates.
pub struct UserFeedManager {
    account_id: i64,
    stream_url: String,
    session: Arc<ConnectionSession>,
    connect_timeout: Duration,
    keepalive_interval: Duration,
    order_listener: Arc<RwLock<Option<Arc<dyn OrderUpdateListener>>>>,
    account_listener: Arc<RwLock<Option<Arc<dyn AccountUpdateListener>>>>,
    running: Mutex<Option<Running>>,
    cancel: CancellationToken,
}

impl UserFeedManager {
    pub fn new(
        account_id: i64,
        stream_url: &str,
        session: Arc<ConnectionSession>,
        connect_timeout: Duration,
        keepalive_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            account_id,
            stream_url: stream_url.trim_end_matches('/').to_string(),
            session,
            connect_timeout,
            keepalive_interval,
            order_listener: Arc::new(RwLock::new(None)),
            account_listener: Arc::new(RwLock::new(None)),
            running: Mutex::new(None),
            cancel,
        }
    }

    pub async fn set_order_listener(&self, listener: Arc<dyn OrderUpdateListener>) {
        *self.order_listener.write().await = Some(listener);
    }

    pub async fn set_account_listener(&self, listener: Arc<dyn AccountUpdateListener>) {
        *self.account_listener.write().await = Some(listener);
    }

    pub async fn is_live(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(false, |r| !r.reader.is_finished())
    }

    /// Start the private stream unless it is already live. Needs an
    /// authenticated session for the listen key.
    pub async fn ensure(&self) -> Result<bool, ExchangeError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.reader.is_finished() {
                return Ok(false);
            }
        }
        if let Some(dead) = running.take() {
            dead.cancel.cancel();
            dead.keepalive.abort();
        }

        let listen_key = self.start_listen_key().await?;
        let url = format!("{}/ws/{}", self.stream_url, listen_key);

        let ws = match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ExchangeError::ConnectTimeout(self.connect_timeout.as_secs())),
        };

        let cancel = self.cancel.child_token();
        let reader = tokio::spawn(read_stream(
            self.account_id,
            ws,
            self.order_listener.clone(),
            self.account_listener.clone(),
            cancel.clone(),
        ));
        let keepalive = tokio::spawn(keep_alive(
            self.account_id,
            self.session.clone(),
            self.keepalive_interval,
            cancel.clone(),
        ));

        *running = Some(Running {
            reader,
            keepalive,
            cancel,
        });
        info!(account_id = self.account_id, "User data stream started");

        Ok(true)
    }

    pub async fn stop(&self) {
        if let Some(current) = self.running.lock().await.take() {
            current.cancel.cancel();
            current.keepalive.abort();
            // Give the reader a chance to send its close frame
            if tokio::time::timeout(Duration::from_millis(500), current.reader).await.is_err() {
                debug!(account_id = self.account_id, "User stream reader did not stop in time");
            }
            info!(account_id = self.account_id, "User data stream stopped");
        }
    }

    async fn start_listen_key(&self) -> Result<String, ExchangeError> {
        let result = self.session.call("userDataStream.start", Vec::new()).await?;
        listen_key_from(&result)
    }
}

fn listen_key_from(result: &Value) -> Result<String, ExchangeError> {
    result
        .get("listenKey")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ExchangeError::Protocol(format!("no listenKey in {}", result)))
}

async fn keep_alive(
    account_id: i64,
    session: Arc<ConnectionSession>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match session.call("userDataStream.ping", Vec::new()).await {
                    Ok(_) => debug!(account_id, "Listen key refreshed"),
                    Err(e) => warn!(account_id, error = %e, "Listen key keepalive failed"),
                }
            }
        }
    }
}

async fn read_stream<S>(
    account_id: i64,
    mut ws: tokio_tungstenite::WebSocketStream<S>,
    order_listener: Arc<RwLock<Option<Arc<dyn OrderUpdateListener>>>>,
    account_listener: Arc<RwLock<Option<Arc<dyn AccountUpdateListener>>>>,
    cancel: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }
            frame = ws.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(account_id, "User data stream closed");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(account_id, error = %e, "User data stream error");
                break;
            }
        };

        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            warn!(account_id, "Dropping unparseable user frame");
            continue;
        };

        match parse_user_event(account_id, &value) {
            UserEvent::Order(update) => {
                let listener = order_listener.read().await.clone();
                if let Some(listener) = listener {
                    listener.on_order_update(update).await;
                }
            }
            UserEvent::Account(update) => {
                let listener = account_listener.read().await.clone();
                if let Some(listener) = listener {
                    listener.on_account_update(update).await;
                }
            }
            UserEvent::ListenKeyExpired => {
                warn!(account_id, "Listen key expired; stream ends until the next health check");
                break;
            }
            UserEvent::Ignored(kind) => debug!(account_id, kind = %kind, "Ignoring user event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::{spawn_api_server, spawn_stream_server, TEST_SIGNING_KEY};
    use crate::exchange::{AccountUpdate, OrderUpdate, SessionOptions};
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        orders: std::sync::Mutex<Vec<OrderUpdate>>,
        accounts: std::sync::Mutex<Vec<AccountUpdate>>,
    }

    #[async_trait]
    impl OrderUpdateListener for Recorder {
        async fn on_order_update(&self, update: OrderUpdate) {
            self.orders.lock().unwrap().push(update);
        }
    }

    #[async_trait]
    impl AccountUpdateListener for Recorder {
        async fn on_account_update(&self, update: AccountUpdate) {
            self.accounts.lock().unwrap().push(update);
        }
    }

    #[tokio::test]
    async fn test_listen_key_stream_dispatch() {
        let api = spawn_api_server().await;
        let session = Arc::new(
            ConnectionSession::new(4, &api.url, "key-4", TEST_SIGNING_KEY, SessionOptions::default()).unwrap(),
        );
        session.start().await.unwrap();

        let frames = vec![
            json!({"e": "ORDER_TRADE_UPDATE", "E": 1, "o": {
                "s": "BTCUSDT", "c": "pm-en-1", "S": "BUY", "o": "MARKET", "X": "FILLED",
                "i": 77, "q": "0.01", "p": "0", "ap": "100", "sp": "0", "z": "0.01", "l": "0.01",
                "R": false, "cp": false
            }})
            .to_string(),
            json!({"e": "ACCOUNT_UPDATE", "E": 2, "a": {"m": "ORDER", "B": [{"a": "USDT", "wb": "50", "cw": "50"}], "P": []}})
                .to_string(),
            json!({"e": "listenKeyExpired", "E": 3}).to_string(),
        ];
        let stream = spawn_stream_server(frames, false).await;

        let feed = UserFeedManager::new(
            4,
            &stream.url,
            session,
            Duration::from_secs(2),
            Duration::from_secs(1800),
            CancellationToken::new(),
        );
        let recorder = Arc::new(Recorder::default());
        feed.set_order_listener(recorder.clone()).await;
        feed.set_account_listener(recorder.clone()).await;

        assert!(feed.ensure().await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(stream.paths(), vec!["/ws/lk-test".to_string()]);
        assert_eq!(recorder.orders.lock().unwrap()[0].external_id, "77");
        assert_eq!(recorder.accounts.lock().unwrap().len(), 1);

        // listenKeyExpired ended the stream; the next ensure restarts it
        assert!(!feed.is_live().await);
        assert!(feed.ensure().await.unwrap());
        assert_eq!(api.requests_for("userDataStream.start").len(), 2);
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_ensure_requires_session() {
        let session = Arc::new(
            ConnectionSession::new(4, "ws://127.0.0.1:9", "key-4", TEST_SIGNING_KEY, SessionOptions::default())
                .unwrap(),
        );
        let feed = UserFeedManager::new(
            4,
            "ws://127.0.0.1:9",
            session,
            Duration::from_secs(1),
            Duration::from_secs(1800),
            CancellationToken::new(),
        );
        assert!(matches!(feed.ensure().await, Err(ExchangeError::NotAuthenticated)));
    }

    #[test]
    fn test_listen_key_extraction() {
        assert_eq!(listen_key_from(&json!({"listenKey": "abc"})).unwrap(), "abc");
        assert!(listen_key_from(&json!({})).is_err());
    }
}
