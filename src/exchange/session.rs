//! Authenticated, request-correlated WS API session for one account.
//!
//! The session never reconnects on its own: on transport close it rejects
//! every pending request, drops to `Disconnected` and waits for the runner's
//! health check to call [`ConnectionSession::start`] again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ExchangeError;
use crate::signing::RequestSigner;

type Waiter = oneshot::Sender<Result<Value, ExchangeError>>;

const LOGON_METHOD: &str = "session.logon";

/// Method prefixes that carry `apiKey`, `timestamp` and an Ed25519 signature.
const SIGNED_METHOD_PREFIXES: [&str; 4] = ["session.logon", "order.", "account.", "v2/account."];
/// Method prefixes that carry only `apiKey`.
const KEYED_METHOD_PREFIXES: [&str; 1] = ["userDataStream."];

/// Lifecycle of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Closing,
}

/// Time bounds for connect and request round trips.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    pending: Mutex<HashMap<String, Waiter>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Bumped on every connect; a reader only tears down its own generation.
    generation: AtomicU64,
}

/// WS API session for one account.
pub struct ConnectionSession {
    account_id: i64,
    url: String,
    api_key: String,
    signer: RequestSigner,
    options: SessionOptions,
    shared: Arc<Shared>,
    start_lock: Mutex<()>,
}

impl ConnectionSession {
    /// Create a session. Fails when the signing key is unusable.
    pub fn new(
        account_id: i64,
        url: &str,
        api_key: &str,
        signing_key: &str,
        options: SessionOptions,
    ) -> Result<Self, ExchangeError> {
        if api_key.trim().is_empty() {
            return Err(ExchangeError::Config(format!(
                "account {} has no streaming API key",
                account_id
            )));
        }
        let signer = RequestSigner::from_key_text(signing_key)?;
        info!(account_id, backend = ?signer.backend(), "Session signer ready");

        Ok(Self {
            account_id,
            url: url.to_string(),
            api_key: api_key.to_string(),
            signer,
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Disconnected),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
            start_lock: Mutex::new(()),
        })
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.lock().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state().await == SessionState::Authenticated
    }

    /// Number of requests awaiting a reply.
    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Connect and log on. No-op when already authenticated; concurrent
    /// starts are serialized.
    pub async fn start(&self) -> Result<(), ExchangeError> {
        let _guard = self.start_lock.lock().await;

        if self.is_authenticated().await {
            return Ok(());
        }

        // Replace, never duplicate, a half-open connection
        self.teardown().await;
        self.set_state(SessionState::Connecting).await;

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws, _) = match tokio::time::timeout(self.options.connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.set_state(SessionState::Disconnected).await;
                return Err(e.into());
            }
            Err(_) => {
                self.set_state(SessionState::Disconnected).await;
                return Err(ExchangeError::ConnectTimeout(
                    self.options.connect_timeout.as_secs(),
                ));
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.outbound.lock().await = Some(tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let shared = self.shared.clone();
        let account_id = self.account_id;
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => handle_frame(&shared, account_id, &text).await,
                    Ok(Message::Ping(payload)) => {
                        if let Some(tx) = shared.outbound.lock().await.as_ref() {
                            let _ = tx.send(Message::Pong(payload));
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!(account_id, ?frame, "Session closed by exchange");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(account_id, error = %e, "Session transport error");
                        break;
                    }
                }
            }
            on_closed(&shared, account_id, generation).await;
        });

        self.shared.tasks.lock().await.extend([writer, reader]);
        self.set_state(SessionState::Connected).await;
        debug!(account_id = self.account_id, url = %self.url, "Session connected");

        self.set_state(SessionState::Authenticating).await;
        match self.request(LOGON_METHOD, Vec::new()).await {
            Ok(_) => {
                self.set_state(SessionState::Authenticated).await;
                info!(account_id = self.account_id, "Session authenticated");
                Ok(())
            }
            Err(e) => {
                warn!(account_id = self.account_id, error = %e, "Session logon failed");
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// Requires an authenticated session.
    pub async fn call(
        &self,
        method: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        if !self.is_authenticated().await {
            return Err(ExchangeError::NotAuthenticated);
        }
        self.request(method, params).await
    }

    async fn request(
        &self,
        method: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        let params = self.prepare_params(method, params);
        let id = Uuid::new_v4().to_string();
        let frame = json!({
            "id": id,
            "method": method,
            "params": params_object(&params),
        });

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        let sent = match self.shared.outbound.lock().await.as_ref() {
            Some(out) => out.send(Message::Text(frame.to_string())).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.pending.lock().await.remove(&id);
            return Err(ExchangeError::NotSent);
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ExchangeError::Closed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(ExchangeError::Timeout {
                    method: method.to_string(),
                    secs: self.options.request_timeout.as_secs(),
                })
            }
        }
    }

    fn prepare_params(&self, method: &str, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        let signed = SIGNED_METHOD_PREFIXES.iter().any(|p| method.starts_with(p));
        let keyed = KEYED_METHOD_PREFIXES.iter().any(|p| method.starts_with(p));

        if signed || keyed {
            params.retain(|(k, _)| k != "apiKey");
            params.push(("apiKey".to_string(), self.api_key.clone()));
        }
        if signed {
            params.retain(|(k, _)| k != "timestamp");
            params.push((
                "timestamp".to_string(),
                Utc::now().timestamp_millis().to_string(),
            ));
            params = self.signer.sign_params(params);
        }
        params
    }

    /// Close the connection and stop its tasks.
    pub async fn stop(&self) {
        let _guard = self.start_lock.lock().await;
        self.teardown().await;
        info!(account_id = self.account_id, "Session stopped");
    }

    async fn teardown(&self) {
        if self.state().await != SessionState::Disconnected {
            self.set_state(SessionState::Closing).await;

            // Orphan the current reader so it does not race the cleanup below
            self.shared.generation.fetch_add(1, Ordering::SeqCst);

            if let Some(tx) = self.shared.outbound.lock().await.take() {
                let _ = tx.send(Message::Close(None));
            }
            // Give the writer a moment to flush the close frame
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Also reaps the tasks of a connection the exchange closed
        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }
        reject_pending(&self.shared).await;
        self.set_state(SessionState::Disconnected).await;
    }

    /// Connection tasks currently held.
    pub async fn task_count(&self) -> usize {
        self.shared.tasks.lock().await.len()
    }

    async fn set_state(&self, state: SessionState) {
        *self.shared.state.lock().await = state;
    }
}

fn params_object(params: &[(String, String)]) -> Value {
    let map: serde_json::Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map)
}

async fn handle_frame(shared: &Shared, account_id: i64, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(account_id, error = %e, "Dropping unparseable session frame");
            return;
        }
    };

    let Some(id) = frame.get("id").and_then(Value::as_str) else {
        debug!(account_id, "Dropping uncorrelated session frame");
        return;
    };

    let Some(waiter) = shared.pending.lock().await.remove(id) else {
        warn!(account_id, id, "Reply for unknown or expired request");
        return;
    };

    let _ = waiter.send(reply_result(&frame));
}

/// Map a reply frame to its result or an `Api` error.
fn reply_result(frame: &Value) -> Result<Value, ExchangeError> {
    let status = frame.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
    if (200..300).contains(&status) {
        return Ok(frame.get("result").cloned().unwrap_or(Value::Null));
    }

    let error = frame.get("error");
    Err(ExchangeError::Api {
        status,
        code: error
            .and_then(|e| e.get("code"))
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        msg: error
            .and_then(|e| e.get("msg"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    })
}

async fn reject_pending(shared: &Shared) {
    let waiters: Vec<Waiter> = shared.pending.lock().await.drain().map(|(_, w)| w).collect();
    for waiter in waiters {
        let _ = waiter.send(Err(ExchangeError::Closed));
    }
}

async fn on_closed(shared: &Shared, account_id: i64, generation: u64) {
    if shared.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    reject_pending(shared).await;
    shared.outbound.lock().await.take();
    *shared.state.lock().await = SessionState::Disconnected;
    info!(account_id, "Session disconnected; waiting for health check");
}
