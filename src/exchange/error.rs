//! Exchange error taxonomy shared by the WS API session and the REST client.

use thiserror::Error;

use crate::signing::SigningError;

/// Exchange error codes meaning the order does not exist (anymore).
const ORDER_NOT_FOUND_CODES: [i64; 2] = [-2011, -2013];
/// Exchange error codes for request-rate limits.
const RATE_LIMIT_CODES: [i64; 2] = [-1003, -1015];

#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Credentials or key material unusable. Fatal to the account's session.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("connect timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,

    #[error("session not authenticated")]
    NotAuthenticated,

    /// The request never left this process.
    #[error("session request not sent")]
    NotSent,

    #[error("request {method} timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    /// Malformed or unexpected frame/body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Order rejected locally before it reached the exchange.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// The exchange answered with an error.
    #[error("exchange error {status} (code {code}): {msg}")]
    Api { status: u16, code: i64, msg: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ExchangeError {
    /// True for transport-level failures healed by reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ExchangeError::ConnectTimeout(_)
                | ExchangeError::Transport(_)
                | ExchangeError::Closed
                | ExchangeError::NotAuthenticated
                | ExchangeError::NotSent
                | ExchangeError::Timeout { .. }
        )
    }

    /// True when the request certainly did not reach the exchange.
    pub fn is_unsent(&self) -> bool {
        matches!(self, ExchangeError::NotAuthenticated | ExchangeError::NotSent)
    }

    /// True when the request went out but its reply was lost, so the
    /// exchange may or may not have acted on it.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, ExchangeError::Closed | ExchangeError::Timeout { .. })
    }

    /// True when the exchange reports the order as unknown.
    pub fn is_order_not_found(&self) -> bool {
        match self {
            ExchangeError::Api { code, msg, .. } => {
                ORDER_NOT_FOUND_CODES.contains(code)
                    || msg.contains("Unknown order")
                    || msg.contains("Order does not exist")
            }
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            ExchangeError::Api { status, code, .. } => {
                *status == 429 || *status == 418 || RATE_LIMIT_CODES.contains(code)
            }
            _ => false,
        }
    }

    /// True for errors that must stop the account's session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Config(_) | ExchangeError::Signing(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ExchangeError::Closed,
            other => ExchangeError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Protocol(e.to_string())
    }
}
