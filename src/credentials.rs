//! Per-account exchange credentials.

use anyhow::{bail, Context, Result};

use crate::exchange::{DEFAULT_REST_URL, DEFAULT_STREAM_URL, DEFAULT_WS_API_URL};

/// Keys and endpoints for one account.
#[derive(Clone)]
pub struct AccountCredentials {
    pub account_id: i64,
    /// REST API key (HMAC)
    pub api_key: String,
    pub api_secret: String,
    /// WS API key bound to the Ed25519 signing key
    pub streaming_key: String,
    /// Ed25519 private key as PEM, hex or base64
    pub signing_key: String,
    pub rest_url: String,
    pub stream_url: String,
    pub ws_api_url: String,
}

impl std::fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("account_id", &self.account_id)
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &"<redacted>")
            .field("streaming_key", &redact(&self.streaming_key))
            .field("signing_key", &"<redacted>")
            .field("rest_url", &self.rest_url)
            .field("stream_url", &self.stream_url)
            .field("ws_api_url", &self.ws_api_url)
            .finish()
    }
}

fn redact(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}…", prefix)
}

/// Source of account credentials.
pub trait CredentialStore: Send + Sync {
    fn load(&self, account_id: i64) -> Result<AccountCredentials>;
}

/// Reads `ACCOUNT_<ID>_*` environment variables:
/// - ACCOUNT_<ID>_API_KEY, ACCOUNT_<ID>_API_SECRET
/// - ACCOUNT_<ID>_STREAMING_KEY, ACCOUNT_<ID>_SIGNING_KEY
/// - ACCOUNT_<ID>_REST_URL, _STREAM_URL, _WS_API_URL (optional)
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    fn var(account_id: i64, suffix: &str) -> Option<String> {
        std::env::var(format!("ACCOUNT_{}_{}", account_id, suffix))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    fn required(account_id: i64, suffix: &str) -> Result<String> {
        Self::var(account_id, suffix)
            .with_context(|| format!("ACCOUNT_{}_{} not set", account_id, suffix))
    }
}

impl CredentialStore for EnvCredentialStore {
    fn load(&self, account_id: i64) -> Result<AccountCredentials> {
        if account_id <= 0 {
            bail!("Invalid account id {}", account_id);
        }

        let api_key = Self::required(account_id, "API_KEY")?;
        let streaming_key = Self::var(account_id, "STREAMING_KEY").unwrap_or_else(|| api_key.clone());

        Ok(AccountCredentials {
            account_id,
            api_secret: Self::required(account_id, "API_SECRET")?,
            signing_key: Self::required(account_id, "SIGNING_KEY")?,
            streaming_key,
            api_key,
            rest_url: Self::var(account_id, "REST_URL").unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
            stream_url: Self::var(account_id, "STREAM_URL")
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            ws_api_url: Self::var(account_id, "WS_API_URL")
                .unwrap_or_else(|| DEFAULT_WS_API_URL.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_env_with_defaults() {
        std::env::set_var("ACCOUNT_901_API_KEY", "abcdefgh");
        std::env::set_var("ACCOUNT_901_API_SECRET", "hunter2-value");
        std::env::set_var("ACCOUNT_901_SIGNING_KEY", "seed");

        let creds = EnvCredentialStore.load(901).unwrap();
        assert_eq!(creds.streaming_key, "abcdefgh");
        assert_eq!(creds.rest_url, DEFAULT_REST_URL);

        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("abcdefgh"));
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let err = EnvCredentialStore.load(902).unwrap_err();
        assert!(err.to_string().contains("ACCOUNT_902_API_KEY"));
    }
}
