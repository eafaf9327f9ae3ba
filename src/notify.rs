//! Operator notifications. Fire-and-forget: delivery failures are logged,
//! never returned to the engine.

use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

pub trait Notifier: Send + Sync {
    fn notify(&self, account_id: i64, message: String);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, account_id: i64, message: String) {
        info!(account_id, "📣 {}", message);
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    account_id: i64,
    text: &'a str,
}

/// Posts notifications as JSON to a webhook URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    async fn deliver(http: Client, url: String, account_id: i64, message: String) -> Result<()> {
        let payload = WebhookPayload {
            account_id,
            text: &message,
        };
        let resp = http.post(&url).json(&payload).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Webhook rejected notification: {} - {}", status, text));
        }

        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, account_id: i64, message: String) {
        let http = self.http.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::deliver(http, url, account_id, message).await {
                warn!(account_id, error = %e, "Notification delivery failed");
            }
        });
    }
}

/// Collects notifications for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    messages: std::sync::Mutex<Vec<(i64, String)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(i64, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, account_id: i64, message: String) {
        self.messages.lock().unwrap().push((account_id, message));
    }
}
