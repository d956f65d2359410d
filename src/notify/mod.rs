//! Webhook notifications for confirmed status transitions.
//!
//! Delivery is fire-and-forget: each notification runs on its own task, is
//! attempted once, and failures are only logged.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::db::Monitor;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook rejected with status {0}")]
    Rejected(StatusCode),
}

/// Body POSTed to a monitor's webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub monitor_id: i64,
    pub name: String,
    pub target: String,
    pub status: &'static str,
    pub message: String,
    pub diagnostic: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn new(monitor: &Monitor, is_up: bool, diagnostic: Option<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            monitor_id: monitor.id,
            name: monitor.name.clone(),
            target: monitor.target.clone(),
            status: if is_up { "up" } else { "down" },
            message: status_message(monitor, is_up, diagnostic.as_deref()),
            diagnostic,
            timestamp,
        }
    }
}

/// Human-readable one-liner for a transition.
pub fn status_message(monitor: &Monitor, is_up: bool, diagnostic: Option<&str>) -> String {
    match (is_up, diagnostic) {
        (true, _) => format!("{} ({}) is back UP", monitor.name, monitor.target),
        (false, Some(diag)) => format!("{} ({}) is DOWN: {}", monitor.name, monitor.target, diag),
        (false, None) => format!("{} ({}) is DOWN", monitor.name, monitor.target),
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    client: reqwest::Client,
}

impl NotificationDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Queue a notification for the monitor's webhook, if it has one.
    ///
    /// Returns the delivery task so callers that care can wait on it.
    pub fn notify(
        &self,
        monitor: &Monitor,
        is_up: bool,
        diagnostic: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<JoinHandle<()>> {
        let url = monitor.webhook_url.clone()?;
        let payload = WebhookPayload::new(monitor, is_up, diagnostic, at);
        let client = self.client.clone();

        Some(tokio::spawn(async move {
            match deliver(&client, &url, &payload).await {
                Ok(()) => tracing::info!(
                    monitor_id = payload.monitor_id,
                    "Webhook delivered: {}",
                    payload.message
                ),
                Err(e) => tracing::warn!(
                    monitor_id = payload.monitor_id,
                    error = %e,
                    "Webhook delivery failed"
                ),
            }
        }))
    }
}

async fn deliver(client: &reqwest::Client, url: &str, payload: &WebhookPayload) -> Result<(), NotifyError> {
    let response = client.post(url).json(payload).send().await?;
    if !response.status().is_success() {
        return Err(NotifyError::Rejected(response.status()));
    }
    Ok(())
}
