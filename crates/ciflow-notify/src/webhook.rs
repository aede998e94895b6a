use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ciflow_core::NotificationEvent;
use reqwest::Client;
use thiserror::Error;
use tracing::{info, warn};

use crate::payload::{build_payload, WebhookType};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook url not configured")]
    NotConfigured,
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Posts the payload for its [`WebhookType`] to a fixed URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    kind: WebhookType,
}

impl WebhookNotifier {
    pub fn new(url: &str, kind: WebhookType, timeout: Duration) -> Result<Self, NotifyError> {
        if url.trim().is_empty() {
            return Err(NotifyError::NotConfigured);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            kind,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = build_payload(event, self.kind);
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }
}

/// Used when no webhook is configured; every notification is logged and dropped.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        info!(job = %event.job_name, "notification skipped: no webhook configured");
        Err(NotifyError::NotConfigured)
    }
}

/// Records events in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<NotificationEvent>>,
    fail: bool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that records the attempt, then reports a delivery error.
    pub fn failing() -> Self {
        Self { events: Mutex::new(Vec::new()), fail: true }
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        if self.fail {
            return Err(NotifyError::Status { status: 500, body: "scripted failure".into() });
        }
        Ok(())
    }
}

/// Single delivery attempt. Errors are logged and swallowed; the return value
/// only says whether the message went out.
pub async fn notify_best_effort(notifier: &dyn Notifier, event: &NotificationEvent) -> bool {
    match notifier.notify(event).await {
        Ok(()) => {
            info!(job = %event.job_name, workflow = %event.workflow, "failure notification sent");
            true
        }
        Err(e) => {
            warn!(job = %event.job_name, error = %e, "failure notification not delivered");
            false
        }
    }
}
