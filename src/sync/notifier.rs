//! # Notification Hooks
//!
//! Events raised when an operation or task needs operator attention. The
//! webhook notifier posts them to a configured HTTPS endpoint; the log
//! notifier is always on.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::NotifyConfig;
use crate::directory::Scope;
use crate::sync::error::SyncError;

const MAX_WEBHOOK_URL_LEN: usize = 2048;
const WEBHOOK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    #[serde(rename_all = "camelCase")]
    OperationFailed {
        scope: Scope,
        task_id: Uuid,
        operation_id: String,
        error: SyncError,
    },
    #[serde(rename_all = "camelCase")]
    TaskPaused {
        scope: Scope,
        task_id: Uuid,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        scope: Scope,
        task_id: Uuid,
        error: SyncError,
    },
    #[serde(rename_all = "camelCase")]
    ConflictRecorded {
        scope: Scope,
        task_id: Uuid,
        conflict_id: Uuid,
        entity_type: String,
        entity_id: String,
    },
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationEvent::OperationFailed { .. } => "operation_failed",
            NotificationEvent::TaskPaused { .. } => "task_paused",
            NotificationEvent::TaskFailed { .. } => "task_failed",
            NotificationEvent::ConflictRecorded { .. } => "conflict_recorded",
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            NotificationEvent::OperationFailed { task_id, .. }
            | NotificationEvent::TaskPaused { task_id, .. }
            | NotificationEvent::TaskFailed { task_id, .. }
            | NotificationEvent::ConflictRecorded { task_id, .. } => *task_id,
        }
    }
}

/// Delivery is best effort: failures are logged, never propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) {
        warn!(event = event.name(), task_id = %event.task_id(), payload = ?event, "sync notification");
    }
}

/// In-memory sink, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, event: NotificationEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
    initial_backoff: Duration,
}

impl WebhookNotifier {
    /// Rejects non-HTTPS or overlong URLs.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SyncError> {
        validate_webhook_url(url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::configuration(format!("failed to build webhook client: {err}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            initial_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    async fn post(&self, payload: &Value) -> Result<(), String> {
        let mut delay = self.initial_backoff;
        for attempt in 1..=WEBHOOK_ATTEMPTS {
            match self.client.post(&self.url).json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(target_url = %redacted_target(&self.url), attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        target_url = %redacted_target(&self.url),
                        status = %response.status(),
                        attempt,
                        "webhook returned non-success status"
                    );
                    if attempt == WEBHOOK_ATTEMPTS {
                        return Err(format!("status {}", response.status()));
                    }
                }
                Err(err) => {
                    warn!(target_url = %redacted_target(&self.url), attempt, error = %err, "webhook request failed");
                    if attempt == WEBHOOK_ATTEMPTS {
                        return Err(err.to_string());
                    }
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: NotificationEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode notification");
                return;
            }
        };
        if let Err(err) = self.post(&payload).await {
            error!(
                target_url = %redacted_target(&self.url),
                event = event.name(),
                attempts = WEBHOOK_ATTEMPTS,
                error = %err,
                "webhook delivery gave up"
            );
        }
    }
}

/// Delivers each event to every inner notifier in order.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<Arc<dyn Notifier>>) -> Self {
        Self { inner }
    }

    /// Log notifier plus the webhook when one is configured.
    pub fn from_config(config: &NotifyConfig) -> Result<Self, SyncError> {
        let mut inner: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            inner.push(Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(config.timeout_seconds),
            )?));
        }
        Ok(Self { inner })
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: NotificationEvent) {
        for notifier in &self.inner {
            notifier.notify(event.clone()).await;
        }
    }
}

pub fn validate_webhook_url(url: &str) -> Result<(), SyncError> {
    if url.len() > MAX_WEBHOOK_URL_LEN {
        return Err(SyncError::configuration(format!(
            "webhook url exceeds {MAX_WEBHOOK_URL_LEN} characters"
        )));
    }
    if !url.to_lowercase().starts_with("https://") {
        return Err(SyncError::configuration(format!(
            "webhook url must use https: {}",
            redacted_target(url)
        )));
    }
    Url::parse(url).map_err(|err| SyncError::configuration(format!("invalid webhook url: {err}")))?;
    Ok(())
}

fn redacted_target(url: &str) -> String {
    Url::parse(url)
        .ok()
        .map(|parsed| format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or("unknown")))
        .unwrap_or_else(|| "[invalid-url]".to_string())
}
