//! Audit/notification channel delivering operator-facing events.
//!
//! Delivery is strictly best-effort: a failed send is logged and swallowed,
//! it never affects the lifecycle operation that raised the event.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Urgent,
}

/// Forensic payload attached to an event, e.g. a session's command history.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl AuditEvent {
    pub fn new(title: &str, message: String, severity: Severity) -> Self {
        Self {
            title: title.to_string(),
            message,
            severity,
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, filename: String, content: String) -> Self {
        self.attachment = Some(Attachment { filename, content });
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn send(&self, event: AuditEvent);
}

/// POSTs events as JSON to a fixed operator webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl AuditSink for WebhookSink {
    async fn send(&self, event: AuditEvent) {
        let result = self.client.post(&self.url).json(&event).send().await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!("audit webhook returned {} for '{}'", resp.status(), event.title);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("audit webhook unreachable for '{}': {}", event.title, e);
            }
        }
    }
}

/// Fallback sink used when no webhook is configured: events go to the log.
pub struct LogSink;

#[async_trait]
impl AuditSink for LogSink {
    async fn send(&self, event: AuditEvent) {
        info!(
            severity = ?event.severity,
            attachment = event.attachment.as_ref().map(|a| a.filename.as_str()),
            "AUDIT {}: {}",
            event.title,
            event.message
        );
    }
}
