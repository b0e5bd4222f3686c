//! Outbound notifications about applied moderation actions.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, channel: &str, message: &str) -> Result<()>;
}

/// Sink used when no webhook is configured; messages only reach the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationSink for LoggingNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<()> {
        info!(channel = %channel, message = %message, "Notification");
        Ok(())
    }
}

/// Posts messages to a Slack incoming webhook.
#[derive(Clone)]
pub struct SlackNotifier {
    http_client: reqwest::Client,
    webhook_url: String,
    request_timeout: Duration,
}

impl SlackNotifier {
    pub fn new(http_client: reqwest::Client, webhook_url: String, request_timeout: Duration) -> Self {
        Self {
            http_client,
            webhook_url,
            request_timeout,
        }
    }
}

#[async_trait]
impl NotificationSink for SlackNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<()> {
        let request = self
            .http_client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": message }))
            .send();

        let response = match timeout(self.request_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(anyhow!("slack webhook request failed: {}", e)),
            Err(_) => {
                return Err(anyhow!(
                    "slack webhook timed out after {}ms",
                    self.request_timeout.as_millis()
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("slack webhook returned HTTP {}", status.as_u16()));
        }

        info!(channel = %channel, "Sent notification");
        Ok(())
    }
}

/// What changed for one account during one flush.
#[derive(Debug, Default, Clone)]
pub struct NotificationSummary {
    pub did: String,
    pub handle: Option<String>,
    pub new_labels: Vec<String>,
    pub removed_labels: Vec<String>,
    pub new_flags: Vec<String>,
    pub new_tags: Vec<String>,
    pub reports: Vec<String>,
}

impl NotificationSummary {
    pub fn is_empty(&self) -> bool {
        self.new_labels.is_empty()
            && self.removed_labels.is_empty()
            && self.new_flags.is_empty()
            && self.new_tags.is_empty()
            && self.reports.is_empty()
    }

    pub fn message(&self) -> String {
        let mut msg = format!(
            "⚠️ Automod Account Action ⚠️\nAccount: `{}` (@{})\n",
            self.did,
            self.handle.as_deref().unwrap_or("handle.invalid")
        );
        if !self.new_labels.is_empty() {
            msg.push_str(&format!("New Labels: `{}`\n", self.new_labels.join(", ")));
        }
        if !self.removed_labels.is_empty() {
            msg.push_str(&format!(
                "Removed Labels: `{}`\n",
                self.removed_labels.join(", ")
            ));
        }
        if !self.new_flags.is_empty() {
            msg.push_str(&format!("New Flags: `{}`\n", self.new_flags.join(", ")));
        }
        if !self.new_tags.is_empty() {
            msg.push_str(&format!("New Tags: `{}`\n", self.new_tags.join(", ")));
        }
        for report in &self.reports {
            msg.push_str(&format!("Report: {}\n", report));
        }
        msg
    }
}
