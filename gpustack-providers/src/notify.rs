use crate::Notifier;
use async_trait::async_trait;
use gpustack_common::Severity;
use std::time::Duration;

/// Writes notifications to the log only.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!("📣 [notify] {}", message),
            Severity::Warning => tracing::warn!("📣 [notify] {}", message),
            Severity::Critical => tracing::error!("🚨 [notify] {}", message),
        }
    }
}

/// Posts `{"text", "severity", "source"}` to a chat-style webhook.
/// Delivery failures are logged and swallowed.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    source: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, source: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            source: source.to_string(),
        })
    }

    pub fn payload(&self, message: &str, severity: Severity) -> serde_json::Value {
        serde_json::json!({
            "text": message,
            "severity": severity,
            "source": self.source,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str, severity: Severity) {
        let body = self.payload(message, severity);
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("[notify] delivered ({:?})", severity);
            }
            Ok(resp) => {
                tracing::warn!("⚠️ [notify] webhook answered {}", resp.status());
            }
            Err(e) => {
                tracing::warn!("⚠️ [notify] webhook delivery failed: {}", e);
            }
        }
        LogNotifier.notify(message, severity).await;
    }
}
