use async_trait::async_trait;
use tracing::{debug, warn};

use relay_core::{Notifier, Severity};

/// Discards notifications. Default when no webhook is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        debug!(?severity, message, "notification dropped (no webhook configured)");
    }
}

/// Posts notifications to a webhook. Fire-and-forget: delivery failures are
/// logged and swallowed.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        let body = serde_json::json!({
            "severity": format!("{severity:?}").to_lowercase(),
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.client.post(&self.url).json(&body).send().await {
            warn!(error = %e, "failed to deliver webhook notification");
        }
    }
}
