//! Webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{Notifier, NotifyError};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    entity_id: &'a str,
    message: &'a str,
}

/// Posts each notification as JSON to a fixed URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, entity_id: &str, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { entity_id, message })
            .send()
            .await
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_webhook_unreachable_is_unavailable() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        let result = notifier.send("home-1", "Power went off").await;
        assert!(matches!(result, Err(NotifyError::Unavailable(_))));
    }
}
