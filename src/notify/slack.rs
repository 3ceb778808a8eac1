use super::{NotificationMessage, Notify};
use crate::types::{RelayError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Slack incoming-webhook channel.
pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
}

/// Flat payload mirroring what the destination app expects per entry.
#[derive(Debug, Serialize)]
struct SlackPayload<'a> {
    category: &'a str,
    published: String,
    title: &'a str,
    link: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

impl SlackNotifier {
    pub fn new(webhook_url: String, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| RelayError::Delivery {
                destination: "slack".to_string(),
                reason: format!("failed to build client: {}", e),
            })?;

        Ok(Self {
            webhook_url,
            client,
        })
    }
}

#[async_trait]
impl Notify for SlackNotifier {
    async fn deliver(&self, message: &NotificationMessage) -> Result<()> {
        let payload = SlackPayload {
            category: &message.category,
            published: message.published_at.to_rfc3339(),
            title: &message.title,
            link: &message.link,
            text: message.display_text(),
            summary: message.summary.as_deref(),
            detail: message.detail.as_deref(),
        };

        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RelayError::Delivery {
                destination: "slack".to_string(),
                reason: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| RelayError::Delivery {
                destination: "slack".to_string(),
                reason: e.to_string(),
            })?;

        debug!("delivered to slack: {}", message.title);
        Ok(())
    }
}
