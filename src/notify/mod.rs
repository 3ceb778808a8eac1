pub mod slack;
pub mod teams;

use crate::config::{ChannelKind, NotifierSpec, SummaryFallback};
use crate::types::{Result, SummaryResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub use slack::SlackNotifier;
pub use teams::TeamsNotifier;

/// Channel-agnostic content of one outbound notification.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub category: String,
    pub title: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
    /// Raw feed body, shown when no summary is available.
    pub body: Option<String>,
    pub summary: Option<String>,
    pub detail: Option<String>,
}

impl NotificationMessage {
    pub fn with_summary(mut self, result: &SummaryResult) -> Self {
        self.summary = Some(result.summary.clone());
        self.detail = result.detail.clone();
        self
    }

    /// Best text to show: summary if present, else raw body, else title.
    pub fn display_text(&self) -> &str {
        self.summary
            .as_deref()
            .or(self.body.as_deref())
            .unwrap_or(&self.title)
    }
}

/// One delivery attempt per call; errors are surfaced, never swallowed.
/// Retry policy belongs to the dispatcher.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn deliver(&self, message: &NotificationMessage) -> Result<()>;
}

/// A configured destination: the channel plus its summarization policy.
#[derive(Clone)]
pub struct DestinationBinding {
    pub name: String,
    pub summarizer: Option<String>,
    pub on_summary_error: SummaryFallback,
    pub channel: Arc<dyn Notify>,
}

/// Lookup table from destination name to binding, built from config.
#[derive(Default, Clone)]
pub struct NotifierRegistry {
    bindings: HashMap<String, DestinationBinding>,
}

impl NotifierRegistry {
    pub fn from_config(specs: &[NotifierSpec], timeout_seconds: u64) -> Result<Self> {
        let mut registry = Self::default();
        for spec in specs {
            let channel: Arc<dyn Notify> = match spec.channel {
                ChannelKind::Slack => {
                    Arc::new(SlackNotifier::new(spec.webhook_url.clone(), timeout_seconds)?)
                }
                ChannelKind::Teams => {
                    Arc::new(TeamsNotifier::new(spec.webhook_url.clone(), timeout_seconds)?)
                }
            };
            registry.insert(DestinationBinding {
                name: spec.name.clone(),
                summarizer: spec.summarizer.clone(),
                on_summary_error: spec.on_summary_error,
                channel,
            });
        }
        Ok(registry)
    }

    pub fn insert(&mut self, binding: DestinationBinding) {
        self.bindings.insert(binding.name.clone(), binding);
    }

    pub fn get(&self, name: &str) -> Option<&DestinationBinding> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
