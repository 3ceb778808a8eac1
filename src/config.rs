use crate::types::{RelayError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use url::Url;

/// Full runtime configuration, loaded once at startup and immutable after.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    pub summarizer_backend: SummarizerBackend,
    #[serde(default)]
    pub summarizers: Vec<SummarizerProfile>,
    pub notifiers: Vec<NotifierSpec>,
    pub sources: Vec<FeedSource>,
    #[serde(default)]
    pub digest: DigestSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_feed_size_mb")]
    pub max_feed_size_mb: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_seconds: default_fetch_timeout(),
            max_feed_size_mb: default_max_feed_size_mb(),
            max_redirects: default_max_redirects(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSettings {
    /// How long a history record suppresses re-delivery.
    #[serde(default = "default_history_ttl_days")]
    pub history_ttl_days: i64,
    /// Publication-age cutoff for ingesting entries.
    #[serde(default = "default_recent_window_days")]
    pub recent_window_days: i64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            history_ttl_days: default_history_ttl_days(),
            recent_window_days: default_recent_window_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
    #[serde(default = "default_seen_cache_size")]
    pub seen_cache_size: usize,
    /// Fetch the linked article and summarize its main content instead of
    /// the feed-provided body.
    #[serde(default = "default_true")]
    pub fetch_full_content: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            delivery_retries: default_delivery_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            delivery_timeout_seconds: default_delivery_timeout(),
            seen_cache_size: default_seen_cache_size(),
            fetch_full_content: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerBackend {
    pub endpoint: String,
    pub model_id: String,
    #[serde(default = "default_summarizer_timeout")]
    pub timeout_seconds: u64,
}

/// A named persona/language pair a destination can summarize with.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerProfile {
    pub name: String,
    pub persona: String,
    pub output_language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Slack,
    Teams,
}

/// What the dispatcher does with an entry whose summarization failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryFallback {
    /// Deliver the raw title/body without a summary.
    #[default]
    FallbackToRaw,
    /// Suppress delivery for this entry.
    Skip,
}

/// A named destination: channel, webhook, and summarization policy.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierSpec {
    pub name: String,
    pub channel: ChannelKind,
    pub webhook_url: String,
    /// Name of a [`SummarizerProfile`]; entries go out unsummarized if unset.
    pub summarizer: Option<String>,
    #[serde(default)]
    pub on_summary_error: SummaryFallback,
}

/// One configured feed. The name doubles as the category label on every
/// entry the feed produces.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    pub notifier: String,
    /// Opaque hint handed to the external scheduler; not interpreted here.
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestSettings {
    #[serde(default = "default_digest_window_days")]
    pub window_days: i64,
    #[serde(default = "default_digest_output_dir")]
    pub output_dir: String,
    /// Destination binding to announce the digest on, if any.
    pub notifier: Option<String>,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            window_days: default_digest_window_days(),
            output_dir: default_digest_output_dir(),
            notifier: None,
        }
    }
}

impl AppConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            RelayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = toml::from_str(&raw)
            .map_err(|e| RelayError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject dangling references and malformed values before anything runs.
    pub fn validate(&self) -> Result<()> {
        if self.retention.history_ttl_days <= 0 {
            return Err(RelayError::Config(
                "retention.history_ttl_days must be positive".to_string(),
            ));
        }
        if self.retention.recent_window_days <= 0 {
            return Err(RelayError::Config(
                "retention.recent_window_days must be positive".to_string(),
            ));
        }
        if self.dispatcher.workers == 0 {
            return Err(RelayError::Config(
                "dispatcher.workers must be at least 1".to_string(),
            ));
        }

        check_url("summarizer_backend.endpoint", &self.summarizer_backend.endpoint)?;

        let mut profiles = HashSet::new();
        for profile in &self.summarizers {
            if profile.name.trim().is_empty() {
                return Err(RelayError::Config("summarizer with empty name".to_string()));
            }
            if !profiles.insert(profile.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate summarizer profile '{}'",
                    profile.name
                )));
            }
        }

        let mut notifiers = HashSet::new();
        for spec in &self.notifiers {
            if spec.name.trim().is_empty() {
                return Err(RelayError::Config("notifier with empty name".to_string()));
            }
            if !notifiers.insert(spec.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate notifier '{}'",
                    spec.name
                )));
            }
            check_url(&format!("notifier '{}' webhook_url", spec.name), &spec.webhook_url)?;
            if let Some(profile) = &spec.summarizer {
                if !profiles.contains(profile.as_str()) {
                    return Err(RelayError::Config(format!(
                        "notifier '{}' references unknown summarizer '{}'",
                        spec.name, profile
                    )));
                }
            }
        }

        let mut sources = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(RelayError::Config("source with empty name".to_string()));
            }
            if !sources.insert(source.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate source '{}'",
                    source.name
                )));
            }
            check_url(&format!("source '{}' url", source.name), &source.url)?;
            if !notifiers.contains(source.notifier.as_str()) {
                return Err(RelayError::Config(format!(
                    "source '{}' references unknown notifier '{}'",
                    source.name, source.notifier
                )));
            }
        }

        if let Some(name) = &self.digest.notifier {
            if !notifiers.contains(name.as_str()) {
                return Err(RelayError::Config(format!(
                    "digest references unknown notifier '{}'",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn summarizer_profile(&self, name: &str) -> Option<&SummarizerProfile> {
        self.summarizers.iter().find(|p| p.name == name)
    }

    pub fn source(&self, name: &str) -> Option<&FeedSource> {
        self.sources.iter().find(|s| s.name == name)
    }
}

fn check_url(label: &str, value: &str) -> Result<()> {
    let parsed = Url::parse(value)
        .map_err(|e| RelayError::Config(format!("{}: invalid URL '{}': {}", label, value, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RelayError::Config(format!(
            "{}: unsupported scheme '{}'",
            label,
            parsed.scheme()
        )));
    }
    Ok(())
}

fn default_database_path() -> String {
    "feed-relay.db".to_string()
}

fn default_user_agent() -> String {
    "feed-relay/0.1".to_string()
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_max_feed_size_mb() -> usize {
    10
}

fn default_max_redirects() -> usize {
    5
}

fn default_history_ttl_days() -> i64 {
    30
}

fn default_recent_window_days() -> i64 {
    7
}

fn default_workers() -> usize {
    4
}

fn default_delivery_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_seen_cache_size() -> usize {
    1024
}

fn default_summarizer_timeout() -> u64 {
    60
}

fn default_digest_window_days() -> i64 {
    7
}

fn default_digest_output_dir() -> String {
    "digests".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [summarizer_backend]
        endpoint = "https://llm.internal/summarize"
        model_id = "claude-3-haiku"

        [[summarizers]]
        name = "pro-ja"
        persona = "You are a professional engineer."
        output_language = "Japanese"

        [[notifiers]]
        name = "updates-teams"
        channel = "teams"
        webhook_url = "https://example.com/webhook/abc"
        summarizer = "pro-ja"
        on_summary_error = "fallback-to-raw"

        [[sources]]
        name = "AWS blog"
        url = "https://aws.amazon.com/blogs/aws/feed/"
        notifier = "updates-teams"
    "#;

    #[test]
    fn parses_and_validates_sample() {
        let config = AppConfig::from_toml(SAMPLE).expect("sample config should load");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.retention.history_ttl_days, 30);
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(
            config.notifiers[0].on_summary_error,
            SummaryFallback::FallbackToRaw
        );
        assert!(config.summarizer_profile("pro-ja").is_some());
    }

    #[test]
    fn rejects_unknown_notifier_reference() {
        let raw = SAMPLE.replace("notifier = \"updates-teams\"", "notifier = \"nope\"");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown notifier"));
    }

    #[test]
    fn rejects_unknown_summarizer_reference() {
        let raw = SAMPLE.replace("summarizer = \"pro-ja\"", "summarizer = \"missing\"");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown summarizer"));
    }

    #[test]
    fn rejects_malformed_webhook_url() {
        let raw = SAMPLE.replace("https://example.com/webhook/abc", "not a url");
        assert!(AppConfig::from_toml(&raw).is_err());
    }

    #[test]
    fn skip_policy_parses() {
        let raw = SAMPLE.replace("fallback-to-raw", "skip");
        let config = AppConfig::from_toml(&raw).unwrap();
        assert_eq!(config.notifiers[0].on_summary_error, SummaryFallback::Skip);
    }
}
