use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One normalized feed item, bound to the destination it will be delivered to.
///
/// The same physical article appearing in two sources with different
/// destination bindings produces two distinct entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// URL of the feed this entry came from.
    pub feed_url: String,
    /// Name of the destination binding the entry is routed to.
    pub notifier: String,
    /// Stable item identifier: the feed's GUID, falling back to the link.
    pub item_id: String,
    pub link: String,
    pub title: String,
    pub body: Option<String>,
    /// Category label for grouping (the configured source name).
    pub category: String,
    pub published_at: DateTime<Utc>,
    /// Source-provided extras (author, tags) carried through verbatim.
    pub metadata: HashMap<String, String>,
}

impl Entry {
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            feed_url: self.feed_url.clone(),
            notifier: self.notifier.clone(),
            item_id: self.item_id.clone(),
        }
    }
}

/// Identity of a history record: (origin feed, destination, item).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    pub feed_url: String,
    pub notifier: String,
    pub item_id: String,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.feed_url, self.notifier, self.item_id)
    }
}

/// Durable form of an [`Entry`]: presence means "delivered or in-flight
/// for this destination". Removed only by TTL expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub entry: Entry,
    pub first_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Attached after summarization succeeds; never triggers re-delivery.
    pub summary: Option<String>,
    pub detail: Option<String>,
}

impl HistoryRecord {
    pub fn new(entry: Entry, first_seen: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            entry,
            first_seen,
            expires_at: first_seen + ttl,
            summary: None,
            detail: None,
        }
    }

    pub fn key(&self) -> CompositeKey {
        self.entry.key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A record was created (or re-created over an expired row).
    Insert,
    /// Reserved: overwrites of live records are not published today.
    Update,
}

/// Transient change-stream notification emitted by the history store.
///
/// Delivery is at-least-once; consumers that need exactly-once effect must
/// deduplicate by composite key.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: HistoryRecord,
    pub old_image: Option<HistoryRecord>,
}

/// Summarizer gateway output for one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    /// Longer bullet-point expansion, when the backend provides one.
    pub detail: Option<String>,
    pub language: String,
    pub model_id: String,
}

/// Aggregated view over a trailing window of history, ready to render.
#[derive(Debug, Clone)]
pub struct DigestReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sections: Vec<DigestSection>,
    pub total_entries: usize,
}

/// One per category, entries sorted by publication time descending.
#[derive(Debug, Clone)]
pub struct DigestSection {
    pub category: String,
    pub records: Vec<HistoryRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("feed parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("summarization failed: {0}")]
    Summarization(String),

    #[error("delivery to {destination} failed: {reason}")]
    Delivery { destination: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
