use crate::config::{FeedSource, RetentionSettings};
use crate::fetcher::Fetcher;
use crate::parser::FeedParser;
use crate::store::HistoryStore;
use crate::types::HistoryRecord;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-source result of one crawl cycle.
#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub source: String,
    /// Entries present in the fetched feed document.
    pub found: usize,
    /// Entries newly recorded (and therefore queued for notification).
    pub new: usize,
    /// Entries outside the recency window.
    pub skipped_old: usize,
    /// Fetch/parse failure, if the source produced nothing this cycle.
    pub error: Option<String>,
}

impl CrawlOutcome {
    fn failed(source: &str, error: String) -> Self {
        Self {
            source: source.to_string(),
            found: 0,
            new: 0,
            skipped_old: 0,
            error: Some(error),
        }
    }
}

/// Polls configured sources and writes unseen entries into the history
/// store, which in turn feeds the change stream.
///
/// Sources are crawled concurrently and independently: one source failing
/// to fetch or parse never affects the others. Within a source, entries are
/// processed sequentially; a failed write is simply left for the next cycle
/// (the entry is still absent, so it will be retried).
pub struct Crawler {
    fetcher: Arc<Fetcher>,
    store: Arc<HistoryStore>,
    retention: RetentionSettings,
}

impl Crawler {
    pub fn new(fetcher: Arc<Fetcher>, store: Arc<HistoryStore>, retention: RetentionSettings) -> Self {
        Self {
            fetcher,
            store,
            retention,
        }
    }

    /// One poll cycle over all given sources.
    pub async fn crawl_all(&self, sources: &[FeedSource]) -> Vec<CrawlOutcome> {
        let cycle = Uuid::new_v4();
        info!("crawl cycle {} over {} sources", cycle, sources.len());

        let mut handles = Vec::with_capacity(sources.len());
        for source in sources {
            let fetcher = self.fetcher.clone();
            let store = self.store.clone();
            let retention = self.retention.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                crawl_source(&fetcher, &store, &retention, &source).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (handle, source) in handles.into_iter().zip(sources) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("crawl task for '{}' panicked: {}", source.name, e);
                    outcomes.push(CrawlOutcome::failed(&source.name, e.to_string()));
                }
            }
        }

        let new: usize = outcomes.iter().map(|o| o.new).sum();
        let failures = outcomes.iter().filter(|o| o.error.is_some()).count();
        info!(
            "crawl cycle {} finished: {} new entries, {} source failures",
            cycle, new, failures
        );

        outcomes
    }

    /// One poll cycle for a single source.
    pub async fn crawl_source(&self, source: &FeedSource) -> CrawlOutcome {
        crawl_source(&self.fetcher, &self.store, &self.retention, source).await
    }
}

async fn crawl_source(
    fetcher: &Fetcher,
    store: &HistoryStore,
    retention: &RetentionSettings,
    source: &FeedSource,
) -> CrawlOutcome {
    let content = match fetcher.fetch_feed(&source.url).await {
        Ok(content) => content,
        Err(e) => {
            warn!("skipping source '{}' this cycle: {}", source.name, e);
            return CrawlOutcome::failed(&source.name, e.to_string());
        }
    };

    let parsed = match FeedParser::parse(source, &content) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("skipping source '{}' this cycle: {}", source.name, e);
            return CrawlOutcome::failed(&source.name, e.to_string());
        }
    };

    let now = Utc::now();
    let cutoff = now - Duration::days(retention.recent_window_days);
    let ttl = Duration::days(retention.history_ttl_days);

    // A feed that advertises an update stamp older than the window has
    // nothing new for us; feeds without a stamp are processed normally.
    if let Some(updated) = parsed.updated {
        if updated < cutoff {
            debug!("source '{}' not updated since {}, skipping", source.name, updated);
            return CrawlOutcome {
                source: source.name.clone(),
                found: parsed.entries.len(),
                new: 0,
                skipped_old: parsed.entries.len(),
                error: None,
            };
        }
    }

    let found = parsed.entries.len();
    let mut new = 0;
    let mut skipped_old = 0;

    for entry in parsed.entries {
        if entry.published_at < cutoff {
            debug!("old entry, skip: {}", entry.title);
            skipped_old += 1;
            continue;
        }

        let key = entry.key();

        // Fast path; the conditional write below is what actually
        // guarantees at-most-one record under races.
        match store.exists(&key).await {
            Ok(true) => {
                debug!("already seen, skip: {}", key);
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("exists check failed for {}: {}; next cycle retries", key, e);
                continue;
            }
        }

        let record = HistoryRecord::new(entry, now, ttl);
        match store.put(&record).await {
            Ok(true) => new += 1,
            Ok(false) => debug!("lost insert race for {}", record.key()),
            Err(e) => {
                // Not retried this cycle; the key stays absent, so the next
                // scheduled poll will pick the entry up again.
                warn!("write failed for {}: {}", record.key(), e);
            }
        }
    }

    info!(
        "source '{}': {} entries, {} new, {} outside window",
        source.name, found, new, skipped_old
    );

    CrawlOutcome {
        source: source.name.clone(),
        found,
        new,
        skipped_old,
        error: None,
    }
}
