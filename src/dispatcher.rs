use crate::config::{DispatcherSettings, SummarizerProfile, SummaryFallback};
use crate::fetcher::Fetcher;
use crate::notify::{DestinationBinding, NotificationMessage, NotifierRegistry};
use crate::store::HistoryStore;
use crate::summarizer::{Summarize, SummaryRequest};
use crate::types::{
    ChangeEvent, ChangeKind, CompositeKey, HistoryRecord, RelayError, Result, SummaryResult,
};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

/// Recently-processed composite keys, bounded by insertion-order eviction.
/// Sized to the expected redelivery window of the change stream.
struct SeenKeys {
    capacity: usize,
    set: HashSet<CompositeKey>,
    order: VecDeque<CompositeKey>,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// True if the key was not seen before (and is now recorded).
    fn insert(&mut self, key: CompositeKey) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.set.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.set.insert(key);
        true
    }
}

#[derive(Default)]
struct StatsInner {
    delivered: AtomicUsize,
    duplicates_dropped: AtomicUsize,
    summary_fallbacks: AtomicUsize,
    skipped: AtomicUsize,
    permanent_failures: AtomicUsize,
}

/// Aggregate outcome of a dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub delivered: usize,
    pub duplicates_dropped: usize,
    pub summary_fallbacks: usize,
    pub skipped: usize,
    pub permanent_failures: usize,
}

struct DispatchContext {
    store: Arc<HistoryStore>,
    fetcher: Arc<Fetcher>,
    summarizer: Arc<dyn Summarize>,
    registry: Arc<NotifierRegistry>,
    profiles: Arc<HashMap<String, SummarizerProfile>>,
    model_id: String,
    settings: DispatcherSettings,
    stats: Arc<StatsInner>,
}

/// Consumes the store's change stream and drives summarize-then-deliver for
/// each insertion, exactly once per composite key.
///
/// The stream is at-least-once; redelivered events for a key already in the
/// seen set are dropped. Work runs on a semaphore-bounded pool. A failed
/// delivery is retried with exponential backoff a bounded number of times,
/// then reported as a permanent failure; the history record is left in
/// place either way, so there is no automatic re-delivery.
pub struct Dispatcher {
    context: DispatchContext,
    seen: Mutex<SeenKeys>,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<HistoryStore>,
        fetcher: Arc<Fetcher>,
        summarizer: Arc<dyn Summarize>,
        registry: NotifierRegistry,
        profiles: Vec<SummarizerProfile>,
        model_id: String,
        settings: DispatcherSettings,
    ) -> Self {
        let profiles: HashMap<String, SummarizerProfile> = profiles
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let seen = Mutex::new(SeenKeys::new(settings.seen_cache_size));
        let semaphore = Arc::new(Semaphore::new(settings.workers));

        Self {
            context: DispatchContext {
                store,
                fetcher,
                summarizer,
                registry: Arc::new(registry),
                profiles: Arc::new(profiles),
                model_id,
                settings,
                stats: Arc::new(StatsInner::default()),
            },
            seen,
            semaphore,
        }
    }

    /// Consume events until the stream closes.
    pub async fn run(&self, rx: broadcast::Receiver<ChangeEvent>) -> DispatchStats {
        self.consume(rx, None).await
    }

    /// Consume events until the stream closes or stays quiet for
    /// `idle_for`. Waits for in-flight work before returning.
    pub async fn drain(
        &self,
        rx: broadcast::Receiver<ChangeEvent>,
        idle_for: Duration,
    ) -> DispatchStats {
        self.consume(rx, Some(idle_for)).await
    }

    async fn consume(
        &self,
        mut rx: broadcast::Receiver<ChangeEvent>,
        idle_for: Option<Duration>,
    ) -> DispatchStats {
        loop {
            let received = match idle_for {
                Some(idle) => match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(r) => r,
                    Err(_) => {
                        debug!("change stream idle, stopping dispatch");
                        break;
                    }
                },
                None => rx.recv().await,
            };

            match received {
                Ok(event) => self.handle(event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Redelivery territory: whatever we re-read next may
                    // repeat keys, which the seen set absorbs.
                    warn!("change stream lagged, {} events skipped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        self.wait_for_inflight().await;
        self.stats()
    }

    async fn handle(&self, event: ChangeEvent) {
        if event.kind != ChangeKind::Insert {
            debug!("ignoring non-insert change for {}", event.record.key());
            return;
        }

        let key = event.record.key();
        {
            let mut seen = self.seen.lock().expect("seen set lock poisoned");
            if !seen.insert(key.clone()) {
                debug!("dropping redelivered change for {}", key);
                self.context
                    .stats
                    .duplicates_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed, shutting down
        };

        let context = self.context_clone();
        tokio::spawn(async move {
            process_record(&context, event.record).await;
            drop(permit);
        });
    }

    async fn wait_for_inflight(&self) {
        let workers = self.context.settings.workers as u32;
        if let Ok(permits) = self.semaphore.acquire_many(workers).await {
            drop(permits);
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let stats = &self.context.stats;
        DispatchStats {
            delivered: stats.delivered.load(Ordering::Relaxed),
            duplicates_dropped: stats.duplicates_dropped.load(Ordering::Relaxed),
            summary_fallbacks: stats.summary_fallbacks.load(Ordering::Relaxed),
            skipped: stats.skipped.load(Ordering::Relaxed),
            permanent_failures: stats.permanent_failures.load(Ordering::Relaxed),
        }
    }

    fn context_clone(&self) -> DispatchContext {
        DispatchContext {
            store: self.context.store.clone(),
            fetcher: self.context.fetcher.clone(),
            summarizer: self.context.summarizer.clone(),
            registry: self.context.registry.clone(),
            profiles: self.context.profiles.clone(),
            model_id: self.context.model_id.clone(),
            settings: self.context.settings.clone(),
            stats: self.context.stats.clone(),
        }
    }
}

async fn process_record(context: &DispatchContext, record: HistoryRecord) {
    let key = record.key();
    let entry = record.entry;

    let Some(binding) = context.registry.get(&entry.notifier) else {
        error!("no destination binding '{}' for {}", entry.notifier, key);
        context.stats.permanent_failures.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut message = NotificationMessage {
        category: entry.category.clone(),
        title: entry.title.clone(),
        link: entry.link.clone(),
        published_at: entry.published_at,
        body: entry.body.clone(),
        summary: None,
        detail: None,
    };

    if let Some(profile_name) = &binding.summarizer {
        match summarize_entry(context, profile_name, &entry.link, entry.body.as_deref(), &entry.title).await {
            Ok(result) => {
                if let Err(e) = context
                    .store
                    .attach_summary(&key, &result.summary, result.detail.as_deref())
                    .await
                {
                    warn!("failed to attach summary for {}: {}", key, e);
                }
                message = message.with_summary(&result);
            }
            Err(e) => {
                warn!("summarization failed for {}: {}", key, e);
                match binding.on_summary_error {
                    SummaryFallback::FallbackToRaw => {
                        context.stats.summary_fallbacks.fetch_add(1, Ordering::Relaxed);
                    }
                    SummaryFallback::Skip => {
                        info!("skipping delivery of {} (summary required)", key);
                        context.stats.skipped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }

    deliver_with_retry(context, binding, &message, &key).await;
}

async fn summarize_entry(
    context: &DispatchContext,
    profile_name: &str,
    link: &str,
    body: Option<&str>,
    title: &str,
) -> Result<SummaryResult> {
    let profile = context.profiles.get(profile_name).ok_or_else(|| {
        RelayError::Summarization(format!("unknown profile '{}'", profile_name))
    })?;

    // Prefer the article's own main content; fall back to what the feed gave us.
    let mut text: Option<String> = None;
    if context.settings.fetch_full_content {
        match context.fetcher.fetch_article(link).await {
            Ok(Some(content)) => text = Some(content),
            Ok(None) => {}
            Err(e) => warn!("article fetch failed for {}: {}", link, e),
        }
    }
    let text = text
        .or_else(|| body.map(str::to_string))
        .unwrap_or_else(|| title.to_string());

    let request = SummaryRequest::new(text, profile, &context.model_id);
    context.summarizer.summarize(&request).await
}

async fn deliver_with_retry(
    context: &DispatchContext,
    binding: &DestinationBinding,
    message: &NotificationMessage,
    key: &CompositeKey,
) {
    let settings = &context.settings;
    let delivery_timeout = Duration::from_secs(settings.delivery_timeout_seconds);
    let base_delay = Duration::from_millis(settings.retry_delay_ms);

    let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
        current_interval: base_delay,
        initial_interval: base_delay,
        max_interval: base_delay * 32,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    };

    for attempt in 0..=settings.delivery_retries {
        let outcome = tokio::time::timeout(delivery_timeout, binding.channel.deliver(message)).await;

        let error = match outcome {
            Ok(Ok(())) => {
                info!("delivered {} to '{}'", key, binding.name);
                context.stats.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", delivery_timeout),
        };

        if attempt < settings.delivery_retries {
            if let Some(delay) = backoff.next_backoff() {
                warn!(
                    "delivery attempt {} to '{}' failed for {}: {}; retrying in {:?}",
                    attempt + 1,
                    binding.name,
                    key,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        }

        // Out of attempts. The history record stands, so this entry will
        // not be re-delivered; surface loudly for operators.
        error!(
            "permanent delivery failure for {} to '{}' after {} attempts: {}",
            key,
            binding.name,
            attempt + 1,
            error
        );
        context.stats.permanent_failures.fetch_add(1, Ordering::Relaxed);
        return;
    }
}
