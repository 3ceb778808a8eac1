use crate::config::FetchSettings;
use crate::types::{RelayError, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP fetcher for feeds and linked article pages.
///
/// One attempt per call: a failed fetch is reported to the caller and the
/// source is simply retried on its next crawl cycle.
pub struct Fetcher {
    client: Client,
    max_body_bytes: u64,
}

impl Fetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&settings.user_agent)
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects))
            .build()
            .map_err(|e| RelayError::General(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_body_bytes: (settings.max_feed_size_mb as u64) * 1024 * 1024,
        })
    }

    /// Fetch the raw XML of a feed. Non-2xx, transport errors, and
    /// oversized responses all surface as a fetch error carrying the URL.
    pub async fn fetch_feed(&self, url: &str) -> Result<String> {
        debug!("fetching feed: {}", url);

        let response = self.client.get(url).send().await.map_err(|e| RelayError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        if let Some(length) = response.content_length() {
            if length > self.max_body_bytes {
                return Err(RelayError::Fetch {
                    url: url.to_string(),
                    reason: format!("feed too large: {} bytes", length),
                });
            }
        }

        let body = response.text().await.map_err(|e| RelayError::Fetch {
            url: url.to_string(),
            reason: format!("failed to read body: {}", e),
        })?;

        if body.len() as u64 > self.max_body_bytes {
            return Err(RelayError::Fetch {
                url: url.to_string(),
                reason: format!("feed too large: {} bytes", body.len()),
            });
        }

        debug!("fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }

    /// Fetch an entry's linked page and pull out its main content for
    /// summarization. Returns `None` when the page has no recognizable
    /// main/article element; callers fall back to the feed-provided body.
    pub async fn fetch_article(&self, url: &str) -> Result<Option<String>> {
        debug!("fetching article content: {}", url);

        let response = self.client.get(url).send().await.map_err(|e| RelayError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let html = response.text().await.map_err(|e| RelayError::Fetch {
            url: url.to_string(),
            reason: format!("failed to read body: {}", e),
        })?;

        let text = extract_main_text(&html);
        if text.is_none() {
            warn!("no main content found at {}", url);
        }
        Ok(text)
    }
}

/// Text of the `<main>` element, falling back to `<article>`.
fn extract_main_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for selector in ["main", "article"] {
        // Selector::parse only fails on invalid syntax, never on input HTML.
        let sel = Selector::parse(selector).ok()?;
        if let Some(element) = document.select(&sel).next() {
            let text = element
                .text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Strip markup from a feed-provided HTML fragment, keeping the text.
pub fn strip_html(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    parsed
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
