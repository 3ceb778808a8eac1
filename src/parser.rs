use crate::config::FeedSource;
use crate::fetcher::strip_html;
use crate::types::{Entry, RelayError, Result};
use chrono::{DateTime, Utc};
use feed_rs::parser;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A parsed feed: metadata plus the source's entries, normalized and
/// de-duplicated within the document.
#[derive(Debug)]
pub struct ParsedFeed {
    pub title: Option<String>,
    /// Feed-level update stamp, used for the stale-feed check.
    pub updated: Option<DateTime<Utc>>,
    pub entries: Vec<Entry>,
}

pub struct FeedParser;

impl FeedParser {
    /// Parse raw feed XML into normalized entries bound to the source's
    /// destination. Entries without a usable link or timestamp are dropped.
    pub fn parse(source: &FeedSource, content: &str) -> Result<ParsedFeed> {
        let feed = parser::parse(content.as_bytes())
            .map_err(|e| RelayError::Parse(format!("{}: {}", source.url, e)))?;

        let title = feed.title.map(|t| t.content);
        let updated = feed.updated;

        let mut seen_ids = HashSet::new();
        let mut entries = Vec::new();

        for raw in feed.entries {
            let Some(entry) = normalize_entry(source, raw) else {
                continue;
            };
            if !seen_ids.insert(entry.item_id.clone()) {
                debug!("skipping in-feed duplicate: {}", entry.item_id);
                continue;
            }
            entries.push(entry);
        }

        debug!("parsed {} entries from {}", entries.len(), source.url);

        Ok(ParsedFeed {
            title,
            updated,
            entries,
        })
    }
}

fn normalize_entry(source: &FeedSource, entry: feed_rs::model::Entry) -> Option<Entry> {
    let link = entry.links.first().map(|l| l.href.clone())?;

    // GUID when the feed provides one, otherwise the link itself.
    let item_id = if entry.id.is_empty() {
        link.clone()
    } else {
        entry.id.clone()
    };

    let Some(published_at) = entry.published.or(entry.updated) else {
        debug!("skipping undated entry: {}", link);
        return None;
    };

    let title = entry
        .title
        .map(|t| t.content)
        .unwrap_or_else(|| "Untitled".to_string());

    // Prefer full content over the summary blurb; either way keep text only.
    let body = entry
        .content
        .and_then(|c| c.body)
        .or(entry.summary.map(|s| s.content))
        .map(|html| strip_html(&html))
        .filter(|text| !text.is_empty());

    let mut metadata = HashMap::new();
    if let Some(author) = entry.authors.first() {
        metadata.insert("author".to_string(), author.name.clone());
    }
    let tags: Vec<String> = entry.categories.into_iter().map(|c| c.term).collect();
    if !tags.is_empty() {
        metadata.insert("tags".to_string(), tags.join(","));
    }

    Some(Entry {
        feed_url: source.url.clone(),
        notifier: source.notifier.clone(),
        item_id,
        link,
        title,
        body,
        category: source.name.clone(),
        published_at,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn source() -> FeedSource {
        FeedSource {
            name: "AWS blog".to_string(),
            url: "https://example.com/feed.xml".to_string(),
            notifier: "updates".to_string(),
            schedule: None,
        }
    }

    fn rss_fixture(pub_date: DateTime<Utc>) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0"><channel>
              <title>AWS Blog</title>
              <lastBuildDate>{build}</lastBuildDate>
              <item>
                <title>Post one</title>
                <link>https://example.com/p1</link>
                <guid>guid-1</guid>
                <pubDate>{date}</pubDate>
                <description>&lt;p&gt;Body &lt;b&gt;one&lt;/b&gt;&lt;/p&gt;</description>
                <category>compute</category>
              </item>
              <item>
                <title>Post two</title>
                <link>https://example.com/p2</link>
                <guid>guid-2</guid>
                <pubDate>{date}</pubDate>
              </item>
              <item>
                <title>Duplicate of one</title>
                <link>https://example.com/p1-again</link>
                <guid>guid-1</guid>
                <pubDate>{date}</pubDate>
              </item>
            </channel></rss>"#,
            build = pub_date.to_rfc2822(),
            date = pub_date.to_rfc2822(),
        )
    }

    #[test]
    fn parses_rss_and_normalizes() {
        let now = Utc::now() - Duration::hours(1);
        let parsed = FeedParser::parse(&source(), &rss_fixture(now)).unwrap();

        assert_eq!(parsed.title.as_deref(), Some("AWS Blog"));
        assert!(parsed.updated.is_some());
        // The third item repeats guid-1 and is dropped.
        assert_eq!(parsed.entries.len(), 2);

        let first = &parsed.entries[0];
        assert_eq!(first.item_id, "guid-1");
        assert_eq!(first.link, "https://example.com/p1");
        assert_eq!(first.category, "AWS blog");
        assert_eq!(first.notifier, "updates");
        assert_eq!(first.body.as_deref(), Some("Body one"));
        assert_eq!(first.metadata.get("tags").map(String::as_str), Some("compute"));
    }

    #[test]
    fn parses_atom_with_link_fallback_id() {
        let updated = (Utc::now() - Duration::hours(2)).to_rfc3339();
        let atom = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
            <feed xmlns="http://www.w3.org/2005/Atom">
              <title>Atom source</title>
              <updated>{updated}</updated>
              <entry>
                <title>Atom post</title>
                <link href="https://example.com/atom/1"/>
                <updated>{updated}</updated>
                <summary>Short blurb</summary>
              </entry>
            </feed>"#,
        );
        let parsed = FeedParser::parse(&source(), &atom).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        let entry = &parsed.entries[0];
        assert!(!entry.item_id.is_empty());
        assert_eq!(entry.body.as_deref(), Some("Short blurb"));
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = FeedParser::parse(&source(), "this is not xml").unwrap_err();
        assert!(matches!(err, RelayError::Parse(_)));
    }

    #[test]
    fn entries_without_links_are_dropped() {
        let now = Utc::now().to_rfc2822();
        let rss = format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel>
              <title>t</title>
              <item><title>no link</title><guid>g</guid><pubDate>{now}</pubDate></item>
            </channel></rss>"#,
        );
        let parsed = FeedParser::parse(&source(), &rss).unwrap();
        assert!(parsed.entries.is_empty());
    }
}
