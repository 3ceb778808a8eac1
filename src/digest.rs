use crate::docstore::DocumentStore;
use crate::notify::{NotificationMessage, Notify};
use crate::store::HistoryStore;
use crate::types::{DigestReport, DigestSection, Result};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds the periodic digest: a trailing window of history, grouped by
/// category, rendered to Markdown and published to the document store.
///
/// Always produces a valid report: records missing optional fields render
/// as empty, and an empty window yields an empty-but-valid document.
pub struct DigestGenerator {
    store: Arc<HistoryStore>,
    docstore: Arc<dyn DocumentStore>,
    /// Channel to announce the published digest on, if configured.
    announce: Option<Arc<dyn Notify>>,
}

impl DigestGenerator {
    pub fn new(
        store: Arc<HistoryStore>,
        docstore: Arc<dyn DocumentStore>,
        announce: Option<Arc<dyn Notify>>,
    ) -> Self {
        Self {
            store,
            docstore,
            announce,
        }
    }

    /// Aggregate the trailing `window_days` of history into a report.
    pub async fn generate(&self, window_days: i64) -> Result<DigestReport> {
        let window_end = Utc::now();
        let window_start = window_end - Duration::days(window_days);

        let records = self.store.scan_window(window_start).await?;
        let total_entries = records.len();

        // BTreeMap keeps sections in category order; the store already
        // returns records newest-first.
        let mut by_category: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for record in records {
            by_category
                .entry(record.entry.category.clone())
                .or_default()
                .push(record);
        }

        let sections = by_category
            .into_iter()
            .map(|(category, records)| DigestSection { category, records })
            .collect();

        info!(
            "digest over {} days: {} entries",
            window_days, total_entries
        );

        Ok(DigestReport {
            window_start,
            window_end,
            sections,
            total_entries,
        })
    }

    /// Render, store, and optionally announce a report. Returns the
    /// document locator.
    pub async fn publish(&self, report: &DigestReport) -> Result<String> {
        let rendered = render_markdown(report);
        let key = format!(
            "updates-digest-{}.md",
            report.window_end.format("%Y-%m-%d")
        );
        let location = self.docstore.put_document(&key, &rendered).await?;

        if let Some(channel) = &self.announce {
            let message = NotificationMessage {
                category: "digest".to_string(),
                title: format!("Update digest: {} entries", report.total_entries),
                link: location.clone(),
                published_at: report.window_end,
                body: Some(section_overview(report)),
                summary: None,
                detail: None,
            };
            // The digest itself is already stored; a failed announcement is
            // not worth failing the run over.
            if let Err(e) = channel.deliver(&message).await {
                warn!("digest announcement failed: {}", e);
            }
        }

        Ok(location)
    }

    /// Generate and publish in one step (the scheduled entry point).
    pub async fn run(&self, window_days: i64) -> Result<(DigestReport, String)> {
        let report = self.generate(window_days).await?;
        let location = self.publish(&report).await?;
        Ok((report, location))
    }
}

/// Markdown rendering: date-range header, one section per category,
/// entries newest-first with title, link, date, and summary when attached.
pub fn render_markdown(report: &DigestReport) -> String {
    let start = report.window_start.format("%Y-%m-%d");
    let end = report.window_end.format("%Y-%m-%d");

    let mut out = String::new();
    out.push_str(&format!("# Update digest {} to {}\n\n", start, end));
    out.push_str(&format!(
        "{} update(s) collected in this window.\n\n",
        report.total_entries
    ));

    for section in &report.sections {
        out.push_str(&format!("## {}\n\n", section.category));

        for record in &section.records {
            let entry = &record.entry;
            out.push_str(&format!("### [{}]({})\n", entry.title, entry.link));
            out.push_str(&format!(
                "**Published:** {}\n\n",
                entry.published_at.format("%Y-%m-%d")
            ));
            if let Some(summary) = &record.summary {
                out.push_str(summary);
                out.push_str("\n\n");
            }
        }
    }

    out
}

fn section_overview(report: &DigestReport) -> String {
    report
        .sections
        .iter()
        .map(|s| format!("{}: {}", s.category, s.records.len()))
        .collect::<Vec<_>>()
        .join(", ")
}
