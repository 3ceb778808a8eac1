use crate::types::{ChangeEvent, ChangeKind, CompositeKey, Entry, HistoryRecord, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Buffered change events a slow subscriber may fall behind by before it
/// observes a lag signal.
const CHANGE_BUFFER: usize = 1024;

/// Durable dedup history with a change stream.
///
/// One row per composite key. `put` is a single conditional write, so two
/// writers racing on the same key cannot both take effect, and exactly one
/// [`ChangeEvent`] is published per effective insertion. Expired rows are
/// logically absent everywhere even before `purge_expired` removes them.
pub struct HistoryStore {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl HistoryStore {
    /// Open (creating if missing) the history database at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        Self::connect(&format!("sqlite://{}?mode=rwc", path)).await
    }

    /// Fresh in-memory store, used by tests and one-shot dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(url: &str) -> Result<Self> {
        // A single connection keeps the writer serialized (the store is the
        // per-key arbitration point) and keeps in-memory databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                feed_url     TEXT NOT NULL,
                notifier     TEXT NOT NULL,
                item_id      TEXT NOT NULL,
                link         TEXT NOT NULL,
                title        TEXT NOT NULL,
                body         TEXT,
                category     TEXT NOT NULL,
                published_at INTEGER NOT NULL,
                metadata     TEXT NOT NULL DEFAULT '{}',
                first_seen   INTEGER NOT NULL,
                expires_at   INTEGER NOT NULL,
                summary      TEXT,
                detail       TEXT,
                PRIMARY KEY (feed_url, notifier, item_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_first_seen ON history (first_seen)")
            .execute(&pool)
            .await?;

        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        Ok(Self { pool, changes })
    }

    /// Change stream, ordered by commit, at-least-once. A receiver that
    /// falls more than the buffer behind sees `RecvError::Lagged` and must
    /// tolerate redelivery of whatever it re-reads.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// True if a live (non-expired) record exists for the key.
    pub async fn exists(&self, key: &CompositeKey) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM history
             WHERE feed_url = ? AND notifier = ? AND item_id = ? AND expires_at > ?",
        )
        .bind(&key.feed_url)
        .bind(&key.notifier)
        .bind(&key.item_id)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Idempotent conditional insert. Returns `true` and publishes one
    /// insertion event only when the write took effect: the key was absent,
    /// or present but expired. A live row makes this a no-op.
    pub async fn put(&self, record: &HistoryRecord) -> Result<bool> {
        let metadata = serde_json::to_string(&record.entry.metadata)?;

        let result = sqlx::query(
            r#"
            INSERT INTO history
                (feed_url, notifier, item_id, link, title, body, category,
                 published_at, metadata, first_seen, expires_at, summary, detail)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
            ON CONFLICT (feed_url, notifier, item_id) DO UPDATE SET
                link = excluded.link,
                title = excluded.title,
                body = excluded.body,
                category = excluded.category,
                published_at = excluded.published_at,
                metadata = excluded.metadata,
                first_seen = excluded.first_seen,
                expires_at = excluded.expires_at,
                summary = NULL,
                detail = NULL
            WHERE history.expires_at <= excluded.first_seen
            "#,
        )
        .bind(&record.entry.feed_url)
        .bind(&record.entry.notifier)
        .bind(&record.entry.item_id)
        .bind(&record.entry.link)
        .bind(&record.entry.title)
        .bind(&record.entry.body)
        .bind(&record.entry.category)
        .bind(record.entry.published_at.timestamp())
        .bind(&metadata)
        .bind(record.first_seen.timestamp())
        .bind(record.expires_at.timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("put no-op, key already live: {}", record.key());
            return Ok(false);
        }

        info!("recorded {}", record.key());

        // Publishing after the commit keeps the stream in commit order;
        // send fails only when nobody is subscribed, which is fine.
        let _ = self.changes.send(ChangeEvent {
            kind: ChangeKind::Insert,
            record: record.clone(),
            old_image: None,
        });

        Ok(true)
    }

    /// Attach summarizer output to an existing record. Deliberately silent
    /// on the change stream: updates never re-trigger notification.
    pub async fn attach_summary(
        &self,
        key: &CompositeKey,
        summary: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE history SET summary = ?, detail = ?
             WHERE feed_url = ? AND notifier = ? AND item_id = ?",
        )
        .bind(summary)
        .bind(detail)
        .bind(&key.feed_url)
        .bind(&key.notifier)
        .bind(&key.item_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, key: &CompositeKey) -> Result<Option<HistoryRecord>> {
        let row = sqlx::query(
            "SELECT * FROM history
             WHERE feed_url = ? AND notifier = ? AND item_id = ? AND expires_at > ?",
        )
        .bind(&key.feed_url)
        .bind(&key.notifier)
        .bind(&key.item_id)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    /// Live records first seen at or after `since`, publication time
    /// descending. Digest input.
    pub async fn scan_window(&self, since: DateTime<Utc>) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM history
             WHERE first_seen >= ? AND expires_at > ?
             ORDER BY published_at DESC, item_id ASC",
        )
        .bind(since.timestamp())
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    /// Physically delete rows past their TTL. Expiry is already enforced
    /// logically by every read; this just reclaims space.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM history WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!("purged {} expired history records", purged);
        }
        Ok(purged)
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<HistoryRecord> {
    let metadata_json: String = row.try_get("metadata")?;
    let metadata: HashMap<String, String> =
        serde_json::from_str(&metadata_json).unwrap_or_default();

    let entry = Entry {
        feed_url: row.try_get("feed_url")?,
        notifier: row.try_get("notifier")?,
        item_id: row.try_get("item_id")?,
        link: row.try_get("link")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        category: row.try_get("category")?,
        published_at: datetime_from_secs(row.try_get("published_at")?),
        metadata,
    };

    Ok(HistoryRecord {
        entry,
        first_seen: datetime_from_secs(row.try_get("first_seen")?),
        expires_at: datetime_from_secs(row.try_get("expires_at")?),
        summary: row.try_get("summary")?,
        detail: row.try_get("detail")?,
    })
}

fn datetime_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}
