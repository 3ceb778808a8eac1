use chrono::{Duration, Utc};
use feed_relay::store::HistoryStore;
use feed_relay::types::{ChangeKind, Entry, HistoryRecord};
use std::collections::HashMap;
use tokio::sync::broadcast::error::TryRecvError;

fn entry(item_id: &str) -> Entry {
    Entry {
        feed_url: "https://example.com/feed.xml".to_string(),
        notifier: "updates".to_string(),
        item_id: item_id.to_string(),
        link: format!("https://example.com/{}", item_id),
        title: format!("Post {}", item_id),
        body: Some("body text".to_string()),
        category: "AWS blog".to_string(),
        published_at: Utc::now(),
        metadata: HashMap::new(),
    }
}

fn record(item_id: &str) -> HistoryRecord {
    HistoryRecord::new(entry(item_id), Utc::now(), Duration::days(30))
}

#[tokio::test]
async fn put_is_idempotent_and_emits_one_event() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let mut rx = store.subscribe();

    let rec = record("p1");
    assert!(store.put(&rec).await.unwrap(), "first put should take effect");
    assert!(!store.put(&rec).await.unwrap(), "second put must be a no-op");

    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.record.key(), rec.key());
    assert!(
        matches!(rx.try_recv(), Err(TryRecvError::Empty)),
        "no-op put must not emit a second event"
    );
}

#[tokio::test]
async fn exists_reflects_live_records_only() {
    let store = HistoryStore::open_in_memory().await.unwrap();

    let rec = record("p1");
    assert!(!store.exists(&rec.key()).await.unwrap());
    store.put(&rec).await.unwrap();
    assert!(store.exists(&rec.key()).await.unwrap());
}

#[tokio::test]
async fn expiry_reenables_delivery() {
    let store = HistoryStore::open_in_memory().await.unwrap();

    // Seed a record whose TTL has already elapsed.
    let expired = HistoryRecord::new(
        entry("p1"),
        Utc::now() - Duration::days(40),
        Duration::days(30),
    );
    store.put(&expired).await.unwrap();
    assert!(
        !store.exists(&expired.key()).await.unwrap(),
        "expired record must be logically absent"
    );
    assert!(store.get(&expired.key()).await.unwrap().is_none());

    // The same item reappearing is a fresh insertion with a fresh event.
    let mut rx = store.subscribe();
    let fresh = record("p1");
    assert!(store.put(&fresh).await.unwrap());
    assert!(store.exists(&fresh.key()).await.unwrap());
    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, ChangeKind::Insert);
}

#[tokio::test]
async fn concurrent_puts_on_same_key_take_effect_once() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let mut rx = store.subscribe();

    let rec = record("race");
    let (a, b) = tokio::join!(store.put(&rec), store.put(&rec));
    let effective = [a.unwrap(), b.unwrap()].iter().filter(|v| **v).count();
    assert_eq!(effective, 1, "exactly one writer must win");

    assert!(rx.try_recv().is_ok());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn distinct_keys_are_independent_of_order() {
    let store = HistoryStore::open_in_memory().await.unwrap();

    let (p1, p2) = (record("p1"), record("p2"));
    let (a, b) = tokio::join!(store.put(&p1), store.put(&p2));
    assert!(a.unwrap());
    assert!(b.unwrap());

    let records = store
        .scan_window(Utc::now() - Duration::days(1))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn scan_window_filters_and_sorts_descending() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let now = Utc::now();

    let mut recent_new = entry("newest");
    recent_new.published_at = now - Duration::hours(1);
    let mut recent_old = entry("older");
    recent_old.published_at = now - Duration::hours(5);

    // First seen outside the 7-day window: excluded regardless of pub date.
    let mut outside = HistoryRecord::new(entry("ancient"), now - Duration::days(10), Duration::days(30));
    outside.entry.published_at = now - Duration::hours(2);

    store
        .put(&HistoryRecord::new(recent_old, now, Duration::days(30)))
        .await
        .unwrap();
    store
        .put(&HistoryRecord::new(recent_new, now, Duration::days(30)))
        .await
        .unwrap();
    store.put(&outside).await.unwrap();

    let records = store.scan_window(now - Duration::days(7)).await.unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.entry.item_id.as_str()).collect();
    assert_eq!(ids, vec!["newest", "older"]);
}

#[tokio::test]
async fn attach_summary_is_silent_on_the_change_stream() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let rec = record("p1");
    store.put(&rec).await.unwrap();

    let mut rx = store.subscribe();
    store
        .attach_summary(&rec.key(), "a summary", Some("the detail"))
        .await
        .unwrap();

    let stored = store.get(&rec.key()).await.unwrap().unwrap();
    assert_eq!(stored.summary.as_deref(), Some("a summary"));
    assert_eq!(stored.detail.as_deref(), Some("the detail"));
    assert!(
        matches!(rx.try_recv(), Err(TryRecvError::Empty)),
        "updates must never re-trigger notification"
    );
}

#[tokio::test]
async fn purge_removes_only_expired_rows() {
    let store = HistoryStore::open_in_memory().await.unwrap();

    let expired = HistoryRecord::new(
        entry("gone"),
        Utc::now() - Duration::days(40),
        Duration::days(30),
    );
    store.put(&expired).await.unwrap();
    store.put(&record("kept")).await.unwrap();

    let purged = store.purge_expired().await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.exists(&record("kept").key()).await.unwrap());
}
