use chrono::{Duration, Utc};
use pmostore::{ContextStore, CONTEXT_TYPE_PAGEVIEW, CONTEXT_TYPE_TOUCH_INPUT};
use tempfile::TempDir;

fn create_store() -> (TempDir, ContextStore) {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = ContextStore::open(temp_dir.path().join("context.sqlite")).unwrap();
    (temp_dir, store)
}

#[test]
fn add_and_read_back() {
    let (_tmp, store) = create_store();
    let id = store
        .add_context(CONTEXT_TYPE_TOUCH_INPUT, Some("<content-item/>"))
        .unwrap();
    assert!(id > 0);

    let records = store.latest_by_type(CONTEXT_TYPE_TOUCH_INPUT, 1).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].context_type, CONTEXT_TYPE_TOUCH_INPUT);
    assert_eq!(records[0].content_item_xml.as_deref(), Some("<content-item/>"));
}

#[test]
fn latest_returns_most_recent_first() {
    let (_tmp, store) = create_store();
    store.add_context(CONTEXT_TYPE_PAGEVIEW, Some("<a/>")).unwrap();
    store.add_context(CONTEXT_TYPE_PAGEVIEW, Some("<b/>")).unwrap();

    let records = store.latest_by_type(CONTEXT_TYPE_PAGEVIEW, 2).unwrap();
    assert_eq!(records[0].content_item_xml.as_deref(), Some("<b/>"));
    assert_eq!(records[1].content_item_xml.as_deref(), Some("<a/>"));
}

#[test]
fn unsupported_type_is_rejected() {
    let (_tmp, store) = create_store();
    assert!(store.add_context("weather", None).is_err());
    assert!(store.latest_by_type("weather", 1).is_err());
}

#[test]
fn empty_payload_is_allowed() {
    let (_tmp, store) = create_store();
    store.add_context(CONTEXT_TYPE_TOUCH_INPUT, None).unwrap();
    let records = store.latest_by_type(CONTEXT_TYPE_TOUCH_INPUT, 1).unwrap();
    assert!(records[0].content_item_xml.is_none());
}

#[test]
fn counts_group_by_item_least_played_first() {
    let (_tmp, store) = create_store();
    for _ in 0..3 {
        store.add_context(CONTEXT_TYPE_PAGEVIEW, Some("<a/>")).unwrap();
    }
    store.add_context(CONTEXT_TYPE_PAGEVIEW, Some("<b/>")).unwrap();

    let since = Utc::now().naive_utc() - Duration::hours(2);
    let counts = store
        .counts_by_item_since(CONTEXT_TYPE_PAGEVIEW, since, 1000)
        .unwrap();
    assert_eq!(counts.len(), 2);
    assert_eq!(counts[0], ("<b/>".to_string(), 1));
    assert_eq!(counts[1], ("<a/>".to_string(), 3));
}

#[test]
fn counts_respect_the_time_window() {
    let (_tmp, store) = create_store();
    store.add_context(CONTEXT_TYPE_PAGEVIEW, Some("<a/>")).unwrap();

    let future = Utc::now().naive_utc() + Duration::hours(1);
    let counts = store
        .counts_by_item_since(CONTEXT_TYPE_PAGEVIEW, future, 1000)
        .unwrap();
    assert!(counts.is_empty());
}
