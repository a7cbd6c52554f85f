use nimbus_backend::{KeyValueTable, MemoryBackend, MemoryFault, RetryPolicy};
use nimbus_freshness::{FreshnessTable, SERVICE_QUEUE, SERVICE_TABLE};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
    }
}

#[test]
fn missing_table_reads_absent_and_is_created_on_touch() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = FreshnessTable::new(backend.clone());

    assert_eq!(freshness.get_mtime(SERVICE_TABLE, "orders").unwrap(), None);
    assert!(backend.scan("nimbus-metadata").unwrap_err().is_not_found());

    let mtime = freshness.touch(SERVICE_TABLE, "orders").unwrap();
    assert_eq!(backend.scan("nimbus-metadata").unwrap().len(), 1);
    assert_eq!(freshness.get_mtime(SERVICE_TABLE, "orders").unwrap(), Some(mtime));
}

#[test]
fn record_round_trips_with_human_timestamp() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = FreshnessTable::new(backend).with_table_name("meta");

    let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    freshness.touch_at(SERVICE_QUEUE, "psabc", at).unwrap();

    let record = freshness.get_record(SERVICE_QUEUE, "psabc").unwrap().unwrap();
    assert_eq!(record.mtime, 1_700_000_000.0);
    assert_eq!(record.mtime_human.as_deref(), Some("2023-11-14T22:13:20Z"));
    assert_eq!(freshness.get_mtime(SERVICE_TABLE, "psabc").unwrap(), None);
}

#[test]
fn later_touch_overwrites_earlier_one() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = FreshnessTable::new(backend);

    freshness
        .touch_at(SERVICE_TABLE, "t", UNIX_EPOCH + Duration::from_secs(10))
        .unwrap();
    freshness
        .touch_at(SERVICE_TABLE, "t", UNIX_EPOCH + Duration::from_secs(20))
        .unwrap();
    assert_eq!(freshness.get_mtime(SERVICE_TABLE, "t").unwrap(), Some(20.0));
}

#[test]
fn deleting_the_table_resets_every_record() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = FreshnessTable::new(backend.clone());

    freshness.touch(SERVICE_TABLE, "a").unwrap();
    backend.delete_table("nimbus-metadata").unwrap();

    assert_eq!(freshness.get_mtime(SERVICE_TABLE, "a").unwrap(), None);
    freshness.touch(SERVICE_TABLE, "b").unwrap();
    assert_eq!(freshness.get_mtime(SERVICE_TABLE, "a").unwrap(), None);
    assert!(freshness.get_mtime(SERVICE_TABLE, "b").unwrap().is_some());
}

#[test]
fn transient_write_failures_are_retried() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = FreshnessTable::new(backend.clone()).with_retry_policy(fast_retry());
    freshness.touch(SERVICE_TABLE, "warm").unwrap();

    backend.inject_transient_failures(MemoryFault::PutItem, 2);
    freshness.touch(SERVICE_TABLE, "t").unwrap();

    backend.inject_transient_failures(MemoryFault::PutItem, 3);
    let err = freshness.touch(SERVICE_TABLE, "t").unwrap_err();
    assert!(err.is_transient());
}
