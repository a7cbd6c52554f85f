use crossbeam_channel as channel;
use nimbus_backend::{MemoryBackend, MemoryFault, QueueService, RetryPolicy};
use nimbus_freshness::{FreshnessTable, SERVICE_QUEUE};
use nimbus_pubsub::{
    channel_name, queue_name, IdleResourceReaper, PubSubConfig, PubSubCoordinator, PubSubError,
    ReaperConfig, SubscriptionConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

fn test_config(channel: &str, node: &str) -> PubSubConfig {
    let mut config = PubSubConfig::new(channel).with_node(node);
    config.subscription = SubscriptionConfig::default()
        .with_wait_time(Duration::from_millis(100))
        .unwrap();
    config.activity_wait = Duration::from_millis(50);
    config.join_timeout = Duration::from_secs(5);
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    };
    config
}

fn start(
    backend: &Arc<MemoryBackend>,
    config: PubSubConfig,
    callback: Option<nimbus_pubsub::MessageCallback>,
) -> PubSubCoordinator {
    let freshness = Arc::new(FreshnessTable::new(backend.clone()));
    PubSubCoordinator::start(backend.clone(), backend.clone(), freshness, config, callback)
        .unwrap()
}

fn poll_until(coordinator: &PubSubCoordinator, want: usize) -> Vec<Value> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = Vec::new();
    while received.len() < want && Instant::now() < deadline {
        received.extend(coordinator.get_messages().unwrap());
        std::thread::sleep(Duration::from_millis(10));
    }
    received
}

#[test]
fn published_message_reaches_the_subscriber_unchanged() {
    let backend = Arc::new(MemoryBackend::new());
    let (tx, rx) = channel::unbounded();
    let mut subscriber = start(
        &backend,
        test_config("e2e", "subscriber"),
        Some(Box::new(move |value: Value| {
            let _ = tx.send(value);
        })),
    );
    let mut publisher = start(&backend, test_config("e2e", "publisher"), None);

    publisher.publish(&json!({"number": 1})).unwrap();

    let received = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(received, json!({"number": 1}));

    // The publisher's own queue is subscribed too.
    assert_eq!(poll_until(&publisher, 1), vec![json!({"number": 1})]);

    publisher.request_exit().unwrap();
    subscriber.request_exit().unwrap();
}

#[test]
fn messages_arrive_in_publish_order() {
    let backend = Arc::new(MemoryBackend::new());
    let mut node = start(&backend, test_config("ordered", "solo"), None);

    for i in 0..20 {
        node.publish(&json!(i)).unwrap();
    }
    let received = poll_until(&node, 20);
    assert_eq!(received, (0..20).map(|i| json!(i)).collect::<Vec<_>>());

    node.request_exit().unwrap();
}

#[test]
fn transient_publish_failures_are_retried() {
    let backend = Arc::new(MemoryBackend::new());
    let mut node = start(&backend, test_config("flaky", "solo"), None);

    backend.inject_transient_failures(MemoryFault::Publish, 2);
    node.publish(&json!("eventually")).unwrap();

    assert_eq!(poll_until(&node, 1), vec![json!("eventually")]);
    node.request_exit().unwrap();
}

#[test]
fn deferred_delete_removes_messages_after_dispatch() {
    let backend = Arc::new(MemoryBackend::new());
    let mut config = test_config("deferred", "solo");
    config.subscription = SubscriptionConfig::new(None, false)
        .unwrap()
        .with_wait_time(Duration::from_millis(100))
        .unwrap();
    let mut node = start(&backend, config, None);

    node.publish(&json!({"k": "v"})).unwrap();
    assert_eq!(poll_until(&node, 1), vec![json!({"k": "v"})]);
    node.request_exit().unwrap();

    let queue = queue_name("deferred", "solo");
    assert_eq!(backend.queue_depth(&queue), Some(0));
}

#[test]
fn deferred_delete_measures_processing_time() {
    let backend = Arc::new(MemoryBackend::new());
    let mut config = test_config("measured", "solo");
    config.subscription = SubscriptionConfig::new(None, false)
        .unwrap()
        .with_wait_time(Duration::from_millis(100))
        .unwrap();
    let (tx, rx) = channel::unbounded();
    let mut node = start(
        &backend,
        config,
        Some(Box::new(move |value: Value| {
            std::thread::sleep(Duration::from_millis(60));
            let _ = tx.send(value);
        })),
    );
    assert!(node.work_times().is_empty());

    node.publish(&json!("slow")).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), json!("slow"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while node.work_times().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(node.work_times().median().unwrap() >= Duration::from_millis(60));
    node.request_exit().unwrap();
}

#[test]
fn immediate_delete_does_not_measure_processing_time() {
    let backend = Arc::new(MemoryBackend::new());
    let mut node = start(&backend, test_config("unmeasured", "solo"), None);

    node.publish(&json!(1)).unwrap();
    assert_eq!(poll_until(&node, 1), vec![json!(1)]);
    node.request_exit().unwrap();
    assert!(node.work_times().is_empty());
}

#[test]
fn polling_is_refused_in_callback_mode() {
    let backend = Arc::new(MemoryBackend::new());
    let mut node = start(
        &backend,
        test_config("callback", "solo"),
        Some(Box::new(|_: Value| {})),
    );

    assert!(matches!(node.get_messages(), Err(PubSubError::CallbackMode)));
    node.request_exit().unwrap();
    node.request_exit().unwrap();
}

#[test]
fn publish_after_exit_reports_closed() {
    let backend = Arc::new(MemoryBackend::new());
    let mut node = start(&backend, test_config("closed", "solo"), None);
    node.request_exit().unwrap();

    assert!(matches!(node.publish(&json!(1)), Err(PubSubError::Closed)));
}

#[test]
fn startup_reaps_idle_queues_of_the_channel() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = FreshnessTable::new(backend.clone());
    let stale = queue_name("reaped", "gone-node");
    backend.create_queue(&stale).unwrap();
    freshness
        .touch_at(
            SERVICE_QUEUE,
            &stale,
            SystemTime::now() - Duration::from_secs(31 * 24 * 60 * 60),
        )
        .unwrap();
    let other_channel = queue_name("unrelated", "gone-node");
    backend.create_queue(&other_channel).unwrap();

    let mut node = start(&backend, test_config("reaped", "alive"), None);
    let deadline = Instant::now() + Duration::from_secs(10);
    while backend.queue_exists(&stale).unwrap() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    node.request_exit().unwrap();

    assert!(!backend.queue_exists(&stale).unwrap());
    assert!(backend.queue_exists(&queue_name("reaped", "alive")).unwrap());
    assert!(backend.queue_exists(&other_channel).unwrap());
}

#[test]
fn reaper_deletes_old_and_unrecorded_queues_and_keeps_fresh_ones() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = Arc::new(FreshnessTable::new(backend.clone()));
    let prefix = channel_name("idle");

    let old = queue_name("idle", "old");
    let fresh = queue_name("idle", "fresh");
    let unrecorded = queue_name("idle", "unrecorded");
    for queue in [&old, &fresh, &unrecorded] {
        backend.create_queue(queue).unwrap();
    }
    let month = Duration::from_secs(30 * 24 * 60 * 60);
    freshness
        .touch_at(SERVICE_QUEUE, &old, SystemTime::now() - month - Duration::from_secs(60))
        .unwrap();
    freshness
        .touch_at(SERVICE_QUEUE, &fresh, SystemTime::now() - month + Duration::from_secs(60))
        .unwrap();

    let reaper = IdleResourceReaper::new(backend.clone(), freshness, ReaperConfig::default());
    let mut removed = reaper.reap(&prefix).unwrap();
    removed.sort();
    let mut expected = vec![old.clone(), unrecorded.clone()];
    expected.sort();
    assert_eq!(removed, expected);

    assert_eq!(backend.list_queues(&prefix).unwrap(), vec![fresh]);
    assert!(reaper.reap(&prefix).unwrap().is_empty());
}

#[test]
fn invalid_config_is_rejected_before_provisioning() {
    let backend = Arc::new(MemoryBackend::new());
    let freshness = Arc::new(FreshnessTable::new(backend.clone()));
    let config = PubSubConfig::new("").with_node("n");

    let err = PubSubCoordinator::start(backend.clone(), backend.clone(), freshness, config, None)
        .err()
        .unwrap();
    assert!(matches!(err, PubSubError::InvalidConfig { .. }));
    assert!(backend.list_queues("").unwrap().is_empty());
}
