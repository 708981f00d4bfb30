//! Session lifecycle tests against the in-memory broker.

mod common;

use common::{avro_manager, fast_retry, json_manager, FakeBroker, FakeConnector, FakeRegistry, FakeStore};
use loadtest_telemetry::{
    BrokerRole, Codec, ConnectionError, ConnectionManager, ConnectionState, PersistenceStore,
    RecordKind, SchemaLookupError, SchemaRegistry, TopicConfig, MIN_STORE_PROBE_INTERVAL,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_connect_opens_every_role() {
    let broker = FakeBroker::new();
    let connection = json_manager(&broker);
    assert!(connection.states().all(ConnectionState::Disconnected));
    assert!(connection.producer().is_err());

    connection.connect().await.unwrap();

    assert!(connection.is_connected());
    for role in BrokerRole::ALL {
        assert_eq!(connection.state(role), ConnectionState::Connected);
    }
    assert!(connection.producer().is_ok());
    assert!(connection.admin().is_ok());

    // Already connected: no new sessions.
    connection.connect().await.unwrap();
    assert_eq!(broker.open_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_with_backoff() {
    let broker = FakeBroker::new();
    broker.failing_opens.store(2, Ordering::SeqCst);
    let connection = json_manager(&broker);

    let started = Instant::now();
    connection.connect().await.unwrap();

    assert_eq!(broker.open_attempts.load(Ordering::SeqCst), 3);
    // 1s after the first failure, 2s after the second.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4), "{waited:?}");
    assert!(connection.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_budget() {
    let broker = FakeBroker::new();
    broker.failing_opens.store(100, Ordering::SeqCst);
    let connection = ConnectionManager::new(
        Arc::new(FakeConnector(Arc::clone(&broker))),
        Arc::new(Codec::json(TopicConfig::default())),
        fast_retry(3),
    );

    let err = connection.connect().await.unwrap_err();
    match err {
        ConnectionError::BrokerUnavailable {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("connection refused"), "{last_error}");
        }
        other => panic!("expected BrokerUnavailable, got {other:?}"),
    }
    assert_eq!(broker.open_attempts.load(Ordering::SeqCst), 3);
    assert!(connection.states().all(ConnectionState::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_missing_subject_fails_without_retry() {
    let broker = FakeBroker::new();
    let mut subjects = HashMap::new();
    subjects.insert(
        "iot_messages-value".to_string(),
        (1, common::TELEMETRY_SCHEMA.to_string()),
    );
    let registry: Arc<dyn SchemaRegistry> = Arc::new(FakeRegistry {
        lookups: AtomicU32::new(0),
        subjects,
    });
    let connection = ConnectionManager::new(
        Arc::new(FakeConnector(Arc::clone(&broker))),
        Arc::new(Codec::with_registry(registry, TopicConfig::default())),
        fast_retry(5),
    );

    let err = connection.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::Schema(SchemaLookupError::NoVersion(ref subject)) if subject == "iot_alarms-value"
    ));
    assert_eq!(broker.open_attempts.load(Ordering::SeqCst), 1);
    assert!(connection.states().all(ConnectionState::Disconnected));
    assert!(connection.codec().resolved_kinds().is_empty());
    // Producer, admin and consumer opened before the lookup were all closed.
    assert_eq!(broker.closes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let broker = FakeBroker::new();
    let connection = json_manager(&broker);

    // Nothing open yet.
    connection.disconnect().await;
    assert_eq!(broker.closes.load(Ordering::SeqCst), 0);

    connection.connect().await.unwrap();
    connection.disconnect().await;
    assert_eq!(broker.closes.load(Ordering::SeqCst), 3);
    assert!(connection.states().all(ConnectionState::Disconnected));
    assert!(connection.producer().is_err());

    connection.disconnect().await;
    assert_eq!(broker.closes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_errors_are_swallowed() {
    let broker = FakeBroker::new();
    let connection = json_manager(&broker);
    connection.connect().await.unwrap();

    broker.fail_teardown.store(true, Ordering::SeqCst);
    connection.disconnect().await;

    assert_eq!(broker.closes.load(Ordering::SeqCst), 3);
    assert!(connection.states().all(ConnectionState::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_state_changes_are_observable() {
    let broker = FakeBroker::new();
    let connection = json_manager(&broker);
    let mut states = connection.subscribe_states();

    connection.connect().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(
        states.borrow_and_update().get(BrokerRole::Consumer),
        ConnectionState::Connected
    );

    connection.disconnect().await;
    assert!(states.has_changed().unwrap());
    assert!(states.borrow_and_update().all(ConnectionState::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_bindings_resolved_once_per_connection() {
    let broker = FakeBroker::new();
    let registry = FakeRegistry::with_default_subjects();
    let connection = avro_manager(&broker, &registry);

    connection.connect().await.unwrap();
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(
        connection.codec().resolved_kinds(),
        vec![RecordKind::Telemetry, RecordKind::Alarm]
    );

    let binding = connection
        .codec()
        .resolve_binding(RecordKind::Telemetry)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.subject, "iot_messages-value");
    assert_eq!(binding.schema_id, 1);
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);

    connection.disconnect().await;
    assert!(connection.codec().resolved_kinds().is_empty());

    connection.connect().await.unwrap();
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_store_probe_tracks_reachability() {
    let broker = FakeBroker::new();
    let connection = json_manager(&broker);
    let store = FakeStore::new(&[]);
    assert!(!connection.store_healthy());

    let shutdown = CancellationToken::new();
    let probe = connection.spawn_store_probe(
        Arc::clone(&store) as Arc<dyn PersistenceStore>,
        Duration::from_secs(5),
        shutdown.clone(),
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(connection.store_healthy());

    store.reachable.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!connection.store_healthy());

    shutdown.cancel();
    probe.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_zero_store_probe_interval_uses_minimum() {
    let broker = FakeBroker::new();
    let connection = json_manager(&broker);
    let store = FakeStore::new(&[]);

    let shutdown = CancellationToken::new();
    let probe = connection.spawn_store_probe(
        Arc::clone(&store) as Arc<dyn PersistenceStore>,
        Duration::ZERO,
        shutdown.clone(),
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(connection.store_healthy());

    store.reachable.store(false, Ordering::SeqCst);
    tokio::time::sleep(MIN_STORE_PROBE_INTERVAL).await;
    assert!(!connection.store_healthy());

    shutdown.cancel();
    probe.await.unwrap();
}
