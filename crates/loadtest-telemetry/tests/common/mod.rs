//! In-memory broker, registry and store used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use loadtest_telemetry::{
    BrokerConnector, BrokerRole, Codec, ConnectionError, ConnectionManager, CountError,
    InboundMessage, MessageSource, OffsetReader, PersistenceStore, PublishError, RecordPublisher,
    RegisteredSchema, RetryPolicy, SchemaLookupError, SchemaRegistry, StoreError, TopicConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const TELEMETRY_SCHEMA: &str = r#"{
    "type": "record", "name": "Telemetry", "namespace": "iot",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "deviceId", "type": "string"},
        {"name": "timestamp", "type": "string"},
        {"name": "temperature", "type": "double"},
        {"name": "humidity", "type": "double"},
        {"name": "pressure", "type": "double"},
        {"name": "battery", "type": "double"},
        {"name": "signalStrength", "type": "int"}
    ]
}"#;

pub const ALARM_SCHEMA: &str = r#"{
    "type": "record", "name": "Alarm", "namespace": "iot",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "deviceId", "type": "string"},
        {"name": "timestamp", "type": "string"},
        {"name": "alarmType", "type": "string"},
        {"name": "severity", "type": "int"},
        {"name": "code", "type": "int"},
        {"name": "message", "type": "string"}
    ]
}"#;

/// A record as the fake broker stored it.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Shared state of the fake broker.
pub struct FakeBroker {
    /// Number of producer opens that fail before one succeeds
    pub failing_opens: AtomicU32,
    pub open_attempts: AtomicU32,
    pub publish_latency: Mutex<Duration>,
    /// Fail the publish with this 1-based index
    pub fail_publish_at: Mutex<Option<u64>>,
    pub publish_calls: AtomicU64,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fail_teardown: AtomicBool,
    pub closes: AtomicU32,
    pub published: Mutex<Vec<Published>>,
    pub watermarks: Mutex<HashMap<String, Vec<i64>>>,
    loopback: broadcast::Sender<InboundMessage>,
    offsets: AtomicU64,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        let (loopback, _) = broadcast::channel(4096);
        Arc::new(Self {
            failing_opens: AtomicU32::new(0),
            open_attempts: AtomicU32::new(0),
            publish_latency: Mutex::new(Duration::ZERO),
            fail_publish_at: Mutex::new(None),
            publish_calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_teardown: AtomicBool::new(false),
            closes: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
            watermarks: Mutex::new(HashMap::new()),
            loopback,
            offsets: AtomicU64::new(0),
        })
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.publish_latency.lock().unwrap() = latency;
    }

    pub fn fail_publish_at(&self, index: u64) {
        *self.fail_publish_at.lock().unwrap() = Some(index);
    }

    pub fn set_watermarks(&self, topic: &str, highs: Vec<i64>) {
        self.watermarks
            .lock()
            .unwrap()
            .insert(topic.to_string(), highs);
    }
}

pub struct FakeConnector(pub Arc<FakeBroker>);

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn open_producer(&self) -> Result<Arc<dyn RecordPublisher>, ConnectionError> {
        self.0.open_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.0.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.0.failing_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectionError::Session {
                role: BrokerRole::Producer,
                message: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(FakePublisher(Arc::clone(&self.0))))
    }

    async fn open_consumer(
        &self,
        _topics: &[&str],
    ) -> Result<Box<dyn MessageSource>, ConnectionError> {
        Ok(Box::new(FakeSource {
            broker: Arc::clone(&self.0),
            rx: self.0.loopback.subscribe(),
        }))
    }

    async fn open_admin(&self) -> Result<Arc<dyn OffsetReader>, ConnectionError> {
        Ok(Arc::new(FakeAdmin(Arc::clone(&self.0))))
    }
}

fn teardown_result(broker: &FakeBroker, role: BrokerRole) -> Result<(), ConnectionError> {
    broker.closes.fetch_add(1, Ordering::SeqCst);
    if broker.fail_teardown.load(Ordering::SeqCst) {
        return Err(ConnectionError::Session {
            role,
            message: "teardown failed".to_string(),
        });
    }
    Ok(())
}

struct FakePublisher(Arc<FakeBroker>);

#[async_trait]
impl RecordPublisher for FakePublisher {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<(), PublishError> {
        let broker = &self.0;
        let call = broker.publish_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = broker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        broker.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let latency = *broker.publish_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        broker.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *broker.fail_publish_at.lock().unwrap() == Some(call) {
            return Err(PublishError::Delivery("broker rejected the record".to_string()));
        }

        broker.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            key: key.to_vec(),
            payload: payload.to_vec(),
        });
        let offset = broker.offsets.fetch_add(1, Ordering::SeqCst) as i64;
        let _ = broker.loopback.send(InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        teardown_result(&self.0, BrokerRole::Producer)
    }
}

struct FakeAdmin(Arc<FakeBroker>);

#[async_trait]
impl OffsetReader for FakeAdmin {
    async fn high_watermarks(&self, topic: &str) -> Result<Vec<i64>, CountError> {
        Ok(self
            .0
            .watermarks
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        teardown_result(&self.0, BrokerRole::Admin)
    }
}

struct FakeSource {
    broker: Arc<FakeBroker>,
    rx: broadcast::Receiver<InboundMessage>,
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn recv(&mut self) -> Result<Option<InboundMessage>, ConnectionError> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(Some(message)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        teardown_result(&self.broker, BrokerRole::Consumer)
    }
}

/// Registry serving the built-in schemas for the default topics.
pub struct FakeRegistry {
    pub lookups: AtomicU32,
    pub subjects: HashMap<String, (u32, String)>,
}

impl FakeRegistry {
    pub fn with_default_subjects() -> Arc<Self> {
        Self::with_telemetry_schema(TELEMETRY_SCHEMA)
    }

    /// Default subjects, with `schema` registered for telemetry.
    pub fn with_telemetry_schema(schema: &str) -> Arc<Self> {
        let mut subjects = HashMap::new();
        subjects.insert("iot_messages-value".to_string(), (1, schema.to_string()));
        subjects.insert("iot_alarms-value".to_string(), (2, ALARM_SCHEMA.to_string()));
        Arc::new(Self {
            lookups: AtomicU32::new(0),
            subjects,
        })
    }
}

#[async_trait]
impl SchemaRegistry for FakeRegistry {
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, SchemaLookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let (id, schema) = self
            .subjects
            .get(subject)
            .ok_or_else(|| SchemaLookupError::NoVersion(subject.to_string()))?;
        Ok(RegisteredSchema {
            subject: subject.to_string(),
            id: *id,
            version: 1,
            schema: schema.clone(),
        })
    }
}

/// Store with fixed row counts that can be switched off.
pub struct FakeStore {
    pub reachable: AtomicBool,
    pub rows: HashMap<String, i64>,
}

impl FakeStore {
    pub fn new(rows: &[(&str, i64)]) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            rows: rows.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
        })
    }
}

#[async_trait]
impl PersistenceStore for FakeStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connect("connection refused".to_string()))
        }
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        self.ping().await?;
        self.rows
            .get(table)
            .copied()
            .ok_or_else(|| StoreError::Query(format!("relation \"{table}\" does not exist")))
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(30),
        max_attempts,
    }
}

/// JSON-mode manager over a fake broker.
pub fn json_manager(broker: &Arc<FakeBroker>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        Arc::new(FakeConnector(Arc::clone(broker))),
        Arc::new(Codec::json(TopicConfig::default())),
        fast_retry(5),
    ))
}

/// Avro-mode manager over a fake broker and registry.
pub fn avro_manager(
    broker: &Arc<FakeBroker>,
    registry: &Arc<FakeRegistry>,
) -> Arc<ConnectionManager> {
    let registry: Arc<dyn SchemaRegistry> = Arc::clone(registry) as Arc<dyn SchemaRegistry>;
    Arc::new(ConnectionManager::new(
        Arc::new(FakeConnector(Arc::clone(broker))),
        Arc::new(Codec::with_registry(registry, TopicConfig::default())),
        fast_retry(5),
    ))
}
