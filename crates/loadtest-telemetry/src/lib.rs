//! Load-test engine for a Kafka-backed IoT telemetry pipeline.
//!
//! The engine generates telemetry or alarm records at a fixed rate,
//! publishes them (plain JSON, or Avro bound through a schema registry) and
//! streams run progress to any number of observers.
//!
//! # Architecture
//!
//! ```text
//!  start(config)
//!       │
//!       ▼
//! ┌───────────────┐  producer()   ┌───────────────────┐
//! │ RateScheduler │──────────────►│ ConnectionManager │──► producer / consumer / admin
//! │               │               └─────────┬─────────┘
//! │  tick: gen ──►│ Codec ──► publish       │ consumer
//! └──────┬────────┘                         ▼
//!        │ events                  ┌─────────────────┐
//!        ▼                         │ InspectionPipe  │ decode + recent
//! ┌─────────────────────┐          └─────────────────┘
//! │ ProgressBroadcaster │──► observers
//! └─────────────────────┘
//!
//! CountAggregator ──► admin high-water marks, persisted row counts
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use loadtest_telemetry::{
//!     Codec, ConnectionManager, KafkaConnector, KafkaSettings, LoadTestEngine, RecordKind,
//!     RetryPolicy, RunConfig, TopicConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = Arc::new(KafkaConnector::new(KafkaSettings::default()));
//!     let codec = Arc::new(Codec::json(TopicConfig::default()));
//!     let connection = Arc::new(ConnectionManager::new(connector, codec, RetryPolicy::default()));
//!     connection.connect().await?;
//!
//!     let engine = LoadTestEngine::new(connection, None, vec![], "confluent");
//!     let mut observer = engine.broadcaster().subscribe();
//!     engine.scheduler().start(RunConfig::new(10.0, 2.0, RecordKind::Telemetry))?;
//!
//!     while let Some(event) = observer.recv().await {
//!         println!("{event:?}");
//!         if event.is_terminal() {
//!             break;
//!         }
//!     }
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod counts;
pub mod engine;
pub mod error;
pub mod events;
pub mod inspect;
pub mod kafka;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod store;

// Re-exports for convenience
pub use broadcaster::{Observer, ProgressBroadcaster};
pub use broker::{
    BrokerConnector, BrokerRole, InboundMessage, MessageSource, OffsetReader, RecordPublisher,
};
pub use codec::{Codec, SchemaBinding, WireFormat};
pub use config::{KafkaSettings, RetryPolicy, TopicConfig};
pub use connection::{
    ConnectionManager, ConnectionState, RoleStates, MIN_STORE_PROBE_INTERVAL,
};
pub use counts::{CountAggregator, Counts};
pub use engine::{EngineStatus, LoadTestEngine};
pub use error::{
    CodecError, ConnectionError, CountError, PublishError, SchemaLookupError, SendError,
    StartError, StopError, StoreError, ValidationError,
};
pub use events::ProgressEvent;
pub use inspect::{ConsumeStats, InspectedMessage, Inspector};
pub use kafka::KafkaConnector;
pub use record::{AlarmRecord, Record, RecordGenerator, RecordKind, TelemetryRecord};
pub use registry::{HttpSchemaRegistry, RegisteredSchema, SchemaRegistry};
pub use scheduler::{
    RateScheduler, RunConfig, RunOutcome, RunState, RunStatus, RunSummary, RunTiming,
};
pub use store::{PersistenceStore, PostgresStore};
