//! Error types for the load-test engine.
//!
//! Each enum maps to one failure class: connection errors are retried by the
//! [`ConnectionManager`](crate::ConnectionManager), codec and publish errors
//! terminate the current run, validation errors reject `start()` outright, and
//! store errors only degrade persisted-count reporting.

use crate::broker::BrokerRole;
use thiserror::Error;

/// Failures while establishing or tearing down broker sessions.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Failed to open {role} session: {message}")]
    Session { role: BrokerRole, message: String },

    #[error("Schema binding failed during connect: {0}")]
    Schema(#[from] SchemaLookupError),

    #[error("Broker unavailable after {attempts} attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },

    #[error("No live {0} session")]
    NotConnected(BrokerRole),
}

/// Failures resolving a schema binding from the registry.
#[derive(Error, Debug, Clone)]
pub enum SchemaLookupError {
    #[error("No version found for subject '{0}'")]
    NoVersion(String),

    #[error("Schema registry request for '{subject}' failed: {message}")]
    Registry { subject: String, message: String },

    #[error("Schema for subject '{subject}' is not valid Avro: {message}")]
    InvalidSchema { subject: String, message: String },

    #[error("Schema mode is enabled but no binding is resolved for {0}")]
    Unbound(crate::record::RecordKind),
}

/// Failures translating records to or from the wire representation.
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error(transparent)]
    SchemaLookup(#[from] SchemaLookupError),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Failures delivering a record to the broker.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("Kafka delivery failed: {0}")]
    Delivery(String),

    #[error("Producer session is closed")]
    Closed,
}

impl From<rdkafka::error::KafkaError> for PublishError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        PublishError::Delivery(err.to_string())
    }
}

/// Parameter problems detected synchronously by `start()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("recordsPerSecond must be a positive number, got {0}")]
    RecordsPerSecond(f64),

    #[error("durationSeconds must be a positive number, got {0}")]
    DurationSeconds(f64),
}

/// Rejections returned by `RateScheduler::start`.
#[derive(Error, Debug, Clone)]
pub enum StartError {
    #[error("already running")]
    AlreadyRunning,

    #[error("invalid parameters: {0}")]
    Invalid(#[from] ValidationError),

    #[error("broker not connected: {0}")]
    NotConnected(#[from] ConnectionError),
}

/// Rejections returned by `RateScheduler::stop`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StopError {
    #[error("no active run")]
    NoActiveRun,
}

/// Failures of a one-off publish outside a run.
#[derive(Error, Debug, Clone)]
pub enum SendError {
    #[error(transparent)]
    NotConnected(#[from] ConnectionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Failures of the read-only count queries.
#[derive(Error, Debug, Clone)]
pub enum CountError {
    #[error("Broker unavailable: no admin session")]
    BrokerUnavailable,

    #[error("Offset query for topic '{topic}' failed: {message}")]
    Offsets { topic: String, message: String },

    #[error("Persistence store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Failures talking to the persistence store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connect(String),

    #[error("Store query failed: {0}")]
    Query(String),

    #[error("Invalid table name '{0}'")]
    InvalidTable(String),
}

impl From<StoreError> for CountError {
    fn from(err: StoreError) -> Self {
        CountError::StoreUnavailable(err.to_string())
    }
}
