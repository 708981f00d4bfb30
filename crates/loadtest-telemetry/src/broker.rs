//! Seams between the engine and the broker client.
//!
//! The [`ConnectionManager`](crate::ConnectionManager) opens one session per
//! [`BrokerRole`] through a [`BrokerConnector`]. The Kafka implementations
//! live in [`crate::kafka`]; tests substitute in-memory ones.

use crate::error::{ConnectionError, CountError, PublishError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// The three broker sessions the engine keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerRole {
    Producer,
    Consumer,
    Admin,
}

impl BrokerRole {
    pub const ALL: [BrokerRole; 3] = [BrokerRole::Producer, BrokerRole::Consumer, BrokerRole::Admin];
}

impl fmt::Display for BrokerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrokerRole::Producer => "producer",
            BrokerRole::Consumer => "consumer",
            BrokerRole::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// A message read back from a topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Producer session.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Publish one payload and wait for the delivery report.
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<(), PublishError>;

    /// Flush outstanding deliveries and release the session.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Admin/metadata session used for offset queries.
#[async_trait]
pub trait OffsetReader: Send + Sync {
    /// High-water mark of every partition of `topic`.
    async fn high_watermarks(&self, topic: &str) -> Result<Vec<i64>, CountError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Consumer session.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next message. `Ok(None)` means the source is exhausted.
    async fn recv(&mut self) -> Result<Option<InboundMessage>, ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Factory for broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open_producer(&self) -> Result<Arc<dyn RecordPublisher>, ConnectionError>;

    async fn open_consumer(&self, topics: &[&str])
        -> Result<Box<dyn MessageSource>, ConnectionError>;

    async fn open_admin(&self) -> Result<Arc<dyn OffsetReader>, ConnectionError>;
}
