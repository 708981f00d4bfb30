//! rdkafka-backed broker sessions.

use crate::broker::{
    BrokerConnector, BrokerRole, InboundMessage, MessageSource, OffsetReader, RecordPublisher,
};
use crate::config::KafkaSettings;
use crate::error::{ConnectionError, CountError, PublishError};
use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Opens rdkafka clients against one bootstrap address.
pub struct KafkaConnector {
    settings: KafkaSettings,
}

impl KafkaConnector {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.bootstrap_servers)
            .set("client.id", &self.settings.client_id)
            .set(
                "socket.timeout.ms",
                self.settings.request_timeout.as_millis().to_string(),
            );
        config
    }
}

fn session_error(role: BrokerRole, err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Session {
        role,
        message: err.to_string(),
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    async fn open_producer(&self) -> Result<Arc<dyn RecordPublisher>, ConnectionError> {
        let producer: FutureProducer = self
            .base_config()
            .set(
                "message.timeout.ms",
                self.settings.message_timeout.as_millis().to_string(),
            )
            .set("queue.buffering.max.messages", "100000")
            .set("linger.ms", "5")
            .create()
            .map_err(|e| session_error(BrokerRole::Producer, e))?;

        // Client creation is lazy; a metadata round-trip proves the broker is reachable.
        let probe = producer.clone();
        let timeout = self.settings.request_timeout;
        tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| session_error(BrokerRole::Producer, e))?
            .map_err(|e| session_error(BrokerRole::Producer, e))?;

        info!("Kafka producer connected to {}", self.settings.bootstrap_servers);
        Ok(Arc::new(KafkaPublisher {
            producer,
            message_timeout: self.settings.message_timeout,
        }))
    }

    async fn open_consumer(
        &self,
        topics: &[&str],
    ) -> Result<Box<dyn MessageSource>, ConnectionError> {
        let consumer: StreamConsumer = self
            .base_config()
            .set("group.id", self.settings.consumer_group())
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| session_error(BrokerRole::Consumer, e))?;

        consumer
            .subscribe(topics)
            .map_err(|e| session_error(BrokerRole::Consumer, e))?;

        info!("Kafka consumer subscribed to {:?}", topics);
        Ok(Box::new(KafkaMessageSource { consumer }))
    }

    async fn open_admin(&self) -> Result<Arc<dyn OffsetReader>, ConnectionError> {
        let consumer: BaseConsumer = self
            .base_config()
            .set("group.id", format!("{}-admin", self.settings.client_id))
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| session_error(BrokerRole::Admin, e))?;
        let consumer = Arc::new(consumer);

        let probe = Arc::clone(&consumer);
        let timeout = self.settings.request_timeout;
        tokio::task::spawn_blocking(move || probe.fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| session_error(BrokerRole::Admin, e))?
            .map_err(|e| session_error(BrokerRole::Admin, e))?;

        info!("Kafka admin session ready");
        Ok(Arc::new(KafkaOffsetReader {
            consumer,
            timeout: self.settings.request_timeout,
        }))
    }
}

struct KafkaPublisher {
    producer: FutureProducer,
    message_timeout: Duration,
}

#[async_trait]
impl RecordPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, self.message_timeout)
            .await
            .map(|_| ())
            .map_err(|(err, _)| PublishError::from(err))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let producer = self.producer.clone();
        let timeout = self.message_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| session_error(BrokerRole::Producer, e))?
            .map_err(|e| session_error(BrokerRole::Producer, e))?;
        debug!("Kafka producer flushed");
        Ok(())
    }
}

struct KafkaOffsetReader {
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

#[async_trait]
impl OffsetReader for KafkaOffsetReader {
    async fn high_watermarks(&self, topic: &str) -> Result<Vec<i64>, CountError> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let topic_name = topic.to_string();

        let offsets_error = |message: String| CountError::Offsets {
            topic: topic.to_string(),
            message,
        };

        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic_name), timeout)
                .map_err(|e| e.to_string())?;

            let mut highs = Vec::new();
            for topic_meta in metadata.topics() {
                if let Some(err) = topic_meta.error() {
                    return Err(format!("{err:?}"));
                }
                for partition in topic_meta.partitions() {
                    let (_, high) = consumer
                        .fetch_watermarks(&topic_name, partition.id(), timeout)
                        .map_err(|e| e.to_string())?;
                    highs.push(high);
                }
            }
            Ok(highs)
        })
        .await
        .map_err(|e| offsets_error(e.to_string()))?
        .map_err(offsets_error)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

struct KafkaMessageSource {
    consumer: StreamConsumer,
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn recv(&mut self) -> Result<Option<InboundMessage>, ConnectionError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| session_error(BrokerRole::Consumer, e))?;

        Ok(Some(InboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().unwrap_or_default().to_vec(),
        }))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
