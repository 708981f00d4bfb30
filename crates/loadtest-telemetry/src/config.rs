//! Engine configuration: topics, Kafka client settings and retry policy.

use crate::record::RecordKind;
use std::time::Duration;

/// Topic names per record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub telemetry: String,
    pub alarm: String,
}

impl TopicConfig {
    pub fn topic(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Telemetry => &self.telemetry,
            RecordKind::Alarm => &self.alarm,
        }
    }

    /// All configured topics, telemetry first.
    pub fn all(&self) -> [&str; 2] {
        [&self.telemetry, &self.alarm]
    }

    /// Registry subject for a kind (topic-name strategy).
    pub fn subject(&self, kind: RecordKind) -> String {
        format!("{}-value", self.topic(kind))
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            telemetry: "iot_messages".to_string(),
            alarm: "iot_alarms".to_string(),
        }
    }
}

/// Settings for the rdkafka clients.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Kafka brokers (comma-separated list)
    pub bootstrap_servers: String,
    /// Client id; the consumer group id is derived from it
    pub client_id: String,
    /// Delivery timeout for a single publish
    pub message_timeout: Duration,
    /// Timeout for metadata and watermark requests
    pub request_timeout: Duration,
}

impl KafkaSettings {
    pub fn consumer_group(&self) -> String {
        format!("{}-consumer", self.client_id)
    }
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "kafka:9092".to_string(),
            client_id: "iot-platform-backend".to_string(),
            message_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// Exponential backoff for the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}
