//! Record encoding for the broker wire.
//!
//! Without a registry, records travel as plain JSON. With one, each record
//! kind is bound to the latest Avro schema of its `<topic>-value` subject and
//! payloads use the Confluent framing:
//!
//! ```text
//! ┌──────┬─────────────────┬──────────────────┐
//! │ 0x00 │ schema id (BE)  │ avro datum       │
//! │ 1 B  │ 4 B             │ ...              │
//! └──────┴─────────────────┴──────────────────┘
//! ```

use crate::config::TopicConfig;
use crate::error::{CodecError, SchemaLookupError};
use crate::record::{AlarmRecord, Record, RecordKind, TelemetryRecord};
use crate::registry::SchemaRegistry;
use apache_avro::Schema;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

const MAGIC_BYTE: u8 = 0;
const HEADER_LEN: usize = 5;

/// A resolved registry subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaBinding {
    pub subject: String,
    pub schema_id: u32,
    pub version: String,
}

#[derive(Debug)]
struct BoundSchema {
    binding: SchemaBinding,
    schema: Schema,
}

/// Wire format the codec produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Json,
    Avro,
}

pub struct Codec {
    registry: Option<Arc<dyn SchemaRegistry>>,
    topics: TopicConfig,
    bindings: RwLock<HashMap<RecordKind, Arc<BoundSchema>>>,
    // Serializes lookups so a subject is fetched at most once per epoch.
    resolve_lock: tokio::sync::Mutex<()>,
}

impl Codec {
    /// Codec that writes plain JSON.
    pub fn json(topics: TopicConfig) -> Self {
        Self::build(None, topics)
    }

    /// Codec that binds each record kind to a registry schema.
    pub fn with_registry(registry: Arc<dyn SchemaRegistry>, topics: TopicConfig) -> Self {
        Self::build(Some(registry), topics)
    }

    fn build(registry: Option<Arc<dyn SchemaRegistry>>, topics: TopicConfig) -> Self {
        Self {
            registry,
            topics,
            bindings: RwLock::new(HashMap::new()),
            resolve_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn format(&self) -> WireFormat {
        if self.registry.is_some() {
            WireFormat::Avro
        } else {
            WireFormat::Json
        }
    }

    pub fn schema_mode(&self) -> bool {
        self.registry.is_some()
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    /// Return the cached binding for `kind`, looking it up on first use.
    ///
    /// In JSON mode there is nothing to bind and this returns `Ok(None)`.
    pub async fn resolve_binding(
        &self,
        kind: RecordKind,
    ) -> Result<Option<SchemaBinding>, SchemaLookupError> {
        let Some(registry) = &self.registry else {
            return Ok(None);
        };

        let _guard = self.resolve_lock.lock().await;
        if let Some(bound) = self.cached(kind) {
            return Ok(Some(bound.binding.clone()));
        }

        let subject = self.topics.subject(kind);
        let registered = registry.latest(&subject).await?;
        let schema =
            Schema::parse_str(&registered.schema).map_err(|e| SchemaLookupError::InvalidSchema {
                subject: subject.clone(),
                message: e.to_string(),
            })?;

        let binding = SchemaBinding {
            subject: registered.subject,
            schema_id: registered.id,
            version: registered.version.to_string(),
        };
        tracing::info!(
            "Bound {} records to subject '{}' (id {}, version {})",
            kind,
            binding.subject,
            binding.schema_id,
            binding.version
        );

        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                kind,
                Arc::new(BoundSchema {
                    binding: binding.clone(),
                    schema,
                }),
            );
        Ok(Some(binding))
    }

    /// Drop every cached binding; the next resolve starts a new epoch.
    pub fn invalidate(&self) {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Record kinds with a resolved binding, telemetry first.
    pub fn resolved_kinds(&self) -> Vec<RecordKind> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        RecordKind::ALL
            .into_iter()
            .filter(|kind| bindings.contains_key(kind))
            .collect()
    }

    pub fn binding(&self, kind: RecordKind) -> Option<SchemaBinding> {
        self.cached(kind).map(|bound| bound.binding.clone())
    }

    fn cached(&self, kind: RecordKind) -> Option<Arc<BoundSchema>> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Serialize `record` for the topic of `kind`.
    pub fn encode(&self, kind: RecordKind, record: &Record) -> Result<Vec<u8>, CodecError> {
        if record.kind() != kind {
            return Err(CodecError::Encode(format!(
                "expected a {kind} record, got {}",
                record.kind()
            )));
        }

        if self.registry.is_none() {
            return serde_json::to_vec(record).map_err(|e| CodecError::Encode(e.to_string()));
        }

        let bound = self
            .cached(kind)
            .ok_or(SchemaLookupError::Unbound(kind))?;

        let value = apache_avro::to_value(record)
            .and_then(|value| value.resolve(&bound.schema))
            .map_err(|e| {
                CodecError::Encode(format!(
                    "record does not match subject '{}': {e}",
                    bound.binding.subject
                ))
            })?;
        let datum = apache_avro::to_avro_datum(&bound.schema, value)
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        let mut payload = Vec::with_capacity(HEADER_LEN + datum.len());
        payload.push(MAGIC_BYTE);
        payload.extend_from_slice(&bound.binding.schema_id.to_be_bytes());
        payload.extend_from_slice(&datum);
        Ok(payload)
    }

    /// Inverse of [`Codec::encode`]; accepts either wire format.
    pub fn decode(&self, bytes: &[u8]) -> Result<Record, CodecError> {
        if bytes.first() != Some(&MAGIC_BYTE) {
            return serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()));
        }
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Decode(format!(
                "framed payload too short ({} bytes)",
                bytes.len()
            )));
        }

        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[1..HEADER_LEN]);
        let schema_id = u32::from_be_bytes(id);

        let (kind, bound) = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, bound)| bound.binding.schema_id == schema_id)
            .map(|(kind, bound)| (*kind, Arc::clone(bound)))
            .ok_or_else(|| CodecError::Decode(format!("unknown schema id {schema_id}")))?;

        let mut datum = &bytes[HEADER_LEN..];
        let value = apache_avro::from_avro_datum(&bound.schema, &mut datum, None)
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        let record = match kind {
            RecordKind::Telemetry => {
                apache_avro::from_value::<TelemetryRecord>(&value).map(Record::Telemetry)
            }
            RecordKind::Alarm => apache_avro::from_value::<AlarmRecord>(&value).map(Record::Alarm),
        };
        record.map_err(|e| CodecError::Decode(e.to_string()))
    }
}
