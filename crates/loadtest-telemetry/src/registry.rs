//! Client for a Confluent-compatible schema registry.

use crate::error::SchemaLookupError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// The latest registered version of a subject.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisteredSchema {
    pub subject: String,
    pub id: u32,
    pub version: i32,
    pub schema: String,
}

/// Lookup side of a schema registry.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Fetch the current version of `subject`.
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, SchemaLookupError>;
}

/// Schema registry reached over its REST API.
pub struct HttpSchemaRegistry {
    client: Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: &str) -> Result<Self, SchemaLookupError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SchemaLookupError::Registry {
                subject: String::new(),
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, SchemaLookupError> {
        let url = format!("{}/subjects/{subject}/versions/latest", self.base_url);
        tracing::debug!("Looking up schema subject '{subject}' at {url}");

        let registry_error = |message: String| SchemaLookupError::Registry {
            subject: subject.to_string(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.schemaregistry.v1+json")
            .send()
            .await
            .map_err(|e| registry_error(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(SchemaLookupError::NoVersion(subject.to_string())),
            status if !status.is_success() => Err(registry_error(format!("HTTP {status}"))),
            _ => response
                .json::<RegisteredSchema>()
                .await
                .map_err(|e| registry_error(format!("Invalid response body: {e}"))),
        }
    }
}
