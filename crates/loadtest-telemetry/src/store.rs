//! Read-only access to the store the pipeline persists records into.

use crate::error::StoreError;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Number of rows in `table`.
    async fn count_rows(&self, table: &str) -> Result<i64, StoreError>;
}

/// PostgreSQL store. The client is opened lazily and dropped after any
/// failure, so the next call reconnects.
pub struct PostgresStore {
    connection_string: String,
    client: Mutex<Option<Client>>,
}

impl PostgresStore {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Client, StoreError> {
        let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection closed: {e}");
            }
        });

        Ok(client)
    }

    async fn query_i64(&self, sql: &str) -> Result<i64, StoreError> {
        let mut guard = self.client.lock().await;
        if !matches!(guard.as_ref(), Some(client) if !client.is_closed()) {
            *guard = Some(self.connect().await?);
        }
        let Some(client) = guard.as_ref() else {
            return Err(StoreError::Connect("no client".to_string()));
        };

        match client.query_one(sql, &[]).await {
            Ok(row) => row
                .try_get::<_, i64>(0)
                .map_err(|e| StoreError::Query(e.to_string())),
            Err(e) => {
                *guard = None;
                Err(StoreError::Query(e.to_string()))
            }
        }
    }
}

/// Accept only plain identifiers (optionally schema-qualified).
pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.query_i64("SELECT 1::BIGINT").await.map(|_| ())
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        validate_table_name(table)?;
        self.query_i64(&format!("SELECT COUNT(*) FROM {table}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("iot_messages").is_ok());
        assert!(validate_table_name("public.iot_alarms").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("x; DROP TABLE y").is_err());
        assert!(validate_table_name("public.").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_connect_error() {
        let store = PostgresStore::new("host=127.0.0.1 port=1 user=none connect_timeout=1");
        let err = store.ping().await.unwrap_err();
        assert!(matches!(err, StoreError::Connect(_)));
    }
}
