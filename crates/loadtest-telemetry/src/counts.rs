//! On-demand message counts for status reporting.

use crate::config::TopicConfig;
use crate::connection::ConnectionManager;
use crate::error::CountError;
use crate::store::PersistenceStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Count per topic or table name.
pub type Counts = BTreeMap<String, i64>;

pub struct CountAggregator {
    connection: Arc<ConnectionManager>,
    store: Option<Arc<dyn PersistenceStore>>,
    topics: TopicConfig,
    tables: Vec<String>,
}

impl CountAggregator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        store: Option<Arc<dyn PersistenceStore>>,
        tables: Vec<String>,
    ) -> Self {
        let topics = connection.codec().topics().clone();
        Self {
            connection,
            store,
            topics,
            tables,
        }
    }

    /// Sum of partition high-water marks for every configured topic.
    pub async fn topic_counts(&self) -> Result<Counts, CountError> {
        let admin = self
            .connection
            .admin()
            .map_err(|_| CountError::BrokerUnavailable)?;

        let mut counts = Counts::new();
        for topic in self.topics.all() {
            let total = admin
                .high_watermarks(topic)
                .await?
                .into_iter()
                .map(|high| high.max(0))
                .sum::<i64>();
            counts.insert(topic.to_string(), total);
        }
        Ok(counts)
    }

    /// Row count of every configured table.
    pub async fn persisted_counts(&self) -> Result<Counts, CountError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| CountError::StoreUnavailable("no store configured".to_string()))?;

        let mut counts = Counts::new();
        for table in &self.tables {
            counts.insert(table.clone(), store.count_rows(table).await?);
        }
        Ok(counts)
    }

    /// Like [`Self::topic_counts`], but zeros on failure.
    pub async fn topic_counts_or_zero(&self) -> Counts {
        self.topic_counts().await.unwrap_or_else(|e| {
            warn!("Topic counts unavailable: {e}");
            zeroed(self.topics.all())
        })
    }

    /// Like [`Self::persisted_counts`], but zeros on failure.
    pub async fn persisted_counts_or_zero(&self) -> Counts {
        self.persisted_counts().await.unwrap_or_else(|e| {
            warn!("Persisted counts unavailable: {e}");
            zeroed(self.tables.iter().map(String::as_str))
        })
    }
}

fn zeroed<'a>(names: impl IntoIterator<Item = &'a str>) -> Counts {
    names.into_iter().map(|name| (name.to_string(), 0)).collect()
}
