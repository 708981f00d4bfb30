//! Wiring of the engine components and the combined status view.

use crate::broadcaster::ProgressBroadcaster;
use crate::connection::{ConnectionManager, RoleStates};
use crate::counts::CountAggregator;
use crate::inspect::ConsumeStats;
use crate::record::RecordKind;
use crate::scheduler::{RateScheduler, RunState, RunSummary};
use crate::store::PersistenceStore;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub healthy: bool,
    pub broker: String,
    pub connection: RoleStates,
    pub run: RunState,
    pub last_run: Option<RunSummary>,
    pub schema_mode: bool,
    pub schema_bindings_resolved: Vec<RecordKind>,
    pub store_healthy: bool,
    pub consumed: ConsumeStats,
}

pub struct LoadTestEngine {
    connection: Arc<ConnectionManager>,
    scheduler: RateScheduler,
    counts: CountAggregator,
    broker_label: String,
}

impl LoadTestEngine {
    pub fn new(
        connection: Arc<ConnectionManager>,
        store: Option<Arc<dyn PersistenceStore>>,
        tables: Vec<String>,
        broker_label: impl Into<String>,
    ) -> Self {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        Self {
            scheduler: RateScheduler::new(Arc::clone(&connection), broadcaster),
            counts: CountAggregator::new(Arc::clone(&connection), store, tables),
            connection,
            broker_label: broker_label.into(),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn scheduler(&self) -> &RateScheduler {
        &self.scheduler
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        self.scheduler.broadcaster()
    }

    pub fn counts(&self) -> &CountAggregator {
        &self.counts
    }

    pub fn status(&self) -> EngineStatus {
        let codec = self.connection.codec();
        EngineStatus {
            healthy: self.connection.is_connected(),
            broker: self.broker_label.clone(),
            connection: self.connection.states(),
            run: self.scheduler.run_state(),
            last_run: self.scheduler.last_run(),
            schema_mode: codec.schema_mode(),
            schema_bindings_resolved: codec.resolved_kinds(),
            store_healthy: self.connection.store_healthy(),
            consumed: self.connection.inspector().stats(),
        }
    }

    /// Stop any run and close every broker session.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.connection.disconnect().await;
    }
}
