//! Rate-controlled emission of synthetic records.
//!
//! At most one run is active per scheduler. `start()` is the single
//! check-and-set on the run slot; after that only the run's own task
//! mutates [`RunState`], until it hands the slot back as `Idle`.
//!
//! Tick `n` (0-based) is due at `start + n * delay`, so publish latency
//! delays individual ticks without accumulating skew over the run.

use crate::broadcaster::ProgressBroadcaster;
use crate::broker::{BrokerRole, RecordPublisher};
use crate::codec::Codec;
use crate::connection::{ConnectionManager, ConnectionState, RoleStates};
use crate::error::{SendError, StartError, StopError, ValidationError};
use crate::events::ProgressEvent;
use crate::record::{RecordGenerator, RecordKind, DEFAULT_DEVICE_ID};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

fn default_device_id() -> String {
    DEFAULT_DEVICE_ID.to_string()
}

/// Parameters of one run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub records_per_second: f64,
    pub duration_seconds: f64,
    pub record_kind: RecordKind,
    /// Seed for the record generator; random when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

impl RunConfig {
    pub fn new(records_per_second: f64, duration_seconds: f64, record_kind: RecordKind) -> Self {
        Self {
            records_per_second,
            duration_seconds,
            record_kind,
            seed: None,
            device_id: default_device_id(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the parameters and derive the tick gap and run length.
    pub fn validate(&self) -> Result<RunTiming, ValidationError> {
        let rate = self.records_per_second;
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(ValidationError::RecordsPerSecond(rate));
        }
        let delay = Duration::try_from_secs_f64(1.0 / rate)
            .ok()
            .filter(|delay| !delay.is_zero())
            .ok_or(ValidationError::RecordsPerSecond(rate))?;

        let secs = self.duration_seconds;
        if !(secs > 0.0 && secs.is_finite()) {
            return Err(ValidationError::DurationSeconds(secs));
        }
        let duration = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|duration| Instant::now().checked_add(*duration).is_some())
            .ok_or(ValidationError::DurationSeconds(secs))?;

        Ok(RunTiming { delay, duration })
    }
}

/// Tick gap and run length of a validated [`RunConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTiming {
    pub delay: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
}

/// How a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Stopped,
}

/// The live run slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub status: RunStatus,
    pub config: Option<RunConfig>,
    pub started_at: Option<DateTime<Utc>>,
    pub records_sent: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn idle() -> Self {
        Self {
            status: RunStatus::Idle,
            config: None,
            started_at: None,
            records_sent: 0,
            last_tick_at: None,
        }
    }
}

/// Record of the most recent finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub config: RunConfig,
    pub records_sent: u64,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct RunContext {
    state: RunState,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    last_run: Option<RunSummary>,
}

pub struct RateScheduler {
    connection: Arc<ConnectionManager>,
    broadcaster: Arc<ProgressBroadcaster>,
    run: Arc<Mutex<RunContext>>,
}

impl RateScheduler {
    pub fn new(connection: Arc<ConnectionManager>, broadcaster: Arc<ProgressBroadcaster>) -> Self {
        Self {
            connection,
            broadcaster,
            run: Arc::new(Mutex::new(RunContext {
                state: RunState::idle(),
                cancel: None,
                task: None,
                last_run: None,
            })),
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn run_state(&self) -> RunState {
        lock(&self.run).state.clone()
    }

    pub fn last_run(&self) -> Option<RunSummary> {
        lock(&self.run).last_run.clone()
    }

    /// Begin a run. Rejected if one is already active, the parameters are
    /// invalid, or no producer session is live.
    pub fn start(&self, config: RunConfig) -> Result<(), StartError> {
        let mut ctx = lock(&self.run);
        if ctx.state.status != RunStatus::Idle {
            return Err(StartError::AlreadyRunning);
        }
        let timing = config.validate()?;
        let publisher = self.connection.producer()?;
        let start = Instant::now();
        let deadline = start
            .checked_add(timing.duration)
            .ok_or(ValidationError::DurationSeconds(config.duration_seconds))?;

        let cancel = CancellationToken::new();
        ctx.state = RunState {
            status: RunStatus::Running,
            config: Some(config.clone()),
            started_at: Some(Utc::now()),
            records_sent: 0,
            last_tick_at: None,
        };
        ctx.cancel = Some(cancel.clone());

        info!(
            "Starting run: {} {} records/s for {}s",
            config.record_kind, config.records_per_second, config.duration_seconds
        );
        self.broadcaster.publish(ProgressEvent::Started {
            config: config.clone(),
        });

        let run_loop = RunLoop {
            topic: self.connection.codec().topics().topic(config.record_kind).to_string(),
            config,
            start,
            delay: timing.delay,
            deadline,
            publisher,
            codec: Arc::clone(self.connection.codec()),
            broadcaster: Arc::clone(&self.broadcaster),
            states: self.connection.subscribe_states(),
            run: Arc::clone(&self.run),
            cancel,
        };
        ctx.task = Some(tokio::spawn(run_loop.execute()));
        Ok(())
    }

    /// Ask the active run to stop before its next publish.
    pub fn stop(&self) -> Result<(), StopError> {
        let ctx = lock(&self.run);
        match (&ctx.state.status, &ctx.cancel) {
            (RunStatus::Running, Some(cancel)) => {
                info!("Stop requested");
                cancel.cancel();
                Ok(())
            }
            _ => Err(StopError::NoActiveRun),
        }
    }

    /// Stop any active run and wait for its task to finish.
    pub async fn shutdown(&self) {
        let task = {
            let mut ctx = lock(&self.run);
            if let Some(cancel) = &ctx.cancel {
                cancel.cancel();
            }
            ctx.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Run task ended abnormally: {e}");
            }
        }
    }

    /// Publish a single generated record outside of any run.
    pub async fn publish_one(&self, kind: RecordKind) -> Result<(), SendError> {
        let publisher = self.connection.producer()?;
        let codec = self.connection.codec();
        let record = RecordGenerator::new(None, DEFAULT_DEVICE_ID).generate(kind, 1);
        let payload = codec.encode(kind, &record)?;
        publisher
            .publish(codec.topics().topic(kind), record.device_id().as_bytes(), &payload)
            .await?;
        debug!("Published single {kind} record");
        Ok(())
    }
}

fn lock(run: &Mutex<RunContext>) -> MutexGuard<'_, RunContext> {
    run.lock().unwrap_or_else(PoisonError::into_inner)
}

enum RunEnd {
    Completed { sent: u64, duration: f64 },
    Stopped { sent: u64, elapsed: f64 },
    Failed { sent: u64, elapsed: f64, reason: String },
}

struct RunLoop {
    config: RunConfig,
    start: Instant,
    delay: Duration,
    deadline: Instant,
    topic: String,
    publisher: Arc<dyn RecordPublisher>,
    codec: Arc<Codec>,
    broadcaster: Arc<ProgressBroadcaster>,
    states: watch::Receiver<RoleStates>,
    run: Arc<Mutex<RunContext>>,
    cancel: CancellationToken,
}

impl RunLoop {
    async fn execute(self) {
        let end = self.emit().await;
        self.finish(end);
    }

    async fn emit(&self) -> RunEnd {
        let kind = self.config.record_kind;
        let (start, deadline) = (self.start, self.deadline);
        let mut generator = RecordGenerator::new(self.config.seed, self.config.device_id.clone());
        let mut sent: u64 = 0;
        let mut last_progress_second: u64 = 0;

        let elapsed = || start.elapsed().as_secs_f64();

        loop {
            if self.cancel.is_cancelled() {
                return RunEnd::Stopped { sent, elapsed: elapsed() };
            }
            if self.states.borrow().get(BrokerRole::Producer) != ConnectionState::Connected {
                return RunEnd::Failed {
                    sent,
                    elapsed: elapsed(),
                    reason: "broker connection lost".to_string(),
                };
            }

            let due = Duration::try_from_secs_f64(self.delay.as_secs_f64() * sent as f64)
                .ok()
                .and_then(|offset| start.checked_add(offset));
            let due = match due {
                Some(due) if due < deadline && Instant::now() < deadline => due,
                _ => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return RunEnd::Stopped { sent, elapsed: elapsed() };
                        }
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                    return RunEnd::Completed {
                        sent,
                        duration: elapsed(),
                    };
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return RunEnd::Stopped { sent, elapsed: elapsed() };
                }
                _ = tokio::time::sleep_until(due) => {}
            }

            let record = generator.generate(kind, sent as i64 + 1);
            let payload = match self.codec.encode(kind, &record) {
                Ok(payload) => payload,
                Err(e) => {
                    return RunEnd::Failed {
                        sent,
                        elapsed: elapsed(),
                        reason: e.to_string(),
                    }
                }
            };
            if let Err(e) = self
                .publisher
                .publish(&self.topic, record.device_id().as_bytes(), &payload)
                .await
            {
                return RunEnd::Failed {
                    sent,
                    elapsed: elapsed(),
                    reason: e.to_string(),
                };
            }

            sent += 1;
            {
                let mut ctx = lock(&self.run);
                ctx.state.records_sent = sent;
                ctx.state.last_tick_at = Some(Utc::now());
            }

            let since_start = start.elapsed();
            let second = since_start.as_secs();
            if second > last_progress_second {
                last_progress_second = second;
                let secs = since_start.as_secs_f64();
                self.broadcaster.publish(ProgressEvent::Progress {
                    sent,
                    elapsed: secs,
                    rate: sent as f64 / secs,
                });
            }
        }
    }

    /// Hand the slot back as Idle and emit the terminal event under the same
    /// lock, so a following run's `Started` cannot overtake it.
    fn finish(self, end: RunEnd) {
        let mut ctx = lock(&self.run);
        let (outcome, sent, duration, reason, event) = match end {
            RunEnd::Completed { sent, duration } => {
                info!("Run completed: {sent} records in {duration:.2}s");
                (
                    RunOutcome::Completed,
                    sent,
                    duration,
                    None,
                    ProgressEvent::Completed { sent, duration },
                )
            }
            RunEnd::Stopped { sent, elapsed } => {
                info!("Run stopped after {sent} records ({elapsed:.2}s)");
                (
                    RunOutcome::Stopped,
                    sent,
                    elapsed,
                    None,
                    ProgressEvent::Stopped { sent, elapsed },
                )
            }
            RunEnd::Failed {
                sent,
                elapsed,
                reason,
            } => {
                error!("Run failed after {sent} records: {reason}");
                (
                    RunOutcome::Failed,
                    sent,
                    elapsed,
                    Some(reason.clone()),
                    ProgressEvent::Failed { reason },
                )
            }
        };

        ctx.last_run = Some(RunSummary {
            outcome,
            config: self.config,
            records_sent: sent,
            duration_seconds: duration,
            reason,
        });
        ctx.state = RunState::idle();
        ctx.cancel = None;
        ctx.task = None;
        self.broadcaster.publish(event);
    }
}
