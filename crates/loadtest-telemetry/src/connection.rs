//! Lifecycle of the producer, consumer and admin sessions.
//!
//! The manager is the only writer of [`RoleStates`]. Every role moves along
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Disconnecting ──► Disconnected
//!                      │                              ▲
//!                      └──────── (attempt failed) ────┘
//! ```
//!
//! `connect()` retries with exponential backoff up to the configured attempt
//! budget. `disconnect()` is best-effort per session and always ends in
//! `Disconnected`.

use crate::broker::{BrokerConnector, BrokerRole, MessageSource, OffsetReader, RecordPublisher};
use crate::codec::Codec;
use crate::config::RetryPolicy;
use crate::error::{ConnectionError, SchemaLookupError};
use crate::inspect::{InspectionPipeline, Inspector, DEFAULT_INSPECT_BUFFER};
use crate::record::RecordKind;
use crate::store::PersistenceStore;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest interval the store probe will run at.
pub const MIN_STORE_PROBE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Connection state of each broker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoleStates {
    pub producer: ConnectionState,
    pub consumer: ConnectionState,
    pub admin: ConnectionState,
}

impl RoleStates {
    pub fn get(&self, role: BrokerRole) -> ConnectionState {
        match role {
            BrokerRole::Producer => self.producer,
            BrokerRole::Consumer => self.consumer,
            BrokerRole::Admin => self.admin,
        }
    }

    fn slot(&mut self, role: BrokerRole) -> &mut ConnectionState {
        match role {
            BrokerRole::Producer => &mut self.producer,
            BrokerRole::Consumer => &mut self.consumer,
            BrokerRole::Admin => &mut self.admin,
        }
    }

    pub fn all(&self, state: ConnectionState) -> bool {
        BrokerRole::ALL.iter().all(|role| self.get(*role) == state)
    }
}

impl Default for RoleStates {
    fn default() -> Self {
        Self {
            producer: ConnectionState::Disconnected,
            consumer: ConnectionState::Disconnected,
            admin: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionError {
    /// Whether another connect attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::Schema(SchemaLookupError::Registry { .. }) => true,
            ConnectionError::Schema(_) => false,
            _ => true,
        }
    }
}

#[derive(Default)]
struct Sessions {
    producer: Option<Arc<dyn RecordPublisher>>,
    admin: Option<Arc<dyn OffsetReader>>,
    consumer: Option<InspectionPipeline>,
}

/// Handles readable without waiting on an in-flight connect.
#[derive(Default, Clone)]
struct LiveHandles {
    producer: Option<Arc<dyn RecordPublisher>>,
    admin: Option<Arc<dyn OffsetReader>>,
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    codec: Arc<Codec>,
    inspector: Arc<Inspector>,
    retry: RetryPolicy,
    inspect_buffer: usize,
    sessions: Mutex<Sessions>,
    live: RwLock<LiveHandles>,
    states: watch::Sender<RoleStates>,
    store_healthy: Arc<AtomicBool>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, codec: Arc<Codec>, retry: RetryPolicy) -> Self {
        let (states, _) = watch::channel(RoleStates::default());
        Self {
            connector,
            codec,
            inspector: Arc::new(Inspector::default()),
            retry,
            inspect_buffer: DEFAULT_INSPECT_BUFFER,
            sessions: Mutex::new(Sessions::default()),
            live: RwLock::new(LiveHandles::default()),
            states,
            store_healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the consumer-side inspector and its channel capacity.
    pub fn with_inspector(mut self, inspector: Arc<Inspector>, buffer: usize) -> Self {
        self.inspector = inspector;
        self.inspect_buffer = buffer;
        self
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn inspector(&self) -> &Arc<Inspector> {
        &self.inspector
    }

    pub fn states(&self) -> RoleStates {
        *self.states.borrow()
    }

    pub fn state(&self, role: BrokerRole) -> ConnectionState {
        self.states.borrow().get(role)
    }

    pub fn subscribe_states(&self) -> watch::Receiver<RoleStates> {
        self.states.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.states().all(ConnectionState::Connected)
    }

    pub fn store_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::Relaxed)
    }

    /// The live producer session.
    pub fn producer(&self) -> Result<Arc<dyn RecordPublisher>, ConnectionError> {
        self.read_live()
            .producer
            .ok_or(ConnectionError::NotConnected(BrokerRole::Producer))
    }

    /// The live admin session.
    pub fn admin(&self) -> Result<Arc<dyn OffsetReader>, ConnectionError> {
        self.read_live()
            .admin
            .ok_or(ConnectionError::NotConnected(BrokerRole::Admin))
    }

    fn read_live(&self) -> LiveHandles {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_live(&self, handles: LiveHandles) {
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = handles;
    }

    fn transition(&self, roles: &[BrokerRole], next: ConnectionState) {
        self.states.send_modify(|states| {
            for role in roles {
                let slot = states.slot(*role);
                if *slot == next {
                    continue;
                }
                if slot.can_transition_to(next) {
                    debug!("{role} session: {:?} -> {:?}", *slot, next);
                    *slot = next;
                } else {
                    warn!("Ignoring {role} transition {:?} -> {:?}", *slot, next);
                }
            }
        });
    }

    /// Open all sessions, retrying with backoff until the attempt budget is spent.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut sessions = self.sessions.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.transition(&BrokerRole::ALL, ConnectionState::Connecting);
            info!("Connecting to broker (attempt {attempt}/{})", self.retry.max_attempts);

            let err = match self.open_all().await {
                Ok(opened) => {
                    self.commit(&mut sessions, opened);
                    info!("Connected to broker");
                    return Ok(());
                }
                Err((err, partial)) => {
                    *sessions = partial;
                    self.teardown(&mut sessions).await;
                    err
                }
            };

            if !err.is_retryable() {
                error!("Connect failed permanently: {err}");
                return Err(err);
            }
            if attempt >= self.retry.max_attempts {
                error!("Broker unavailable after {attempt} attempts: {err}");
                return Err(ConnectionError::BrokerUnavailable {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.retry.delay_after(attempt);
            warn!("Connect attempt {attempt} failed: {err}. Retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    /// Open every session and resolve schema bindings. On failure, returns
    /// whatever was opened so it can be torn down.
    async fn open_all(&self) -> Result<OpenedSessions, (ConnectionError, Sessions)> {
        let mut partial = Sessions::default();

        // A new connection epoch starts with no bindings.
        self.codec.invalidate();

        let producer = match self.connector.open_producer().await {
            Ok(producer) => producer,
            Err(e) => return Err((e, partial)),
        };
        partial.producer = Some(Arc::clone(&producer));

        let admin = match self.connector.open_admin().await {
            Ok(admin) => admin,
            Err(e) => return Err((e, partial)),
        };
        partial.admin = Some(Arc::clone(&admin));

        let topics = self.codec.topics().all();
        let mut consumer = match self.connector.open_consumer(&topics).await {
            Ok(consumer) => consumer,
            Err(e) => return Err((e, partial)),
        };

        for kind in RecordKind::ALL {
            if let Err(e) = self.codec.resolve_binding(kind).await {
                close_source(consumer.as_mut()).await;
                return Err((ConnectionError::Schema(e), partial));
            }
        }

        Ok(OpenedSessions {
            producer,
            admin,
            consumer,
        })
    }

    fn commit(&self, sessions: &mut Sessions, opened: OpenedSessions) {
        let pipeline = InspectionPipeline::spawn(
            opened.consumer,
            Arc::clone(&self.codec),
            Arc::clone(&self.inspector),
            self.inspect_buffer,
        );

        sessions.producer = Some(Arc::clone(&opened.producer));
        sessions.admin = Some(Arc::clone(&opened.admin));
        sessions.consumer = Some(pipeline);

        self.write_live(LiveHandles {
            producer: Some(opened.producer),
            admin: Some(opened.admin),
        });
        self.transition(&BrokerRole::ALL, ConnectionState::Connected);
    }

    /// Tear down all sessions. Safe to call in any state; never fails.
    pub async fn disconnect(&self) {
        let mut sessions = self.sessions.lock().await;
        self.teardown(&mut sessions).await;
        info!("Disconnected from broker");
    }

    async fn teardown(&self, sessions: &mut Sessions) {
        if self.states().all(ConnectionState::Disconnected) && sessions.is_empty() {
            return;
        }

        self.transition(&BrokerRole::ALL, ConnectionState::Disconnecting);
        self.write_live(LiveHandles::default());

        if let Some(pipeline) = sessions.consumer.take() {
            if let Some(mut source) = pipeline.shutdown().await {
                close_source(source.as_mut()).await;
            }
        }
        self.transition(&[BrokerRole::Consumer], ConnectionState::Disconnected);

        if let Some(producer) = sessions.producer.take() {
            if let Err(e) = producer.close().await {
                warn!("Producer teardown failed: {e}");
            }
        }
        self.transition(&[BrokerRole::Producer], ConnectionState::Disconnected);

        if let Some(admin) = sessions.admin.take() {
            if let Err(e) = admin.close().await {
                warn!("Admin teardown failed: {e}");
            }
        }
        self.transition(&[BrokerRole::Admin], ConnectionState::Disconnected);

        self.codec.invalidate();
    }

    /// Periodically ping the persistence store and record whether it answered.
    pub fn spawn_store_probe(
        &self,
        store: Arc<dyn PersistenceStore>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let healthy = Arc::clone(&self.store_healthy);
        if every < MIN_STORE_PROBE_INTERVAL {
            warn!(
                "Store probe interval {every:?} is below {MIN_STORE_PROBE_INTERVAL:?}, using the minimum"
            );
        }
        let every = every.max(MIN_STORE_PROBE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now_healthy = match store.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Store probe failed: {e}");
                        false
                    }
                };
                let was_healthy = healthy.swap(now_healthy, Ordering::Relaxed);
                if was_healthy != now_healthy {
                    if now_healthy {
                        info!("Persistence store is reachable");
                    } else {
                        warn!("Persistence store is unreachable");
                    }
                }
            }
        })
    }
}

struct OpenedSessions {
    producer: Arc<dyn RecordPublisher>,
    admin: Arc<dyn OffsetReader>,
    consumer: Box<dyn MessageSource>,
}

impl Sessions {
    fn is_empty(&self) -> bool {
        self.producer.is_none() && self.admin.is_none() && self.consumer.is_none()
    }
}

async fn close_source(source: &mut dyn MessageSource) {
    if let Err(e) = source.close().await {
        warn!("Consumer teardown failed: {e}");
    }
}
