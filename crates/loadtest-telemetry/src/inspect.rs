//! Consumer-side inspection of what lands on the record topics.
//!
//! A receive task moves messages from the consumer session into a bounded
//! channel; a processing task decodes them and keeps the most recent ones.
//! When the processing task falls behind, the receive task waits on the full
//! channel instead of buffering without bound.

use crate::broker::{InboundMessage, MessageSource};
use crate::codec::Codec;
use crate::record::Record;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_INSPECT_BUFFER: usize = 1024;
pub const DEFAULT_RECENT_LIMIT: usize = 50;

const RECV_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeStats {
    pub received: u64,
    pub decode_errors: u64,
}

/// Decoded view of consumed messages.
pub struct Inspector {
    recent: Mutex<VecDeque<InspectedMessage>>,
    limit: usize,
    received: AtomicU64,
    decode_errors: AtomicU64,
}

impl Inspector {
    pub fn new(limit: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(limit)),
            limit,
            received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// Most recent decoded messages, oldest first.
    pub fn recent(&self) -> Vec<InspectedMessage> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ConsumeStats {
        ConsumeStats {
            received: self.received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    fn process(&self, codec: &Codec, message: InboundMessage) {
        self.received.fetch_add(1, Ordering::Relaxed);

        let record = match codec.decode(&message.payload) {
            Ok(record) => record,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Could not decode message {}/{}@{}: {e}",
                    message.topic, message.partition, message.offset
                );
                return;
            }
        };
        debug!(
            "Received {} record {} from {}/{}@{}",
            record.kind(),
            record.id(),
            message.topic,
            message.partition,
            message.offset
        );

        if self.limit == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == self.limit {
            recent.pop_front();
        }
        recent.push_back(InspectedMessage {
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
            record,
        });
    }
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_LIMIT)
    }
}

/// Running receive/process task pair.
pub struct InspectionPipeline {
    cancel: CancellationToken,
    receive: JoinHandle<Box<dyn MessageSource>>,
    process: JoinHandle<()>,
}

impl InspectionPipeline {
    pub fn spawn(
        source: Box<dyn MessageSource>,
        codec: Arc<Codec>,
        inspector: Arc<Inspector>,
        buffer: usize,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(buffer.max(1));

        let receive = tokio::spawn(receive_loop(source, tx, cancel.clone()));
        let process = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                inspector.process(&codec, message);
            }
        });

        Self {
            cancel,
            receive,
            process,
        }
    }

    /// Stop both tasks and hand back the consumer session for teardown.
    pub async fn shutdown(self) -> Option<Box<dyn MessageSource>> {
        self.cancel.cancel();
        let source = match self.receive.await {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("Consumer receive task ended abnormally: {e}");
                None
            }
        };
        if let Err(e) = self.process.await {
            warn!("Consumer processing task ended abnormally: {e}");
        }
        source
    }
}

async fn receive_loop(
    mut source: Box<dyn MessageSource>,
    tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) -> Box<dyn MessageSource> {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = source.recv() => received,
        };

        match received {
            Ok(Some(message)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Consumer receive failed: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECV_ERROR_PAUSE) => {}
                }
            }
        }
    }
    source
}
