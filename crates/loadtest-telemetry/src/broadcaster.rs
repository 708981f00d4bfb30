//! Fan-out of progress events to any number of observers.
//!
//! Each observer owns a bounded channel. `publish` never waits: an observer
//! whose channel is closed or full is dropped from the set, and the others
//! still receive the event.

use crate::events::ProgressEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Per-observer buffer used by [`ProgressBroadcaster::default`].
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

pub type ObserverId = u64;

/// A live subscription.
#[derive(Debug)]
pub struct Observer {
    id: ObserverId,
    rx: mpsc::Receiver<ProgressEvent>,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next event, or `None` once the observer has been removed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<ProgressEvent> {
        self.rx
    }
}

pub struct ProgressBroadcaster {
    observers: Mutex<HashMap<ObserverId, mpsc::Sender<ProgressEvent>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl ProgressBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().insert(id, tx);
        tracing::debug!("Observer {id} subscribed");
        Observer { id, rx }
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            tracing::debug!("Observer {id} unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every registered observer; returns how many got it.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let mut observers = self.lock();
        let mut failed = Vec::new();

        for (id, tx) in observers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Observer {id} is not keeping up, dropping it");
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => failed.push(*id),
            }
        }

        for id in &failed {
            observers.remove(id);
        }
        observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ObserverId, mpsc::Sender<ProgressEvent>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}
