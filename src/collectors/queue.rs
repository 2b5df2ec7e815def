//! Bounded FIFO between an observer and its consumer. Pushing never waits:
//! a full queue drops the newest event and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub struct EventSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

// Manual impl: T need not be Clone
impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

pub type EventReceiver<T> = mpsc::Receiver<T>;

/// Read-only view of a queue's drop counter, independent of the event type
#[derive(Debug, Clone)]
pub struct DropCounter {
    name: &'static str,
    dropped: Arc<AtomicU64>,
}

impl DropCounter {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a queue holding at most `capacity` undelivered events
pub fn event_queue<T>(name: &'static str, capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            name,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl<T> EventSender<T> {
    /// Returns false when the event was dropped
    pub fn push(&self, event: T) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(queue = self.name, dropped_total = total, "event queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(queue = self.name, dropped_total = total, "event queue closed, dropping event");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn drop_counter(&self) -> DropCounter {
        DropCounter {
            name: self.name,
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}
