//! Event bus for synchronization signals
//!
//! Fan-out of feed batches and lifecycle transitions to any number of
//! subscribers over a bounded broadcast channel. Slow subscribers lag and
//! skip events instead of stalling the fetchers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::changes::ChangeRecord;

/// Event types that flow through the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Every record of one decoded batch, before filtering
    PackagesFetched { records: Arc<[ChangeRecord]> },
    /// The relevant subset of a batch; never empty
    RelevantPackagesFetched { records: Arc<[ChangeRecord]> },
    /// Catch-up finished at `sequence`; published once per run
    Synchronized { sequence: u64 },
}

impl SyncEvent {
    /// Stable name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PackagesFetched { .. } => "packages-fetched",
            Self::RelevantPackagesFetched { .. } => "relevant-packages-fetched",
            Self::Synchronized { .. } => "synchronized",
        }
    }
}

/// Event bus for distributing events to subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Create a new event bus with specified queue capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Get the queue capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event to all subscribers. Returns how many received it;
    /// publishing with no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
