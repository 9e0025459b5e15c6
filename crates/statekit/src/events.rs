//! Store lifecycle event bus.
//!
//! A lightweight publish/subscribe mechanism built on top of
//! [`tokio::sync::broadcast`]. Events are wrapped in [`Arc`] so that
//! broadcasting to multiple subscribers does not clone the payload.
//! Subscribers that fall behind by more than the channel capacity observe a
//! `Lagged` error rather than blocking the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A lifecycle event emitted by a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreEvent {
    /// The store finished initializing and is ready for data operations.
    Initialized { name: String },

    /// One or more keys changed through `set` or `update`.
    Updated {
        keys: Vec<String>,
        changed_paths: Vec<String>,
    },

    /// A key was deleted.
    Deleted { key: String },

    /// The whole tree was cleared.
    Cleared,

    /// A peer's state was applied through the sync channel.
    SyncApplied { keys: Vec<String> },

    /// The store was destroyed; no further events follow.
    Destroyed { name: String },
}

/// Broadcast bus for [`StoreEvent`]s.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<StoreEvent>>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe it. No active
    /// subscribers is not an error.
    pub fn publish(&self, event: StoreEvent) -> usize {
        match self.sender.send(Arc::new(event)) {
            Ok(receivers) => {
                tracing::trace!(receivers, "store event published");
                receivers
            }
            Err(_) => 0,
        }
    }

    /// Create a subscriber receiving all future events. Events published
    /// before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StoreEvent>> {
        self.sender.subscribe()
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ── tests ────────────────────────────────────────────────────────────
