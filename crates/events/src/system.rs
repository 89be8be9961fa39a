//! System-wide event bus.
//!
//! Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Components
//! subscribe to receive all system events and filter for what they care
//! about.

use std::sync::Arc;
use tokio::sync::broadcast;

use agentmesh_core::event::SystemEvent;

/// Broadcast-based bus for canonical system events.
pub struct SystemEventBus {
    sender: broadcast::Sender<Arc<SystemEvent>>,
}

impl SystemEventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: SystemEvent) {
        // No subscribers is fine; the event is simply dropped.
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SystemEvent>> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SystemEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
