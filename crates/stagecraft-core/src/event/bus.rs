//! Broadcast event bus for distributing `ProgressEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing never blocks: with no
//! subscribers the event is dropped, and a subscriber that falls behind
//! loses the oldest events (`RecvError::Lagged`).

use stagecraft_types::event::ProgressEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run progress.
///
/// Cloning the bus clones the sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: ProgressEvent) {
        tracing::debug!(run_id = %event.run_id(), kind = event.kind(), "progress event");
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
