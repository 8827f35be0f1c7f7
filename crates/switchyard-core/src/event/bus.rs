//! Broadcast event bus for distributing `OrchestrationEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing never blocks the scheduler:
//! with no subscribers the event is dropped, and slow subscribers observe
//! `Lagged` rather than applying backpressure.

use switchyard_types::event::OrchestrationEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run, stage and node events.
///
/// Cloning the bus clones the sender, so every component holding a clone
/// publishes onto the same channel.
pub struct EventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: OrchestrationEvent) {
        tracing::trace!(event = event.name(), "publishing event");
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
