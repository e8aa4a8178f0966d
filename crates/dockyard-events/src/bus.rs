//! In-process event bus: one `tokio::sync::broadcast` channel per event
//! type name, giving synchronous fan-out with FIFO delivery within a type
//! and no ordering guarantee across types. Grounded in `durable::worker::pool`'s
//! use of a `watch` channel for shutdown signaling, generalized from a
//! single-slot broadcast to a keyed multi-channel registry since the bus
//! needs many independent topics rather than one.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::event::DomainEvent;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    channels: DashMap<&'static str, broadcast::Sender<DomainEvent>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn sender_for(&self, type_name: &'static str) -> broadcast::Sender<DomainEvent> {
        self.channels
            .entry(type_name)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event to every current subscriber of its type. A type
    /// with no subscribers yet simply drops the send (no channel is
    /// allocated on the no-subscriber path).
    pub fn publish(&self, event: DomainEvent) {
        let type_name = event.type_name();
        if let Some(sender) = self.channels.get(type_name) {
            let subscriber_count = sender.receiver_count();
            trace!(event_type = type_name, subscriber_count, "publishing event");
            let _ = sender.send(event);
        }
    }

    /// Subscribe to a single event type by name.
    pub fn subscribe(&self, type_name: &'static str) -> broadcast::Receiver<DomainEvent> {
        self.sender_for(type_name).subscribe()
    }

    /// Subscribe to every event type this bus has ever seen, plus any
    /// registered afterward would require a fresh call. Used by the
    /// telemetry registry and the materializer, which both want the full
    /// stream rather than one topic at a time.
    pub fn subscribe_all(&self, type_names: &[&'static str]) -> Vec<broadcast::Receiver<DomainEvent>> {
        type_names.iter().map(|name| self.subscribe(name)).collect()
    }
}
