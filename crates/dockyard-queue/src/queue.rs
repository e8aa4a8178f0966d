//! The `Queue` trait: one enqueue API, two backends, switched by a
//! process-wide mode flag (spec §4.B, §9 Design Note "Inline vs queued
//! mode"). Grounded in `durable::worker::pool::WorkerPool`'s separation of
//! "submit work" from "a pool of consumers drains it", generalized here so
//! the submit side can be either a direct call or a Redis list push.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Ingest,
    Build,
    Launch,
    Workflow,
    Event,
    EventTrigger,
    ExampleBundle,
    AssetExpiry,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Ingest => "ingest",
            QueueName::Build => "build",
            QueueName::Launch => "launch",
            QueueName::Workflow => "workflow",
            QueueName::Event => "event",
            QueueName::EventTrigger => "event-trigger",
            QueueName::ExampleBundle => "example-bundle",
            QueueName::AssetExpiry => "asset-expiry",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no consumer registered for queue {0}")]
    NoConsumer(&'static str),
    #[error("consumer failed: {0}")]
    ConsumerFailed(#[from] dockyard_types::DockyardError),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Invoked once per delivered message. Consumers own idempotency: a message
/// MAY be delivered more than once (spec §5 "Queue delivery is
/// at-least-once").
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, message_id: Uuid, payload: Value) -> Result<(), dockyard_types::DockyardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Inline,
    Queued,
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn mode(&self) -> QueueMode;

    /// Materialize a message on `queue` and either run it to completion
    /// (inline mode) or hand it to the external message store (queued
    /// mode). Returns the message id assigned to it.
    async fn enqueue(&self, queue: QueueName, payload: Value) -> Result<Uuid, QueueError>;

    fn register_consumer(&self, queue: QueueName, consumer: Arc<dyn Consumer>);
}
