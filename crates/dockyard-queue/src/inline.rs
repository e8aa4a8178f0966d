//! Inline mode: `enqueue` runs the registered consumer synchronously in the
//! caller's task before returning (spec §4.B, P8). Grounded in
//! `durable::activity::context` — the handler still gets a uniform
//! `Consumer` call, just invoked directly instead of via a worker poll loop.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dockyard_events::{DomainEvent, EventBus};
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::queue::{Consumer, Queue, QueueError, QueueMode, QueueName};

pub struct InlineQueue {
    consumers: DashMap<&'static str, Arc<dyn Consumer>>,
    events: Arc<EventBus>,
}

impl InlineQueue {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            consumers: DashMap::new(),
            events,
        }
    }
}

#[async_trait]
impl Queue for InlineQueue {
    fn mode(&self) -> QueueMode {
        QueueMode::Inline
    }

    #[instrument(skip(self, payload), fields(queue = queue.as_str()))]
    async fn enqueue(&self, queue: QueueName, payload: Value) -> Result<Uuid, QueueError> {
        let message_id = Uuid::now_v7();
        let consumer = self
            .consumers
            .get(queue.as_str())
            .map(|e| e.clone())
            .ok_or(QueueError::NoConsumer(queue.as_str()))?;

        self.events.publish(DomainEvent::QueueTaskEnqueued {
            queue: queue.as_str().to_string(),
            task_id: message_id,
            occurred_at: chrono::Utc::now(),
        });

        match consumer.consume(message_id, payload).await {
            Ok(()) => Ok(message_id),
            Err(err) => {
                warn!(queue = queue.as_str(), %err, "inline consumer failed");
                Err(QueueError::ConsumerFailed(err))
            }
        }
    }

    fn register_consumer(&self, queue: QueueName, consumer: Arc<dyn Consumer>) {
        self.consumers.insert(queue.as_str(), consumer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoConsumer;

    #[async_trait]
    impl Consumer for EchoConsumer {
        async fn consume(&self, _message_id: Uuid, _payload: Value) -> Result<(), dockyard_types::DockyardError> {
            Ok(())
        }
    }

    struct FailingConsumer;

    #[async_trait]
    impl Consumer for FailingConsumer {
        async fn consume(&self, _message_id: Uuid, _payload: Value) -> Result<(), dockyard_types::DockyardError> {
            Err(dockyard_types::DockyardError::fatal("boom"))
        }
    }

    #[tokio::test]
    async fn enqueue_without_a_registered_consumer_fails_fast() {
        let queue = InlineQueue::new(Arc::new(EventBus::default()));
        let err = queue.enqueue(QueueName::Workflow, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::NoConsumer("workflow")));
    }

    #[tokio::test]
    async fn enqueue_runs_the_registered_consumer_synchronously() {
        let queue = InlineQueue::new(Arc::new(EventBus::default()));
        queue.register_consumer(QueueName::Workflow, Arc::new(EchoConsumer));
        let id = queue.enqueue(QueueName::Workflow, serde_json::json!({"a": 1})).await.unwrap();
        assert_ne!(id, Uuid::nil());
    }

    #[tokio::test]
    async fn enqueue_propagates_a_failing_consumer_as_consumer_failed() {
        let queue = InlineQueue::new(Arc::new(EventBus::default()));
        queue.register_consumer(QueueName::Workflow, Arc::new(FailingConsumer));
        let err = queue.enqueue(QueueName::Workflow, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::ConsumerFailed(_)));
    }

    #[tokio::test]
    async fn enqueue_publishes_a_queue_task_enqueued_event() {
        let events = Arc::new(EventBus::default());
        let mut enqueued = events.subscribe("queue_task_enqueued");
        let queue = InlineQueue::new(events);
        queue.register_consumer(QueueName::Workflow, Arc::new(EchoConsumer));

        queue.enqueue(QueueName::Workflow, serde_json::json!({})).await.unwrap();

        let event = enqueued.recv().await.unwrap();
        match event {
            DomainEvent::QueueTaskEnqueued { queue, .. } => assert_eq!(queue, "workflow"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
