//! Queued mode: messages are pushed to a Redis list per queue name and
//! drained by a fixed pool of worker tasks per queue. Grounded in
//! `durable::worker::pool::WorkerPool` (`shutdown_tx`/`watch` channel,
//! `Semaphore`-bounded concurrency, background poll loop spawned with
//! `tokio::spawn` + `tokio::select!` against shutdown) with the poll source
//! swapped from a SQL claim query to a Redis `BLPOP`. The `redis` crate
//! itself is net-new to this workspace (the teacher has no distributed
//! queue); it is the same crate and feature set
//! (`tokio-comp`, `connection-manager`) used for this purpose elsewhere in
//! the example pack.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dockyard_events::{DomainEvent, EventBus};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::queue::{Consumer, Queue, QueueError, QueueMode, QueueName};

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    id: Uuid,
    payload: Value,
    attempt: u32,
}

fn list_key(queue: QueueName) -> String {
    format!("dockyard:queue:{}", queue.as_str())
}

pub struct RedisQueueConfig {
    pub concurrency: HashMap<&'static str, usize>,
    pub max_delivery_attempts: u32,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: HashMap::new(),
            max_delivery_attempts: 5,
        }
    }
}

pub struct RedisQueue {
    conn: ConnectionManager,
    consumers: DashMap<&'static str, Arc<dyn Consumer>>,
    events: Arc<EventBus>,
    config: RedisQueueConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RedisQueue {
    pub async fn connect(
        redis_url: &str,
        events: Arc<EventBus>,
        config: RedisQueueConfig,
    ) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            conn,
            consumers: DashMap::new(),
            events,
            config,
            shutdown_tx,
            shutdown_rx,
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the configured number of worker tasks per queue that has both
    /// a registered consumer and a concurrency entry. Must be called after
    /// all consumers are registered (spec §4.B contract (c): "mode changes
    /// disconnect and rebuild queues").
    pub fn start_workers(self: &Arc<Self>) {
        for entry in self.consumers.iter() {
            let queue_str = *entry.key();
            let concurrency = *self.config.concurrency.get(queue_str).unwrap_or(&1);
            for worker_index in 0..concurrency {
                let this = Arc::clone(self);
                let mut shutdown_rx = self.shutdown_rx.clone();
                let handle = tokio::spawn(async move {
                    info!(queue = queue_str, worker_index, "redis worker starting");
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                            result = this.poll_once(queue_str) => {
                                if let Err(err) = result {
                                    warn!(queue = queue_str, %err, "redis poll failed");
                                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                                }
                            }
                        }
                    }
                });
                self.workers.lock().push(handle);
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn poll_once(&self, queue_str: &'static str) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn.blpop(list_key_str(queue_str), 2.0).await?;
        let Some((_, raw)) = popped else {
            return Ok(());
        };
        let message: WireMessage = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(err) => {
                warn!(queue = queue_str, %err, "dropping undeserializable message");
                return Ok(());
            }
        };

        let consumer = self.consumers.get(queue_str).map(|e| e.clone());
        let Some(consumer) = consumer else {
            warn!(queue = queue_str, "no consumer registered, requeuing");
            let _: i64 = conn.rpush(list_key_str(queue_str), raw).await?;
            return Ok(());
        };

        match consumer.consume(message.id, message.payload.clone()).await {
            Ok(()) => {}
            Err(err) if err.is_retryable() && message.attempt + 1 < self.config.max_delivery_attempts => {
                let retry = WireMessage {
                    id: message.id,
                    payload: message.payload,
                    attempt: message.attempt + 1,
                };
                let encoded = serde_json::to_string(&retry).unwrap_or_default();
                let _: i64 = conn.rpush(list_key_str(queue_str), encoded).await?;
            }
            Err(err) => {
                warn!(queue = queue_str, message_id = %message.id, %err, "message delivery exhausted");
            }
        }
        Ok(())
    }
}

fn list_key_str(queue_str: &str) -> String {
    format!("dockyard:queue:{queue_str}")
}

#[async_trait]
impl Queue for RedisQueue {
    fn mode(&self) -> QueueMode {
        QueueMode::Queued
    }

    #[instrument(skip(self, payload), fields(queue = queue.as_str()))]
    async fn enqueue(&self, queue: QueueName, payload: Value) -> Result<Uuid, QueueError> {
        let message = WireMessage {
            id: Uuid::now_v7(),
            payload,
            attempt: 0,
        };
        let encoded =
            serde_json::to_string(&message).map_err(|e| QueueError::Transport(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .rpush(list_key(queue), encoded)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        self.events.publish(DomainEvent::QueueTaskEnqueued {
            queue: queue.as_str().to_string(),
            task_id: message.id,
            occurred_at: chrono::Utc::now(),
        });

        Ok(message.id)
    }

    fn register_consumer(&self, queue: QueueName, consumer: Arc<dyn Consumer>) {
        self.consumers.insert(queue.as_str(), consumer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_key_is_namespaced_per_queue() {
        assert_eq!(list_key(QueueName::Workflow), "dockyard:queue:workflow");
        assert_eq!(list_key(QueueName::EventTrigger), "dockyard:queue:event-trigger");
        assert_eq!(list_key_str("workflow"), list_key(QueueName::Workflow));
    }

    #[test]
    fn wire_message_round_trips_through_json() {
        let message = WireMessage {
            id: Uuid::now_v7(),
            payload: serde_json::json!({ "a": 1 }),
            attempt: 2,
        };
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.payload, message.payload);
        assert_eq!(decoded.attempt, 2);
    }

    #[test]
    fn default_config_caps_delivery_attempts_and_has_no_configured_concurrency() {
        let config = RedisQueueConfig::default();
        assert_eq!(config.max_delivery_attempts, 5);
        assert!(config.concurrency.is_empty());
    }
}
