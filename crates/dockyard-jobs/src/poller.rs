//! Background loop that re-dispatches job runs whose retry delay has
//! elapsed (spec §4.C step 7: `scheduled_at = now + delay(attempt)`).
//!
//! Grounded in `durable::worker::poller::TaskPoller`'s adaptive backoff:
//! poll faster while runs are due, back off geometrically while idle, reset
//! on the next find. A job run only ever re-enters `due_job_runs` by way of
//! `Store::fail_job_run`'s retry branch, so this loop is the sole source of
//! re-enqueues for retried runs — the original enqueue from `dockyard-queue`
//! only ever dispatches attempt 1.

use std::sync::Arc;
use std::time::Duration;

use dockyard_persistence::store::Store;
use dockyard_queue::queue::{Queue, QueueName};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct DueRunPollerConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub batch_size: u32,
    pub queue: QueueName,
}

impl Default for DueRunPollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            batch_size: 20,
            queue: QueueName::Workflow,
        }
    }
}

/// Polls `Store::due_job_runs` and re-enqueues each one. Run as a single
/// `tokio::spawn`ed task per process; stopped via the shared `shutdown_rx`.
pub async fn run_due_run_poller(
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    config: DueRunPollerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.min_interval;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match store.due_job_runs(chrono::Utc::now(), config.batch_size).await {
            Ok(runs) if runs.is_empty() => {
                interval = Duration::from_secs_f64(
                    (interval.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_interval.as_secs_f64()),
                );
            }
            Ok(runs) => {
                debug!(count = runs.len(), "re-enqueuing due job runs");
                for run in runs {
                    if let Err(err) = queue
                        .enqueue(config.queue, json!({ "jobRunId": run.id }))
                        .await
                    {
                        error!(job_run_id = %run.id, %err, "failed to re-enqueue due job run");
                    }
                }
                interval = config.min_interval;
            }
            Err(err) => {
                error!(%err, "failed to poll due job runs");
                interval = Duration::from_secs_f64(
                    (interval.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_interval.as_secs_f64()),
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dockyard_events::EventBus;
    use dockyard_persistence::model::{JobDefinition, JobRun, JobRunStatus, RunTrigger};
    use dockyard_persistence::InMemoryStore;
    use dockyard_queue::inline::InlineQueue;
    use dockyard_queue::queue::Consumer;
    use dockyard_types::reliability::RetryPolicy;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConsumer(Arc<AtomicUsize>);

    #[async_trait]
    impl Consumer for CountingConsumer {
        async fn consume(&self, _message_id: uuid::Uuid, _payload: Value) -> Result<(), dockyard_types::DockyardError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn poller_re_enqueues_a_due_run_and_stops_on_shutdown() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let queue: Arc<dyn Queue> = Arc::new(InlineQueue::new(events));
        let consumed = Arc::new(AtomicUsize::new(0));
        queue.register_consumer(QueueName::Workflow, Arc::new(CountingConsumer(consumed.clone())));

        let now = chrono::Utc::now();
        let definition = store
            .create_job_definition(JobDefinition {
                id: uuid::Uuid::now_v7(),
                slug: "test.due".to_string(),
                version: 1,
                entry_point: "due".to_string(),
                default_parameters: json!({}),
                parameters_schema: None,
                timeout: Duration::from_secs(5),
                retry_policy: RetryPolicy::exponential(),
                metadata: json!({}),
                created_at: now,
            })
            .await
            .unwrap();
        store
            .create_job_run(JobRun {
                id: uuid::Uuid::now_v7(),
                job_definition_id: definition.id,
                status: JobRunStatus::Pending,
                parameters: json!({}),
                result: None,
                metrics: Value::Null,
                error_message: None,
                error_kind: None,
                attempt: 1,
                max_attempts: 3,
                triggered_by: RunTrigger::Manual,
                workflow_run_step_id: None,
                trace_context: None,
                scheduled_at: now - chrono::Duration::seconds(5),
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = DueRunPollerConfig {
            min_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            backoff_multiplier: 1.5,
            batch_size: 10,
            queue: QueueName::Workflow,
        };
        let handle = tokio::spawn(run_due_run_poller(store, queue, config, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(consumed.load(Ordering::SeqCst) >= 1);
    }
}

