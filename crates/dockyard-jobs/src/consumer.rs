//! Adapts [`execute_job_run`] to the [`dockyard_queue::Consumer`] interface
//! so the same function drives both inline and queued dispatch. Registered
//! against every queue that can carry a job-run payload (ingest, build,
//! launch, workflow).

use std::sync::Arc;

use async_trait::async_trait;
use dockyard_events::EventBus;
use dockyard_persistence::Store;
use dockyard_queue::queue::Consumer;
use dockyard_types::DockyardError;
use serde_json::Value;
use uuid::Uuid;

use crate::handler::JobHandlerRegistry;
use crate::runtime::execute_job_run;

pub struct JobRunConsumer {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    registry: Arc<JobHandlerRegistry>,
}

impl JobRunConsumer {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, registry: Arc<JobHandlerRegistry>) -> Self {
        Self { store, events, registry }
    }
}

#[async_trait]
impl Consumer for JobRunConsumer {
    async fn consume(&self, _message_id: Uuid, payload: Value) -> Result<(), DockyardError> {
        let job_run_id: Uuid = payload
            .get("jobRunId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| DockyardError::validation("message payload missing jobRunId"))?;

        execute_job_run(&self.store, &self.events, &self.registry, job_run_id)
            .await
            .map_err(|err| {
                let kind = (&err).into();
                DockyardError::new(kind, err.to_string())
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_persistence::model::{JobDefinition, JobRun, JobRunStatus, RunTrigger};
    use dockyard_persistence::InMemoryStore;
    use dockyard_types::reliability::RetryPolicy;
    use serde_json::json;

    async fn seed(store: &Arc<dyn Store>) -> Uuid {
        let now = chrono::Utc::now();
        let definition = store
            .create_job_definition(JobDefinition {
                id: Uuid::now_v7(),
                slug: "test.echo".to_string(),
                version: 1,
                entry_point: "echo".to_string(),
                default_parameters: json!({}),
                parameters_schema: None,
                timeout: std::time::Duration::from_secs(5),
                retry_policy: RetryPolicy::exponential(),
                metadata: json!({}),
                created_at: now,
            })
            .await
            .unwrap();
        let run = store
            .create_job_run(JobRun {
                id: Uuid::now_v7(),
                job_definition_id: definition.id,
                status: JobRunStatus::Pending,
                parameters: json!({}),
                result: None,
                metrics: Value::Null,
                error_message: None,
                error_kind: None,
                attempt: 0,
                max_attempts: definition.retry_policy.max_attempts,
                triggered_by: RunTrigger::Manual,
                workflow_run_step_id: None,
                trace_context: None,
                scheduled_at: now,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        run.id
    }

    #[tokio::test]
    async fn consume_rejects_a_payload_missing_job_run_id() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let consumer = JobRunConsumer::new(store, events, Arc::new(JobHandlerRegistry::new()));

        let err = consumer.consume(Uuid::now_v7(), json!({})).await.unwrap_err();
        assert_eq!(err.kind, dockyard_types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn consume_drives_the_run_through_execute_job_run() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let job_run_id = seed(&store).await;

        let mut registry = JobHandlerRegistry::new();
        registry.register(
            "echo",
            Arc::new(|_ctx: &crate::context::JobRunContext, params: Value| async move { Ok(params) }),
        );
        let consumer = JobRunConsumer::new(store.clone(), events, Arc::new(registry));

        consumer
            .consume(Uuid::now_v7(), json!({ "jobRunId": job_run_id }))
            .await
            .unwrap();

        let run = store.get_job_run(job_run_id).await.unwrap();
        assert_eq!(run.status, JobRunStatus::Succeeded);
    }
}
