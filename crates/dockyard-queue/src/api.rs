//! The enqueue API surface exposed to collaborators (spec §6.1). Every
//! function here materializes a durable row before calling
//! [`Queue::enqueue`], satisfying the contract that a caller can use the
//! returned id immediately even under queued mode.

use std::sync::Arc;

use chrono::Utc;
use dockyard_persistence::model::{JobRun, JobRunStatus, RunTrigger, WorkflowRun, WorkflowRunStatus};
use dockyard_persistence::{PersistenceError, Store};
use dockyard_types::DockyardError;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::queue::{Queue, QueueError, QueueName};

/// Reserved job-definition slugs for the external collaborators whose
/// actual execution (git clone + Dockerfile sniffing, Docker build/launch)
/// is out of scope here; the core only needs a durable `JobRun` to track
/// their lifecycle and a queue keyword to dispatch them.
pub mod system_job_slugs {
    pub const REPOSITORY_INGESTION: &str = "system.repository-ingestion";
    pub const BUILD: &str = "system.build";
    pub const LAUNCH_START: &str = "system.launch-start";
    pub const LAUNCH_STOP: &str = "system.launch-stop";
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueApiError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<&EnqueueApiError> for DockyardError {
    fn from(err: &EnqueueApiError) -> Self {
        match err {
            EnqueueApiError::Persistence(p) => {
                let kind: dockyard_types::ErrorKind = p.into();
                DockyardError::new(kind, p.to_string())
            }
            EnqueueApiError::Queue(q) => DockyardError::retriable_io(q.to_string()),
        }
    }
}

async fn create_system_job_run(
    store: &Arc<dyn Store>,
    slug: &str,
    parameters: Value,
) -> Result<JobRun, EnqueueApiError> {
    let definition = store.get_job_definition_by_slug(slug).await?;
    let now = Utc::now();
    let run = JobRun {
        id: Uuid::now_v7(),
        job_definition_id: definition.id,
        status: JobRunStatus::Pending,
        parameters,
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
    };
    Ok(store.create_job_run(run).await?)
}

/// `enqueueRepositoryIngestion(repoId, {jobRunId?, parameters?}) → JobRun`
pub async fn enqueue_repository_ingestion(
    store: &Arc<dyn Store>,
    queue: &Arc<dyn Queue>,
    repo_id: Uuid,
    parameters: Option<Value>,
) -> Result<JobRun, EnqueueApiError> {
    let params = parameters.unwrap_or_else(|| json!({ "repoId": repo_id }));
    let run = create_system_job_run(store, system_job_slugs::REPOSITORY_INGESTION, params).await?;
    queue
        .enqueue(QueueName::Ingest, json!({ "jobRunId": run.id, "repoId": repo_id }))
        .await?;
    Ok(run)
}

/// `enqueueBuildJob(buildId, repoId, {jobRunId?}) → JobRun`
pub async fn enqueue_build_job(
    store: &Arc<dyn Store>,
    queue: &Arc<dyn Queue>,
    build_id: Uuid,
    repo_id: Uuid,
) -> Result<JobRun, EnqueueApiError> {
    let params = json!({ "buildId": build_id, "repoId": repo_id });
    let run = create_system_job_run(store, system_job_slugs::BUILD, params).await?;
    queue
        .enqueue(
            QueueName::Build,
            json!({ "jobRunId": run.id, "buildId": build_id, "repoId": repo_id }),
        )
        .await?;
    Ok(run)
}

/// `enqueueLaunchStart(launchId)`
pub async fn enqueue_launch_start(
    store: &Arc<dyn Store>,
    queue: &Arc<dyn Queue>,
    launch_id: Uuid,
) -> Result<JobRun, EnqueueApiError> {
    let run = create_system_job_run(
        store,
        system_job_slugs::LAUNCH_START,
        json!({ "launchId": launch_id }),
    )
    .await?;
    queue
        .enqueue(QueueName::Launch, json!({ "jobRunId": run.id, "launchId": launch_id, "action": "start" }))
        .await?;
    Ok(run)
}

/// `enqueueLaunchStop(launchId)`
pub async fn enqueue_launch_stop(
    store: &Arc<dyn Store>,
    queue: &Arc<dyn Queue>,
    launch_id: Uuid,
) -> Result<JobRun, EnqueueApiError> {
    let run = create_system_job_run(
        store,
        system_job_slugs::LAUNCH_STOP,
        json!({ "launchId": launch_id }),
    )
    .await?;
    queue
        .enqueue(QueueName::Launch, json!({ "jobRunId": run.id, "launchId": launch_id, "action": "stop" }))
        .await?;
    Ok(run)
}

/// `enqueueWorkflowRun(workflowRunId)`. The `WorkflowRun` row is expected to
/// already exist (created by the caller, e.g. the scheduler or
/// materializer); this only dispatches it.
pub async fn enqueue_workflow_run(
    store: &Arc<dyn Store>,
    queue: &Arc<dyn Queue>,
    workflow_run_id: Uuid,
) -> Result<WorkflowRun, EnqueueApiError> {
    let run = store.get_workflow_run(workflow_run_id).await?;
    if run.status != WorkflowRunStatus::Pending {
        return Ok(run);
    }
    queue
        .enqueue(QueueName::Workflow, json!({ "workflowRunId": workflow_run_id }))
        .await?;
    Ok(run)
}

/// `enqueueWorkflowEvent(envelopeInput) → EventEnvelope`. Normalization of
/// the envelope happens in `dockyard-scheduler`; this just forwards the
/// already-normalized payload to the `event` queue.
pub async fn enqueue_workflow_event(
    queue: &Arc<dyn Queue>,
    envelope: Value,
) -> Result<Uuid, EnqueueApiError> {
    Ok(queue.enqueue(QueueName::Event, envelope).await?)
}

/// `enqueueEventTriggerEvaluation(envelope)`
pub async fn enqueue_event_trigger_evaluation(
    queue: &Arc<dyn Queue>,
    envelope: Value,
) -> Result<Uuid, EnqueueApiError> {
    Ok(queue.enqueue(QueueName::EventTrigger, envelope).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dockyard_events::EventBus;
    use dockyard_persistence::model::{JobDefinition, WorkflowDefinition, WorkflowRunStatus};
    use dockyard_persistence::InMemoryStore;
    use dockyard_types::reliability::RetryPolicy;

    use crate::inline::InlineQueue;
    use crate::queue::Consumer;

    struct NoopConsumer;

    #[async_trait]
    impl Consumer for NoopConsumer {
        async fn consume(&self, _message_id: Uuid, _payload: Value) -> Result<(), DockyardError> {
            Ok(())
        }
    }

    fn wired_queue(events: Arc<EventBus>) -> Arc<dyn Queue> {
        let queue: Arc<dyn Queue> = Arc::new(InlineQueue::new(events));
        for name in [QueueName::Ingest, QueueName::Build, QueueName::Launch, QueueName::Workflow] {
            queue.register_consumer(name, Arc::new(NoopConsumer));
        }
        queue
    }

    #[tokio::test]
    async fn enqueue_repository_ingestion_creates_a_pending_job_run() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        store
            .create_job_definition(JobDefinition {
                id: Uuid::now_v7(),
                slug: system_job_slugs::REPOSITORY_INGESTION.to_string(),
                version: 1,
                entry_point: "ingest".to_string(),
                default_parameters: json!({}),
                parameters_schema: None,
                timeout: std::time::Duration::from_secs(60),
                retry_policy: RetryPolicy::exponential(),
                metadata: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let queue = wired_queue(Arc::new(EventBus::default()));
        let repo_id = Uuid::now_v7();
        let run = enqueue_repository_ingestion(&store, &queue, repo_id, None).await.unwrap();

        assert_eq!(run.parameters, json!({ "repoId": repo_id }));
    }

    #[tokio::test]
    async fn enqueue_workflow_run_is_a_no_op_on_a_non_pending_run() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let queue = wired_queue(Arc::new(EventBus::default()));

        let definition = store
            .create_workflow_definition(WorkflowDefinition {
                id: Uuid::now_v7(),
                slug: "noop".to_string(),
                version: 1,
                steps: vec![],
                consumes: vec![],
                schedule: None,
                event_triggers: vec![],
                default_parameters: json!({}),
                metadata: json!({}),
                active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        let run = store
            .create_workflow_run(WorkflowRun {
                id: Uuid::now_v7(),
                workflow_definition_id: definition.id,
                status: WorkflowRunStatus::Succeeded,
                parameters: json!({}),
                shared: json!({}),
                metrics: json!({}),
                triggered_by: RunTrigger::Manual,
                trigger_payload: None,
                trace_context: None,
                error_message: None,
                created_at: now,
                started_at: Some(now),
                completed_at: Some(now),
                updated_at: now,
            })
            .await
            .unwrap();

        let result = enqueue_workflow_run(&store, &queue, run.id).await.unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Succeeded);
    }

    #[tokio::test]
    async fn enqueue_workflow_run_on_an_unknown_id_surfaces_a_precondition_error() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let queue = wired_queue(Arc::new(EventBus::default()));

        let err = enqueue_workflow_run(&store, &queue, Uuid::now_v7()).await.unwrap_err();
        let dockyard_err: DockyardError = (&err).into();
        assert_eq!(dockyard_err.kind, dockyard_types::ErrorKind::Precondition);
    }
}
