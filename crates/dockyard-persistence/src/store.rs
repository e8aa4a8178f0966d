//! The `Store` trait: one async interface, two backends
//! ([`crate::postgres::PostgresStore`] and [`crate::memory::InMemoryStore`]).
//! Grounded in `durable::persistence::store::WorkflowEventStore`: the same
//! shape of "optimistic conditional update returns the outcome, not an
//! error" is kept (spec §9 Open Question: conflicts are signaled by `Ok(None)`
//! or a returned status, never a special-cased error variant, so callers
//! can treat "someone else already handled it" as a normal branch).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockyard_types::cursor::EventCursor;
use dockyard_types::ErrorKind;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    AdvisoryLock, AuditEvent, JobDefinition, JobRun, ProducedAsset, WorkflowDefinition,
    WorkflowRun, WorkflowRunEvent, WorkflowRunStatus, WorkflowRunStep, WorkflowRunStepStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("job definition not found: {0}")]
    JobDefinitionNotFound(String),
    #[error("job run not found: {0}")]
    JobRunNotFound(Uuid),
    #[error("workflow definition not found: {0}")]
    WorkflowDefinitionNotFound(String),
    #[error("workflow run not found: {0}")]
    WorkflowRunNotFound(Uuid),
    #[error("workflow run step not found: {0}")]
    WorkflowRunStepNotFound(Uuid),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<&PersistenceError> for ErrorKind {
    fn from(err: &PersistenceError) -> Self {
        match err {
            PersistenceError::JobDefinitionNotFound(_)
            | PersistenceError::JobRunNotFound(_)
            | PersistenceError::WorkflowDefinitionNotFound(_)
            | PersistenceError::WorkflowRunNotFound(_)
            | PersistenceError::WorkflowRunStepNotFound(_) => ErrorKind::Precondition,
            PersistenceError::Conflict(_) => ErrorKind::Conflict,
            PersistenceError::Database(_) => ErrorKind::RetriableIo,
            PersistenceError::Serialization(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub limit: u32,
    /// Exclusive lower bound: only rows strictly after this cursor's
    /// `(occurred_at, id)` ordering are returned.
    pub cursor: Option<EventCursor>,
}

/// A candidate job run claimed for execution: the backend hands out at most
/// one claim per run id, analogous to `durable`'s `ClaimedTask`.
#[derive(Debug, Clone)]
pub struct ClaimedJobRun {
    pub run: JobRun,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- job definitions --

    async fn create_job_definition(&self, def: JobDefinition) -> Result<JobDefinition>;
    async fn get_job_definition_by_slug(&self, slug: &str) -> Result<JobDefinition>;
    async fn get_job_definition(&self, id: Uuid) -> Result<JobDefinition>;

    // -- job runs --

    async fn create_job_run(&self, run: JobRun) -> Result<JobRun>;
    async fn get_job_run(&self, id: Uuid) -> Result<JobRun>;

    /// Atomically transition a pending run to `Running`, incrementing
    /// `attempt`. Returns `None` if the run was not in a claimable state
    /// (already claimed, canceled, etc).
    async fn claim_job_run(&self, id: Uuid) -> Result<Option<ClaimedJobRun>>;

    /// Conditional update: succeeds only if `run.status` is still `Running`.
    /// Returns `false` if another writer already moved it to a terminal
    /// state (P1: terminal status never regresses).
    async fn complete_job_run(&self, id: Uuid, result: Value, metrics: Value) -> Result<bool>;

    async fn fail_job_run(
        &self,
        id: Uuid,
        error_kind: ErrorKind,
        message: String,
        metrics: Value,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Conditional terminal transition for a handler that ran past its
    /// timeout (spec §4.C step 5: "mark run `expired` with a synthetic
    /// error"). Succeeds only if `run.status` is still `Running`.
    async fn expire_job_run(&self, id: Uuid, message: String, metrics: Value) -> Result<bool>;

    async fn cancel_job_run(&self, id: Uuid, reason: String) -> Result<bool>;

    /// Runs due for (re)execution: `status = Pending` and `scheduled_at <=
    /// now`, ordered oldest-first.
    async fn due_job_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<JobRun>>;

    // -- workflow definitions --

    async fn create_workflow_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition>;
    async fn get_workflow_definition_by_slug(&self, slug: &str) -> Result<WorkflowDefinition>;
    async fn get_workflow_definition(&self, id: Uuid) -> Result<WorkflowDefinition>;
    async fn list_active_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Rewrites the `schedule` column wholesale. The schedule leader holds
    /// the per-schedule advisory lock for the duration of the read-modify-
    /// write, so this never races another materialization pass.
    async fn update_workflow_schedule(
        &self,
        workflow_definition_id: Uuid,
        schedule: crate::model::WorkflowSchedule,
    ) -> Result<()>;

    /// Rewrites the `event_triggers` column wholesale. Callers read the
    /// current `WorkflowDefinition`, mutate the one trigger they evaluated,
    /// and write the full array back; triggers are evaluated sequentially
    /// per source so this is not contended under normal operation.
    async fn update_workflow_event_triggers(
        &self,
        workflow_definition_id: Uuid,
        event_triggers: Vec<crate::model::WorkflowEventTrigger>,
    ) -> Result<()>;

    // -- workflow runs --

    async fn create_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;
    async fn get_workflow_run(&self, id: Uuid) -> Result<WorkflowRun>;
    async fn update_workflow_run_status(
        &self,
        id: Uuid,
        expected: WorkflowRunStatus,
        next: WorkflowRunStatus,
        error_message: Option<String>,
    ) -> Result<bool>;
    async fn update_workflow_run_shared(&self, id: Uuid, shared: Value) -> Result<bool>;
    async fn due_workflow_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>>;

    // -- workflow run steps --

    async fn create_workflow_run_step(&self, step: WorkflowRunStep) -> Result<WorkflowRunStep>;
    async fn get_workflow_run_step(&self, id: Uuid) -> Result<WorkflowRunStep>;
    async fn list_workflow_run_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowRunStep>>;
    #[allow(clippy::too_many_arguments)]
    async fn update_workflow_run_step_status(
        &self,
        id: Uuid,
        expected: WorkflowRunStepStatus,
        next: WorkflowRunStepStatus,
        attempt: Option<u32>,
        output: Option<Value>,
        metrics: Option<Value>,
        error_message: Option<String>,
    ) -> Result<bool>;

    // -- workflow run event journal --

    async fn append_workflow_run_event(&self, event: WorkflowRunEvent) -> Result<()>;
    async fn list_workflow_run_events(
        &self,
        workflow_run_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<WorkflowRunEvent>>;

    // -- assets --

    async fn record_produced_asset(&self, asset: ProducedAsset) -> Result<ProducedAsset>;
    async fn latest_asset(
        &self,
        asset_id: &str,
        partition_key: &str,
    ) -> Result<Option<ProducedAsset>>;

    // -- advisory locks --

    /// Attempt to acquire or renew `namespace` for `owner_id`. Succeeds if
    /// unclaimed, expired, or already held by `owner_id`.
    async fn try_acquire_lock(
        &self,
        namespace: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Result<bool>;

    async fn release_lock(&self, namespace: &str, owner_id: &str) -> Result<()>;

    async fn get_lock(&self, namespace: &str) -> Result<Option<AdvisoryLock>>;

    // -- audit --

    async fn record_audit_event(&self, event: AuditEvent) -> Result<()>;
}
