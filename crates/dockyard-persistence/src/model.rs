//! Durable entities (spec §3). Every row carries `created_at`/`updated_at`
//! and, where applicable, a `trace_context` captured at creation so a caller
//! can correlate a run back to whatever initiated it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dockyard_types::reliability::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// W3C-shaped trace context, carried opaquely. Grounded in the teacher's
/// `durable::persistence::store::TraceContext`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Expired,
}

impl JobRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobRunStatus::Succeeded
                | JobRunStatus::Failed
                | JobRunStatus::Canceled
                | JobRunStatus::Expired
        )
    }
}

/// A published job definition. Definitions are immutable once created;
/// republishing a slug creates a new row with an incremented `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub slug: String,
    pub version: i32,
    pub entry_point: String,
    pub default_parameters: Value,
    pub parameters_schema: Option<Value>,
    pub timeout: std::time::Duration,
    pub retry_policy: RetryPolicy,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Workflow,
    Schedule,
    Event,
    Asset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_definition_id: Uuid,
    pub status: JobRunStatus,
    pub parameters: Value,
    pub result: Option<Value>,
    pub metrics: Value,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub triggered_by: RunTrigger,
    pub workflow_run_step_id: Option<Uuid>,
    pub trace_context: Option<TraceContext>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// One step in a workflow's DAG. Steps are addressed by `id` within a
/// workflow definition; `depends_on` lists sibling step ids that must reach
/// a terminal (non-failed) state before this step becomes eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStep {
    Job {
        id: String,
        job_slug: String,
        parameter_template: Value,
        retry_override: Option<RetryPolicy>,
        timeout_override: Option<std::time::Duration>,
        store_result_as: Option<String>,
        produces: Vec<AssetDeclaration>,
        depends_on: Vec<String>,
    },
    Service {
        id: String,
        service_slug: String,
        method: String,
        path_template: String,
        /// Query-string parameters, templated the same way as
        /// `path_template`; appended to the resolved path as `?k=v&...` in
        /// declaration order.
        #[serde(default)]
        query_template: HashMap<String, String>,
        headers_template: HashMap<String, String>,
        body_template: Option<Value>,
        /// Step is skipped with a precondition failure if the service is
        /// unhealthy at dispatch time.
        require_healthy: bool,
        /// Step may still dispatch to a service reporting "degraded" rather
        /// than "healthy"; has no effect unless `require_healthy` is set,
        /// since an unhealthy-tolerant step never needs to distinguish
        /// degraded from healthy in the first place.
        #[serde(default)]
        allow_degraded: bool,
        #[serde(default)]
        timeout_override: Option<std::time::Duration>,
        /// Whether the response body is parsed and retained on the
        /// `WorkflowRunStep` record. Large or non-JSON responses may set
        /// this to `false` to avoid persisting the payload.
        #[serde(default = "default_capture_response")]
        capture_response: bool,
        store_response_as: Option<String>,
        produces: Vec<AssetDeclaration>,
        depends_on: Vec<String>,
    },
    FanOut {
        id: String,
        collection_template: String,
        max_items: Option<usize>,
        max_concurrency: usize,
        template: Box<WorkflowStep>,
        store_results_as: Option<String>,
        depends_on: Vec<String>,
    },
}

fn default_capture_response() -> bool {
    true
}

impl WorkflowStep {
    pub fn id(&self) -> &str {
        match self {
            WorkflowStep::Job { id, .. } => id,
            WorkflowStep::Service { id, .. } => id,
            WorkflowStep::FanOut { id, .. } => id,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            WorkflowStep::Job { depends_on, .. } => depends_on,
            WorkflowStep::Service { depends_on, .. } => depends_on,
            WorkflowStep::FanOut { depends_on, .. } => depends_on,
        }
    }

    /// Assets this step declares it produces. A `FanOut` step has no
    /// `produces` field of its own; its template step's declarations (if
    /// any) apply to each child rather than the fan-out step itself.
    pub fn produces(&self) -> &[AssetDeclaration] {
        match self {
            WorkflowStep::Job { produces, .. } => produces,
            WorkflowStep::Service { produces, .. } => produces,
            WorkflowStep::FanOut { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDeclaration {
    pub asset_id: String,
    pub partition_key_template: Option<String>,
    /// How long a materialization of this asset stays fresh before the
    /// expiry scanner republishes it as due. `None` means the asset never
    /// expires on its own; only new production (or an explicit consumer's
    /// `max_staleness`) triggers downstream consumers.
    #[serde(default)]
    pub max_age: Option<std::time::Duration>,
    /// Minimum interval between expiry checks for this asset, independent
    /// of `max_age`: a producer that runs every minute but is only
    /// meaningful on a daily cadence sets this instead of (or alongside)
    /// `max_age`. `None` means the scanner checks every pass.
    #[serde(default)]
    pub cadence: Option<std::time::Duration>,
}

/// An asset-freshness-triggered or event-triggered entry point into a
/// workflow (spec §4.F, §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEventTrigger {
    pub id: Uuid,
    pub source: String,
    pub predicate: Value,
    pub min_interval: std::time::Duration,
    pub max_per_window: u32,
    pub window: std::time::Duration,
    pub active: bool,
    /// Consecutive evaluation failures since the last success. Reset to 0
    /// on any `launched`/`matched` outcome.
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set when `failure_count` crosses the evaluator's threshold; the
    /// trigger is skipped (outcome `paused`) until this elapses.
    #[serde(default)]
    pub paused_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub cron_expression: String,
    pub timezone: String,
    pub catch_up: bool,
    /// Earliest time the schedule may materialize runs for; `None` means
    /// no lower bound (materialize from `created_at`).
    #[serde(default)]
    pub start_window: Option<DateTime<Utc>>,
    /// Latest time the schedule may materialize runs for; `None` means no
    /// upper bound beyond "now".
    #[serde(default)]
    pub end_window: Option<DateTime<Utc>>,
    /// Resume point for the next materialization pass: `catch_up_cursor`
    /// if set, else `last_materialized_window_end`, else `start_window`.
    #[serde(default)]
    pub catch_up_cursor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_materialized_window_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedule_next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub slug: String,
    pub version: i32,
    pub steps: Vec<WorkflowStep>,
    pub consumes: Vec<WorkflowAssetConsumer>,
    pub schedule: Option<WorkflowSchedule>,
    pub event_triggers: Vec<WorkflowEventTrigger>,
    pub default_parameters: Value,
    pub metadata: Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAssetConsumer {
    pub asset_id: String,
    pub partition_key_template: Option<String>,
    pub max_staleness: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl WorkflowRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowRunStatus::Pending | WorkflowRunStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_definition_id: Uuid,
    pub status: WorkflowRunStatus,
    pub parameters: Value,
    /// Shared namespace written by `storeResultAs`/`storeResponseAs`/
    /// `storeResultsAs`, keyed by the name the step declared.
    pub shared: Value,
    pub metrics: Value,
    pub triggered_by: RunTrigger,
    pub trigger_payload: Option<Value>,
    pub trace_context: Option<TraceContext>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl WorkflowRunStepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            WorkflowRunStepStatus::Pending | WorkflowRunStepStatus::Running
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunStep {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub step_id: String,
    pub status: WorkflowRunStepStatus,
    pub attempt: u32,
    pub job_run_id: Option<Uuid>,
    pub input: Value,
    pub output: Option<Value>,
    pub metrics: Value,
    pub error_message: Option<String>,
    /// Set for a step materialized from a `FanOut` template: the parent
    /// fan-out step id and this item's index within the collection.
    pub fanout_parent_id: Option<String>,
    pub fanout_index: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducedAsset {
    pub id: Uuid,
    pub asset_id: String,
    pub partition_key: String,
    pub workflow_definition_id: Uuid,
    pub workflow_run_id: Uuid,
    pub step_id: String,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

/// A row in `advisory_locks`: a singleton's claim, renewed by heartbeat and
/// lost when `expires_at` passes without renewal (spec §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryLock {
    pub namespace: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Append-only journal entry for a `WorkflowRun`. Recorded before the
/// orchestrator acts on the transition it describes, so a crashed worker
/// that re-acquires the run can tell what was already durable versus what
/// must be redone (spec §4.D "Failure model"). Grounded in
/// `durable::workflow::event::WorkflowEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowRunEventKind {
    Started,
    StepScheduled { step_id: String },
    StepStarted { step_id: String, attempt: u32 },
    StepSucceeded { step_id: String },
    StepFailed { step_id: String, retryable: bool },
    StepSkipped { step_id: String, reason: String },
    Completed,
    Failed { message: String },
    Canceled { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunEvent {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub kind: WorkflowRunEventKind,
    pub occurred_at: DateTime<Utc>,
}
