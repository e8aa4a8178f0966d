//! The domain event vocabulary. Grounded in `everruns-core::events::LoopEvent`'s
//! shape (a flat, serializable enum tagged by variant name) but covering the
//! run/asset/schedule lifecycle instead of agent-loop SSE events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    JobRunScheduled {
        job_run_id: Uuid,
        job_definition_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    JobRunStarted {
        job_run_id: Uuid,
        attempt: u32,
        occurred_at: DateTime<Utc>,
    },
    JobRunSucceeded {
        job_run_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    JobRunFailed {
        job_run_id: Uuid,
        retryable: bool,
        occurred_at: DateTime<Utc>,
    },
    WorkflowRunStarted {
        workflow_run_id: Uuid,
        workflow_definition_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    WorkflowRunSucceeded {
        workflow_run_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    WorkflowRunFailed {
        workflow_run_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    WorkflowRunCanceled {
        workflow_run_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    WorkflowRunStepCompleted {
        workflow_run_id: Uuid,
        step_id: String,
        succeeded: bool,
        occurred_at: DateTime<Utc>,
    },
    WorkflowDefinitionUpdated {
        workflow_definition_id: Uuid,
        slug: String,
        version: i32,
        occurred_at: DateTime<Utc>,
    },
    AssetProduced {
        asset_id: String,
        partition_key: String,
        workflow_run_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    AssetExpired {
        asset_id: String,
        partition_key: String,
        occurred_at: DateTime<Utc>,
    },
    ScheduleLeaderAcquired {
        owner_id: String,
        occurred_at: DateTime<Utc>,
    },
    ScheduleLeaderLost {
        owner_id: String,
        occurred_at: DateTime<Utc>,
    },
    EventTriggerFired {
        trigger_id: Uuid,
        source: String,
        payload: Value,
        occurred_at: DateTime<Utc>,
    },
    EventSourcePaused {
        source: String,
        resumes_at: DateTime<Utc>,
    },
    QueueTaskEnqueued {
        queue: String,
        task_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Stable name used as the broadcast channel key, matching the
    /// `#[serde(tag = "type")]` discriminant.
    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::JobRunScheduled { .. } => "job_run_scheduled",
            DomainEvent::JobRunStarted { .. } => "job_run_started",
            DomainEvent::JobRunSucceeded { .. } => "job_run_succeeded",
            DomainEvent::JobRunFailed { .. } => "job_run_failed",
            DomainEvent::WorkflowRunStarted { .. } => "workflow_run_started",
            DomainEvent::WorkflowRunSucceeded { .. } => "workflow_run_succeeded",
            DomainEvent::WorkflowRunFailed { .. } => "workflow_run_failed",
            DomainEvent::WorkflowRunCanceled { .. } => "workflow_run_canceled",
            DomainEvent::WorkflowRunStepCompleted { .. } => "workflow_run_step_completed",
            DomainEvent::WorkflowDefinitionUpdated { .. } => "workflow_definition_updated",
            DomainEvent::AssetProduced { .. } => "asset_produced",
            DomainEvent::AssetExpired { .. } => "asset_expired",
            DomainEvent::ScheduleLeaderAcquired { .. } => "schedule_leader_acquired",
            DomainEvent::ScheduleLeaderLost { .. } => "schedule_leader_lost",
            DomainEvent::EventTriggerFired { .. } => "event_trigger_fired",
            DomainEvent::EventSourcePaused { .. } => "event_source_paused",
            DomainEvent::QueueTaskEnqueued { .. } => "queue_task_enqueued",
        }
    }
}
