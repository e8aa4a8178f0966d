//! `Store` implementation over Postgres via `sqlx`. Grounded in
//! `durable::persistence::postgres::PostgresWorkflowEventStore`: runtime
//! `sqlx::query()` (not the compile-time `query!` macros, since nothing here
//! runs against a live database at build time), `#[instrument]` on every
//! method, and conditional updates expressed as `UPDATE ... WHERE status =
//! $expected` with the affected-row count deciding the `bool` result.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockyard_types::reliability::RetryPolicy;
use dockyard_types::ErrorKind;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::model::*;
use crate::store::{ClaimedJobRun, PersistenceError, Result, Store};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn db_err(err: sqlx::Error) -> PersistenceError {
    PersistenceError::Database(err.to_string())
}

fn ser(value: &impl serde::Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| PersistenceError::Serialization(e.to_string()))
}

fn de<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| PersistenceError::Serialization(e.to_string()))
}

fn job_run_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRun> {
    let status_str: String = row.try_get("status").map_err(db_err)?;
    let trace_id: Option<String> = row.try_get("trace_id").map_err(db_err)?;
    let trace_context = trace_id.map(|trace_id| TraceContext {
        trace_id,
        span_id: row.try_get::<Option<String>, _>("span_id").ok().flatten().unwrap_or_default(),
        trace_flags: row
            .try_get::<Option<i16>, _>("trace_flags")
            .ok()
            .flatten()
            .unwrap_or(0) as u8,
    });
    Ok(JobRun {
        id: row.try_get("id").map_err(db_err)?,
        job_definition_id: row.try_get("job_definition_id").map_err(db_err)?,
        status: parse_job_run_status(&status_str)?,
        parameters: row.try_get("parameters").map_err(db_err)?,
        result: row.try_get("result").map_err(db_err)?,
        metrics: row.try_get("metrics").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        error_kind: row.try_get("error_kind").map_err(db_err)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)? as u32,
        triggered_by: parse_trigger(&row.try_get::<String, _>("triggered_by").map_err(db_err)?)?,
        workflow_run_step_id: row.try_get("workflow_run_step_id").map_err(db_err)?,
        trace_context,
        scheduled_at: row.try_get("scheduled_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn parse_job_run_status(s: &str) -> Result<JobRunStatus> {
    Ok(match s {
        "pending" => JobRunStatus::Pending,
        "running" => JobRunStatus::Running,
        "succeeded" => JobRunStatus::Succeeded,
        "failed" => JobRunStatus::Failed,
        "canceled" => JobRunStatus::Canceled,
        "expired" => JobRunStatus::Expired,
        other => return Err(PersistenceError::Database(format!("unknown job run status {other}"))),
    })
}

fn job_run_status_str(status: JobRunStatus) -> &'static str {
    match status {
        JobRunStatus::Pending => "pending",
        JobRunStatus::Running => "running",
        JobRunStatus::Succeeded => "succeeded",
        JobRunStatus::Failed => "failed",
        JobRunStatus::Canceled => "canceled",
        JobRunStatus::Expired => "expired",
    }
}

fn parse_trigger(s: &str) -> Result<RunTrigger> {
    Ok(match s {
        "manual" => RunTrigger::Manual,
        "workflow" => RunTrigger::Workflow,
        "schedule" => RunTrigger::Schedule,
        "event" => RunTrigger::Event,
        "asset" => RunTrigger::Asset,
        other => return Err(PersistenceError::Database(format!("unknown trigger {other}"))),
    })
}

fn trigger_str(trigger: RunTrigger) -> &'static str {
    match trigger {
        RunTrigger::Manual => "manual",
        RunTrigger::Workflow => "workflow",
        RunTrigger::Schedule => "schedule",
        RunTrigger::Event => "event",
        RunTrigger::Asset => "asset",
    }
}

fn parse_workflow_run_status(s: &str) -> Result<WorkflowRunStatus> {
    Ok(match s {
        "pending" => WorkflowRunStatus::Pending,
        "running" => WorkflowRunStatus::Running,
        "succeeded" => WorkflowRunStatus::Succeeded,
        "failed" => WorkflowRunStatus::Failed,
        "canceled" => WorkflowRunStatus::Canceled,
        other => {
            return Err(PersistenceError::Database(format!(
                "unknown workflow run status {other}"
            )))
        }
    })
}

fn workflow_run_status_str(status: WorkflowRunStatus) -> &'static str {
    match status {
        WorkflowRunStatus::Pending => "pending",
        WorkflowRunStatus::Running => "running",
        WorkflowRunStatus::Succeeded => "succeeded",
        WorkflowRunStatus::Failed => "failed",
        WorkflowRunStatus::Canceled => "canceled",
    }
}

fn parse_step_status(s: &str) -> Result<WorkflowRunStepStatus> {
    Ok(match s {
        "pending" => WorkflowRunStepStatus::Pending,
        "running" => WorkflowRunStepStatus::Running,
        "succeeded" => WorkflowRunStepStatus::Succeeded,
        "failed" => WorkflowRunStepStatus::Failed,
        "skipped" => WorkflowRunStepStatus::Skipped,
        other => return Err(PersistenceError::Database(format!("unknown step status {other}"))),
    })
}

fn step_status_str(status: WorkflowRunStepStatus) -> &'static str {
    match status {
        WorkflowRunStepStatus::Pending => "pending",
        WorkflowRunStepStatus::Running => "running",
        WorkflowRunStepStatus::Succeeded => "succeeded",
        WorkflowRunStepStatus::Failed => "failed",
        WorkflowRunStepStatus::Skipped => "skipped",
    }
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, def))]
    async fn create_job_definition(&self, def: JobDefinition) -> Result<JobDefinition> {
        let next_version: i32 = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next FROM job_definitions WHERE slug = $1",
        )
        .bind(&def.slug)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .try_get("next")
        .map_err(db_err)?;

        let retry_policy = ser(&def.retry_policy)?;
        sqlx::query(
            "INSERT INTO job_definitions (id, slug, version, entry_point, default_parameters, \
             parameters_schema, timeout_ms, retry_policy, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(def.id)
        .bind(&def.slug)
        .bind(next_version)
        .bind(&def.entry_point)
        .bind(&def.default_parameters)
        .bind(&def.parameters_schema)
        .bind(def.timeout.as_millis() as i64)
        .bind(&retry_policy)
        .bind(&def.metadata)
        .bind(def.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(JobDefinition {
            version: next_version,
            ..def
        })
    }

    #[instrument(skip(self))]
    async fn get_job_definition_by_slug(&self, slug: &str) -> Result<JobDefinition> {
        let row = sqlx::query(
            "SELECT * FROM job_definitions WHERE slug = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| PersistenceError::JobDefinitionNotFound(slug.to_string()))?;
        job_definition_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_job_definition(&self, id: Uuid) -> Result<JobDefinition> {
        let row = sqlx::query("SELECT * FROM job_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| PersistenceError::JobDefinitionNotFound(id.to_string()))?;
        job_definition_from_row(&row)
    }

    #[instrument(skip(self, run))]
    async fn create_job_run(&self, run: JobRun) -> Result<JobRun> {
        let (trace_id, span_id, trace_flags) = match &run.trace_context {
            Some(tc) => (
                Some(tc.trace_id.clone()),
                Some(tc.span_id.clone()),
                Some(tc.trace_flags as i16),
            ),
            None => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO job_runs (id, job_definition_id, status, parameters, result, metrics, \
             error_message, error_kind, attempt, max_attempts, triggered_by, \
             workflow_run_step_id, trace_id, span_id, trace_flags, scheduled_at, started_at, \
             completed_at, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)",
        )
        .bind(run.id)
        .bind(run.job_definition_id)
        .bind(job_run_status_str(run.status))
        .bind(&run.parameters)
        .bind(&run.result)
        .bind(&run.metrics)
        .bind(&run.error_message)
        .bind(&run.error_kind)
        .bind(run.attempt as i32)
        .bind(run.max_attempts as i32)
        .bind(trigger_str(run.triggered_by))
        .bind(run.workflow_run_step_id)
        .bind(trace_id)
        .bind(span_id)
        .bind(trace_flags)
        .bind(run.scheduled_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(run)
    }

    #[instrument(skip(self))]
    async fn get_job_run(&self, id: Uuid) -> Result<JobRun> {
        let row = sqlx::query("SELECT * FROM job_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(PersistenceError::JobRunNotFound(id))?;
        job_run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn claim_job_run(&self, id: Uuid) -> Result<Option<ClaimedJobRun>> {
        let row = sqlx::query(
            "UPDATE job_runs SET status = 'running', attempt = attempt + 1, \
             started_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'pending' RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(ClaimedJobRun {
                run: job_run_from_row(&row)?,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, result, metrics))]
    async fn complete_job_run(&self, id: Uuid, result: Value, metrics: Value) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE job_runs SET status = 'succeeded', result = $2, metrics = $3, \
             completed_at = now(), updated_at = now() WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(result)
        .bind(metrics)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self, message, metrics))]
    async fn fail_job_run(
        &self,
        id: Uuid,
        error_kind: ErrorKind,
        message: String,
        metrics: Value,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let affected = match retry_at {
            Some(at) => {
                sqlx::query(
                    "UPDATE job_runs SET status = 'pending', error_kind = $2, error_message = $3, \
                     metrics = $4, scheduled_at = $5, updated_at = now() \
                     WHERE id = $1 AND status = 'running'",
                )
                .bind(id)
                .bind(error_kind.to_string())
                .bind(message)
                .bind(metrics)
                .bind(at)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE job_runs SET status = 'failed', error_kind = $2, error_message = $3, \
                     metrics = $4, completed_at = now(), updated_at = now() \
                     WHERE id = $1 AND status = 'running'",
                )
                .bind(id)
                .bind(error_kind.to_string())
                .bind(message)
                .bind(metrics)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self, message))]
    async fn expire_job_run(&self, id: Uuid, message: String, metrics: Value) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE job_runs SET status = 'expired', error_kind = 'timeout', error_message = $2, \
             metrics = $3, completed_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(message)
        .bind(metrics)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self))]
    async fn cancel_job_run(&self, id: Uuid, reason: String) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE job_runs SET status = 'canceled', error_message = $2, completed_at = now(), \
             updated_at = now() WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self))]
    async fn due_job_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(
            "SELECT * FROM job_runs WHERE status = 'pending' AND scheduled_at <= $1 \
             ORDER BY scheduled_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(job_run_from_row).collect()
    }

    #[instrument(skip(self, def))]
    async fn create_workflow_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        let next_version: i32 = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next FROM workflow_definitions WHERE slug = $1",
        )
        .bind(&def.slug)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .try_get("next")
        .map_err(db_err)?;

        let steps = ser(&def.steps)?;
        let consumes = ser(&def.consumes)?;
        let schedule = match &def.schedule {
            Some(s) => Some(ser(s)?),
            None => None,
        };
        let triggers = ser(&def.event_triggers)?;

        sqlx::query(
            "INSERT INTO workflow_definitions (id, slug, version, steps, consumes, schedule, \
             event_triggers, default_parameters, metadata, active, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(def.id)
        .bind(&def.slug)
        .bind(next_version)
        .bind(&steps)
        .bind(&consumes)
        .bind(&schedule)
        .bind(&triggers)
        .bind(&def.default_parameters)
        .bind(&def.metadata)
        .bind(def.active)
        .bind(def.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(WorkflowDefinition {
            version: next_version,
            ..def
        })
    }

    #[instrument(skip(self))]
    async fn get_workflow_definition_by_slug(&self, slug: &str) -> Result<WorkflowDefinition> {
        let row = sqlx::query(
            "SELECT * FROM workflow_definitions WHERE slug = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| PersistenceError::WorkflowDefinitionNotFound(slug.to_string()))?;
        workflow_definition_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_workflow_definition(&self, id: Uuid) -> Result<WorkflowDefinition> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| PersistenceError::WorkflowDefinitionNotFound(id.to_string()))?;
        workflow_definition_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_active_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query("SELECT * FROM workflow_definitions WHERE active = true")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(workflow_definition_from_row).collect()
    }

    #[instrument(skip(self, schedule))]
    async fn update_workflow_schedule(
        &self,
        workflow_definition_id: Uuid,
        schedule: crate::model::WorkflowSchedule,
    ) -> Result<()> {
        let encoded = ser(&schedule)?;
        let result = sqlx::query("UPDATE workflow_definitions SET schedule = $1 WHERE id = $2")
            .bind(&encoded)
            .bind(workflow_definition_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::WorkflowDefinitionNotFound(
                workflow_definition_id.to_string(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, event_triggers))]
    async fn update_workflow_event_triggers(
        &self,
        workflow_definition_id: Uuid,
        event_triggers: Vec<crate::model::WorkflowEventTrigger>,
    ) -> Result<()> {
        let encoded = ser(&event_triggers)?;
        let result = sqlx::query("UPDATE workflow_definitions SET event_triggers = $1 WHERE id = $2")
            .bind(&encoded)
            .bind(workflow_definition_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::WorkflowDefinitionNotFound(
                workflow_definition_id.to_string(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, run))]
    async fn create_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let (trace_id, span_id, trace_flags) = match &run.trace_context {
            Some(tc) => (
                Some(tc.trace_id.clone()),
                Some(tc.span_id.clone()),
                Some(tc.trace_flags as i16),
            ),
            None => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO workflow_runs (id, workflow_definition_id, status, parameters, shared, \
             metrics, triggered_by, trigger_payload, trace_id, span_id, trace_flags, \
             error_message, created_at, started_at, completed_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
        )
        .bind(run.id)
        .bind(run.workflow_definition_id)
        .bind(workflow_run_status_str(run.status))
        .bind(&run.parameters)
        .bind(&run.shared)
        .bind(&run.metrics)
        .bind(trigger_str(run.triggered_by))
        .bind(&run.trigger_payload)
        .bind(trace_id)
        .bind(span_id)
        .bind(trace_flags)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(run)
    }

    #[instrument(skip(self))]
    async fn get_workflow_run(&self, id: Uuid) -> Result<WorkflowRun> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(PersistenceError::WorkflowRunNotFound(id))?;
        workflow_run_from_row(&row)
    }

    #[instrument(skip(self, error_message))]
    async fn update_workflow_run_status(
        &self,
        id: Uuid,
        expected: WorkflowRunStatus,
        next: WorkflowRunStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE workflow_runs SET status = $3, \
             error_message = COALESCE($4, error_message), \
             started_at = CASE WHEN $3 = 'running' AND started_at IS NULL THEN now() ELSE started_at END, \
             completed_at = CASE WHEN $3 IN ('succeeded','failed','canceled') THEN now() ELSE completed_at END, \
             updated_at = now() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(workflow_run_status_str(expected))
        .bind(workflow_run_status_str(next))
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self, shared))]
    async fn update_workflow_run_shared(&self, id: Uuid, shared: Value) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE workflow_runs SET shared = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(shared)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self))]
    async fn due_workflow_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(workflow_run_from_row).collect()
    }

    #[instrument(skip(self, step))]
    async fn create_workflow_run_step(&self, step: WorkflowRunStep) -> Result<WorkflowRunStep> {
        sqlx::query(
            "INSERT INTO workflow_run_steps (id, workflow_run_id, step_id, status, attempt, \
             job_run_id, input, output, metrics, error_message, fanout_parent_id, fanout_index, \
             created_at, updated_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
        )
        .bind(step.id)
        .bind(step.workflow_run_id)
        .bind(&step.step_id)
        .bind(step_status_str(step.status))
        .bind(step.attempt as i32)
        .bind(step.job_run_id)
        .bind(&step.input)
        .bind(&step.output)
        .bind(&step.metrics)
        .bind(&step.error_message)
        .bind(&step.fanout_parent_id)
        .bind(step.fanout_index)
        .bind(step.created_at)
        .bind(step.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(step)
    }

    #[instrument(skip(self))]
    async fn get_workflow_run_step(&self, id: Uuid) -> Result<WorkflowRunStep> {
        let row = sqlx::query("SELECT * FROM workflow_run_steps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(PersistenceError::WorkflowRunStepNotFound(id))?;
        workflow_run_step_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_workflow_run_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowRunStep>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_run_steps WHERE workflow_run_id = $1 ORDER BY created_at ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(workflow_run_step_from_row).collect()
    }

    #[instrument(skip(self, output, metrics, error_message))]
    async fn update_workflow_run_step_status(
        &self,
        id: Uuid,
        expected: WorkflowRunStepStatus,
        next: WorkflowRunStepStatus,
        attempt: Option<u32>,
        output: Option<Value>,
        metrics: Option<Value>,
        error_message: Option<String>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE workflow_run_steps SET status = $3, \
             attempt = COALESCE($4, attempt), \
             output = COALESCE($5, output), \
             metrics = COALESCE($6, metrics), \
             error_message = COALESCE($7, error_message), updated_at = now() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(step_status_str(expected))
        .bind(step_status_str(next))
        .bind(attempt.map(|a| a as i32))
        .bind(output)
        .bind(metrics)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self, event))]
    async fn append_workflow_run_event(&self, event: WorkflowRunEvent) -> Result<()> {
        let payload = serde_json::to_value(&event.kind)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        let kind = payload
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        sqlx::query(
            "INSERT INTO workflow_run_events (id, workflow_run_id, kind, payload, occurred_at) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(event.id)
        .bind(event.workflow_run_id)
        .bind(kind)
        .bind(payload)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, page))]
    async fn list_workflow_run_events(
        &self,
        workflow_run_id: Uuid,
        page: crate::store::Pagination,
    ) -> Result<Vec<WorkflowRunEvent>> {
        let limit = if page.limit == 0 { i64::MAX } else { page.limit as i64 };
        let rows = match page.cursor {
            Some(cursor) => {
                sqlx::query(
                    "SELECT id, workflow_run_id, payload, occurred_at FROM workflow_run_events \
                     WHERE workflow_run_id = $1 AND (occurred_at, id) > ($2, $3) \
                     ORDER BY occurred_at ASC, id ASC LIMIT $4",
                )
                .bind(workflow_run_id)
                .bind(cursor.occurred_at)
                .bind(cursor.id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, workflow_run_id, payload, occurred_at FROM workflow_run_events \
                     WHERE workflow_run_id = $1 ORDER BY occurred_at ASC, id ASC LIMIT $2",
                )
                .bind(workflow_run_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let payload: Value = row.try_get("payload").map_err(db_err)?;
                let kind = serde_json::from_value(payload)
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
                Ok(WorkflowRunEvent {
                    id: row.try_get("id").map_err(db_err)?,
                    workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
                    kind,
                    occurred_at: row.try_get("occurred_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, asset))]
    async fn record_produced_asset(&self, asset: ProducedAsset) -> Result<ProducedAsset> {
        sqlx::query(
            "INSERT INTO produced_assets (id, asset_id, partition_key, workflow_definition_id, \
             workflow_run_id, step_id, payload, produced_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(asset.id)
        .bind(&asset.asset_id)
        .bind(&asset.partition_key)
        .bind(asset.workflow_definition_id)
        .bind(asset.workflow_run_id)
        .bind(&asset.step_id)
        .bind(&asset.payload)
        .bind(asset.produced_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(asset)
    }

    #[instrument(skip(self))]
    async fn latest_asset(
        &self,
        asset_id: &str,
        partition_key: &str,
    ) -> Result<Option<ProducedAsset>> {
        let row = sqlx::query(
            "SELECT * FROM produced_assets WHERE asset_id = $1 AND partition_key = $2 \
             ORDER BY produced_at DESC LIMIT 1",
        )
        .bind(asset_id)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| produced_asset_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn try_acquire_lock(
        &self,
        namespace: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let affected = sqlx::query(
            "INSERT INTO advisory_locks (namespace, owner_id, acquired_at, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (namespace) DO UPDATE SET owner_id = $2, acquired_at = $3, expires_at = $4 \
             WHERE advisory_locks.owner_id = $2 OR advisory_locks.expires_at <= $3",
        )
        .bind(namespace)
        .bind(owner_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        Ok(affected > 0)
    }

    #[instrument(skip(self))]
    async fn release_lock(&self, namespace: &str, owner_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM advisory_locks WHERE namespace = $1 AND owner_id = $2")
            .bind(namespace)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_lock(&self, namespace: &str) -> Result<Option<AdvisoryLock>> {
        let row = sqlx::query("SELECT * FROM advisory_locks WHERE namespace = $1")
            .bind(namespace)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| {
            Ok(AdvisoryLock {
                namespace: r.try_get("namespace").map_err(db_err)?,
                owner_id: r.try_get("owner_id").map_err(db_err)?,
                acquired_at: r.try_get("acquired_at").map_err(db_err)?,
                expires_at: r.try_get("expires_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, event))]
    async fn record_audit_event(&self, event: AuditEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_events (id, entity_type, entity_id, action, detail, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(event.id)
        .bind(&event.entity_type)
        .bind(event.entity_id)
        .bind(&event.action)
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn job_definition_from_row(row: &sqlx::postgres::PgRow) -> Result<JobDefinition> {
    let retry_policy: Value = row.try_get("retry_policy").map_err(db_err)?;
    Ok(JobDefinition {
        id: row.try_get("id").map_err(db_err)?,
        slug: row.try_get("slug").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        entry_point: row.try_get("entry_point").map_err(db_err)?,
        default_parameters: row.try_get("default_parameters").map_err(db_err)?,
        parameters_schema: row.try_get("parameters_schema").map_err(db_err)?,
        timeout: Duration::from_millis(row.try_get::<i64, _>("timeout_ms").map_err(db_err)? as u64),
        retry_policy: de::<RetryPolicy>(retry_policy)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn workflow_definition_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowDefinition> {
    let steps: Value = row.try_get("steps").map_err(db_err)?;
    let consumes: Value = row.try_get("consumes").map_err(db_err)?;
    let schedule: Option<Value> = row.try_get("schedule").map_err(db_err)?;
    let triggers: Value = row.try_get("event_triggers").map_err(db_err)?;
    Ok(WorkflowDefinition {
        id: row.try_get("id").map_err(db_err)?,
        slug: row.try_get("slug").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        steps: de(steps)?,
        consumes: de(consumes)?,
        schedule: schedule.map(de).transpose()?,
        event_triggers: de(triggers)?,
        default_parameters: row.try_get("default_parameters").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        active: row.try_get("active").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn workflow_run_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowRun> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let trace_id: Option<String> = row.try_get("trace_id").map_err(db_err)?;
    let trace_context = trace_id.map(|trace_id| TraceContext {
        trace_id,
        span_id: row.try_get::<Option<String>, _>("span_id").ok().flatten().unwrap_or_default(),
        trace_flags: row
            .try_get::<Option<i16>, _>("trace_flags")
            .ok()
            .flatten()
            .unwrap_or(0) as u8,
    });
    Ok(WorkflowRun {
        id: row.try_get("id").map_err(db_err)?,
        workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
        status: parse_workflow_run_status(&status)?,
        parameters: row.try_get("parameters").map_err(db_err)?,
        shared: row.try_get("shared").map_err(db_err)?,
        metrics: row.try_get("metrics").map_err(db_err)?,
        triggered_by: parse_trigger(&row.try_get::<String, _>("triggered_by").map_err(db_err)?)?,
        trigger_payload: row.try_get("trigger_payload").map_err(db_err)?,
        trace_context,
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn workflow_run_step_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowRunStep> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(WorkflowRunStep {
        id: row.try_get("id").map_err(db_err)?,
        workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
        step_id: row.try_get("step_id").map_err(db_err)?,
        status: parse_step_status(&status)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
        job_run_id: row.try_get("job_run_id").map_err(db_err)?,
        input: row.try_get("input").map_err(db_err)?,
        output: row.try_get("output").map_err(db_err)?,
        metrics: row.try_get("metrics").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        fanout_parent_id: row.try_get("fanout_parent_id").map_err(db_err)?,
        fanout_index: row.try_get("fanout_index").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn produced_asset_from_row(row: &sqlx::postgres::PgRow) -> Result<ProducedAsset> {
    Ok(ProducedAsset {
        id: row.try_get("id").map_err(db_err)?,
        asset_id: row.try_get("asset_id").map_err(db_err)?,
        partition_key: row.try_get("partition_key").map_err(db_err)?,
        workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
        workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
        step_id: row.try_get("step_id").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        produced_at: row.try_get("produced_at").map_err(db_err)?,
    })
}
