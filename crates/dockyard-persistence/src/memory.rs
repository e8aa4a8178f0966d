//! In-process `Store` backed by `dashmap`, used by unit and integration
//! tests (spec §8) and by the admin test harness. Grounded in `durable`'s
//! split between a SQL-backed store and a lighter in-memory one used for
//! fast iteration; conditional updates here use `dashmap::Entry` in place of
//! `UPDATE ... WHERE` guards.

use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dockyard_types::ErrorKind;
use serde_json::Value;
use uuid::Uuid;

use crate::model::*;
use crate::store::{ClaimedJobRun, Pagination, PersistenceError, Result, Store};

#[derive(Default)]
pub struct InMemoryStore {
    job_definitions: DashMap<Uuid, JobDefinition>,
    job_definitions_by_slug: DashMap<String, Uuid>,
    job_definition_versions: DashMap<String, AtomicI32>,

    job_runs: DashMap<Uuid, JobRun>,

    workflow_definitions: DashMap<Uuid, WorkflowDefinition>,
    workflow_definitions_by_slug: DashMap<String, Uuid>,

    workflow_runs: DashMap<Uuid, WorkflowRun>,
    workflow_run_steps: DashMap<Uuid, WorkflowRunStep>,
    workflow_run_events: DashMap<Uuid, Vec<WorkflowRunEvent>>,

    /// keyed by `(asset_id_normalized, partition_key)`.
    latest_assets: DashMap<(String, String), ProducedAsset>,

    advisory_locks: DashMap<String, AdvisoryLock>,

    audit_events: DashMap<Uuid, AuditEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_job_definition(&self, mut def: JobDefinition) -> Result<JobDefinition> {
        let version = self
            .job_definition_versions
            .entry(def.slug.clone())
            .or_insert_with(|| AtomicI32::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        def.version = version;
        self.job_definitions_by_slug
            .insert(def.slug.clone(), def.id);
        self.job_definitions.insert(def.id, def.clone());
        Ok(def)
    }

    async fn get_job_definition_by_slug(&self, slug: &str) -> Result<JobDefinition> {
        let id = *self
            .job_definitions_by_slug
            .get(slug)
            .ok_or_else(|| PersistenceError::JobDefinitionNotFound(slug.to_string()))?;
        self.get_job_definition(id).await
    }

    async fn get_job_definition(&self, id: Uuid) -> Result<JobDefinition> {
        self.job_definitions
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| PersistenceError::JobDefinitionNotFound(id.to_string()))
    }

    async fn create_job_run(&self, run: JobRun) -> Result<JobRun> {
        self.job_runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_job_run(&self, id: Uuid) -> Result<JobRun> {
        self.job_runs
            .get(&id)
            .map(|e| e.clone())
            .ok_or(PersistenceError::JobRunNotFound(id))
    }

    async fn claim_job_run(&self, id: Uuid) -> Result<Option<ClaimedJobRun>> {
        let mut entry = match self.job_runs.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::JobRunNotFound(id)),
        };
        if entry.status != JobRunStatus::Pending {
            return Ok(None);
        }
        entry.status = JobRunStatus::Running;
        entry.attempt += 1;
        entry.started_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(Some(ClaimedJobRun { run: entry.clone() }))
    }

    async fn complete_job_run(&self, id: Uuid, result: Value, metrics: Value) -> Result<bool> {
        let mut entry = match self.job_runs.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::JobRunNotFound(id)),
        };
        if entry.status != JobRunStatus::Running {
            return Ok(false);
        }
        entry.status = JobRunStatus::Succeeded;
        entry.result = Some(result);
        entry.metrics = metrics;
        entry.completed_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_job_run(
        &self,
        id: Uuid,
        error_kind: ErrorKind,
        message: String,
        metrics: Value,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut entry = match self.job_runs.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::JobRunNotFound(id)),
        };
        if entry.status != JobRunStatus::Running {
            return Ok(false);
        }
        entry.error_kind = Some(error_kind.to_string());
        entry.error_message = Some(message);
        entry.metrics = metrics;
        entry.updated_at = Utc::now();
        match retry_at {
            Some(at) => {
                entry.status = JobRunStatus::Pending;
                entry.scheduled_at = at;
            }
            None => {
                entry.status = JobRunStatus::Failed;
                entry.completed_at = Some(Utc::now());
            }
        }
        Ok(true)
    }

    async fn expire_job_run(&self, id: Uuid, message: String, metrics: Value) -> Result<bool> {
        let mut entry = match self.job_runs.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::JobRunNotFound(id)),
        };
        if entry.status != JobRunStatus::Running {
            return Ok(false);
        }
        entry.status = JobRunStatus::Expired;
        entry.error_kind = Some(ErrorKind::Timeout.to_string());
        entry.error_message = Some(message);
        entry.metrics = metrics;
        entry.completed_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn cancel_job_run(&self, id: Uuid, reason: String) -> Result<bool> {
        let mut entry = match self.job_runs.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::JobRunNotFound(id)),
        };
        if entry.status.is_terminal() {
            return Ok(false);
        }
        entry.status = JobRunStatus::Canceled;
        entry.error_message = Some(reason);
        entry.completed_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn due_job_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<JobRun>> {
        let mut due: Vec<JobRun> = self
            .job_runs
            .iter()
            .filter(|e| e.status == JobRunStatus::Pending && e.scheduled_at <= now)
            .map(|e| e.clone())
            .collect();
        due.sort_by_key(|r| r.scheduled_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn create_workflow_definition(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        def.version = self
            .workflow_definitions_by_slug
            .iter()
            .filter(|e| e.key() == &def.slug)
            .count() as i32
            + 1;
        self.workflow_definitions_by_slug
            .insert(def.slug.clone(), def.id);
        self.workflow_definitions.insert(def.id, def.clone());
        Ok(def)
    }

    async fn get_workflow_definition_by_slug(&self, slug: &str) -> Result<WorkflowDefinition> {
        let id = *self
            .workflow_definitions_by_slug
            .get(slug)
            .ok_or_else(|| PersistenceError::WorkflowDefinitionNotFound(slug.to_string()))?;
        self.get_workflow_definition(id).await
    }

    async fn get_workflow_definition(&self, id: Uuid) -> Result<WorkflowDefinition> {
        self.workflow_definitions
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| PersistenceError::WorkflowDefinitionNotFound(id.to_string()))
    }

    async fn list_active_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self
            .workflow_definitions
            .iter()
            .filter(|e| e.active)
            .map(|e| e.clone())
            .collect())
    }

    async fn update_workflow_schedule(
        &self,
        workflow_definition_id: Uuid,
        schedule: crate::model::WorkflowSchedule,
    ) -> Result<()> {
        let mut def = self
            .workflow_definitions
            .get_mut(&workflow_definition_id)
            .ok_or_else(|| PersistenceError::WorkflowDefinitionNotFound(workflow_definition_id.to_string()))?;
        def.schedule = Some(schedule);
        Ok(())
    }

    async fn update_workflow_event_triggers(
        &self,
        workflow_definition_id: Uuid,
        event_triggers: Vec<crate::model::WorkflowEventTrigger>,
    ) -> Result<()> {
        let mut def = self
            .workflow_definitions
            .get_mut(&workflow_definition_id)
            .ok_or_else(|| PersistenceError::WorkflowDefinitionNotFound(workflow_definition_id.to_string()))?;
        def.event_triggers = event_triggers;
        Ok(())
    }

    async fn create_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        self.workflow_runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_workflow_run(&self, id: Uuid) -> Result<WorkflowRun> {
        self.workflow_runs
            .get(&id)
            .map(|e| e.clone())
            .ok_or(PersistenceError::WorkflowRunNotFound(id))
    }

    async fn update_workflow_run_status(
        &self,
        id: Uuid,
        expected: WorkflowRunStatus,
        next: WorkflowRunStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        let mut entry = match self.workflow_runs.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::WorkflowRunNotFound(id)),
        };
        if entry.status != expected {
            return Ok(false);
        }
        entry.status = next;
        if error_message.is_some() {
            entry.error_message = error_message;
        }
        let now = Utc::now();
        if next == WorkflowRunStatus::Running && entry.started_at.is_none() {
            entry.started_at = Some(now);
        }
        if next.is_terminal() {
            entry.completed_at = Some(now);
        }
        entry.updated_at = now;
        Ok(true)
    }

    async fn update_workflow_run_shared(&self, id: Uuid, shared: Value) -> Result<bool> {
        let mut entry = match self.workflow_runs.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::WorkflowRunNotFound(id)),
        };
        entry.shared = shared;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn due_workflow_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>> {
        let mut due: Vec<WorkflowRun> = self
            .workflow_runs
            .iter()
            .filter(|e| e.status == WorkflowRunStatus::Pending)
            .map(|e| e.clone())
            .collect();
        due.sort_by_key(|r| r.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn create_workflow_run_step(&self, step: WorkflowRunStep) -> Result<WorkflowRunStep> {
        self.workflow_run_steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_workflow_run_step(&self, id: Uuid) -> Result<WorkflowRunStep> {
        self.workflow_run_steps
            .get(&id)
            .map(|e| e.clone())
            .ok_or(PersistenceError::WorkflowRunStepNotFound(id))
    }

    async fn list_workflow_run_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowRunStep>> {
        Ok(self
            .workflow_run_steps
            .iter()
            .filter(|e| e.workflow_run_id == run_id)
            .map(|e| e.clone())
            .collect())
    }

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
        let mut entry = match self.workflow_run_steps.get_mut(&id) {
            Some(e) => e,
            None => return Err(PersistenceError::WorkflowRunStepNotFound(id)),
        };
        if entry.status != expected {
            return Ok(false);
        }
        entry.status = next;
        if let Some(attempt) = attempt {
            entry.attempt = attempt;
        }
        if output.is_some() {
            entry.output = output;
        }
        if let Some(metrics) = metrics {
            entry.metrics = metrics;
        }
        if error_message.is_some() {
            entry.error_message = error_message;
        }
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_workflow_run_event(&self, event: WorkflowRunEvent) -> Result<()> {
        self.workflow_run_events
            .entry(event.workflow_run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_workflow_run_events(
        &self,
        workflow_run_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<WorkflowRunEvent>> {
        let mut events = self
            .workflow_run_events
            .get(&workflow_run_id)
            .map(|e| e.clone())
            .unwrap_or_default();
        events.sort_by_key(|e| (e.occurred_at, e.id));
        if let Some(cursor) = page.cursor {
            events.retain(|e| (e.occurred_at, e.id) > (cursor.occurred_at, cursor.id));
        }
        if page.limit > 0 {
            events.truncate(page.limit as usize);
        }
        Ok(events)
    }

    async fn record_produced_asset(&self, asset: ProducedAsset) -> Result<ProducedAsset> {
        let key = (asset.asset_id.to_lowercase(), asset.partition_key.clone());
        self.latest_assets.insert(key, asset.clone());
        Ok(asset)
    }

    async fn latest_asset(
        &self,
        asset_id: &str,
        partition_key: &str,
    ) -> Result<Option<ProducedAsset>> {
        let key = (asset_id.to_lowercase(), partition_key.to_string());
        Ok(self.latest_assets.get(&key).map(|e| e.clone()))
    }

    async fn try_acquire_lock(
        &self,
        namespace: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Result<bool> {
        let mut acquired = false;
        self.advisory_locks
            .entry(namespace.to_string())
            .and_modify(|lock| {
                if lock.owner_id == owner_id || lock.expires_at <= now {
                    lock.owner_id = owner_id.to_string();
                    lock.acquired_at = now;
                    lock.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                AdvisoryLock {
                    namespace: namespace.to_string(),
                    owner_id: owner_id.to_string(),
                    acquired_at: now,
                    expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                }
            });
        Ok(acquired)
    }

    async fn release_lock(&self, namespace: &str, owner_id: &str) -> Result<()> {
        self.advisory_locks
            .remove_if(namespace, |_, lock| lock.owner_id == owner_id);
        Ok(())
    }

    async fn get_lock(&self, namespace: &str) -> Result<Option<AdvisoryLock>> {
        Ok(self.advisory_locks.get(namespace).map(|e| e.clone()))
    }

    async fn record_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.audit_events.insert(event.id, event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job_run(def_id: Uuid) -> JobRun {
        let now = Utc::now();
        JobRun {
            id: Uuid::now_v7(),
            job_definition_id: def_id,
            status: JobRunStatus::Pending,
            parameters: Value::Null,
            result: None,
            metrics: Value::Null,
            error_message: None,
            error_kind: None,
            attempt: 0,
            max_attempts: 3,
            triggered_by: RunTrigger::Manual,
            workflow_run_step_id: None,
            trace_context: None,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryStore::new();
        let run = sample_job_run(Uuid::now_v7());
        store.create_job_run(run.clone()).await.unwrap();

        let first = store.claim_job_run(run.id).await.unwrap();
        assert!(first.is_some());
        let second = store.claim_job_run(run.id).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn complete_is_conditional_on_running() {
        let store = InMemoryStore::new();
        let run = sample_job_run(Uuid::now_v7());
        store.create_job_run(run.clone()).await.unwrap();

        let completed_before_claim = store
            .complete_job_run(run.id, Value::Null, Value::Null)
            .await
            .unwrap();
        assert!(!completed_before_claim);

        store.claim_job_run(run.id).await.unwrap();
        let completed = store.complete_job_run(run.id, Value::Null, Value::Null).await.unwrap();
        assert!(completed);

        let double_complete = store.complete_job_run(run.id, Value::Null, Value::Null).await.unwrap();
        assert!(!double_complete);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_expiry() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let ttl = std::time::Duration::from_secs(30);

        assert!(store
            .try_acquire_lock("scheduler", "owner-a", now, ttl)
            .await
            .unwrap());
        assert!(!store
            .try_acquire_lock("scheduler", "owner-b", now, ttl)
            .await
            .unwrap());

        let later = now + chrono::Duration::seconds(31);
        assert!(store
            .try_acquire_lock("scheduler", "owner-b", later, ttl)
            .await
            .unwrap());
    }
}
