//! Schedule materialization (spec §4.G), run only while this process holds
//! schedule leadership ([`crate::leader::ScheduleLeader`]). Fire times are
//! computed with the `cron` crate (a net-new dependency: no pack repo
//! carries a cron evaluator) against the schedule's own timezone via
//! `chrono-tz`.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use dockyard_events::{DomainEvent, EventBus};
use dockyard_persistence::model::{RunTrigger, WorkflowDefinition, WorkflowRun, WorkflowRunStatus, WorkflowSchedule};
use dockyard_persistence::store::Store;
use dockyard_queue::api::enqueue_workflow_run;
use dockyard_queue::queue::Queue;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::leader::ScheduleLeader;
use crate::metrics::{ScheduleOutcome, ScheduleRing};

pub struct ScheduleMaterializer {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    events: Arc<EventBus>,
    leader: Arc<ScheduleLeader>,
    ring: Arc<ScheduleRing>,
}

impl ScheduleMaterializer {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        events: Arc<EventBus>,
        leader: Arc<ScheduleLeader>,
        ring: Arc<ScheduleRing>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            leader,
            ring,
        }
    }

    /// One materialization pass over every active, scheduled workflow
    /// definition. No-ops entirely if this process isn't the leader.
    pub async fn run_once(&self) {
        if !self.leader.is_leader() {
            return;
        }

        let definitions = match self.store.list_active_workflow_definitions().await {
            Ok(defs) => defs,
            Err(err) => {
                error!(error = %err, "failed to list workflow definitions for schedule scan");
                return;
            }
        };

        for definition in definitions {
            if definition.schedule.is_some() {
                self.materialize_one(definition).await;
            }
        }
    }

    async fn materialize_one(&self, definition: WorkflowDefinition) {
        let lock_namespace = format!("schedule:{}", definition.id);
        let owner_id = format!("materializer-{}", definition.id);
        let acquired = match self
            .store
            .try_acquire_lock(&lock_namespace, &owner_id, Utc::now(), std::time::Duration::from_secs(30))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                self.ring.push(ScheduleOutcome::lock_contention(definition.id));
                false
            }
            Err(err) => {
                error!(error = %err, workflow_definition_id = %definition.id, "schedule lock acquisition failed");
                false
            }
        };
        if !acquired {
            return;
        }
        self.ring.push(ScheduleOutcome::lock_acquired(definition.id));

        let schedule = definition.schedule.clone().expect("checked by caller");
        let fire_times = match compute_fire_times(&schedule, Utc::now()) {
            Ok(times) => times,
            Err(err) => {
                warn!(error = %err, workflow_definition_id = %definition.id, "invalid cron expression");
                self.ring.push(ScheduleOutcome::error(definition.id, err));
                let _ = self.store.release_lock(&lock_namespace, &owner_id).await;
                return;
            }
        };

        if fire_times.is_empty() {
            self.ring.push(ScheduleOutcome::skipped(definition.id));
            let _ = self.store.release_lock(&lock_namespace, &owner_id).await;
            return;
        }

        let mut created = 0usize;
        for fire_time in &fire_times {
            match self.create_and_enqueue(&definition, *fire_time).await {
                Ok(()) => created += 1,
                Err(err) => error!(error = %err, workflow_definition_id = %definition.id, "failed to materialize scheduled run"),
            }
        }

        let mut updated = schedule;
        let window_end = *fire_times.last().unwrap();
        updated.last_materialized_window_end = Some(window_end);
        updated.catch_up_cursor = Some(window_end);
        updated.schedule_next_run_at = next_fire_after(&updated, window_end).ok().flatten();

        if let Err(err) = self.store.update_workflow_schedule(definition.id, updated).await {
            error!(error = %err, workflow_definition_id = %definition.id, "failed to persist schedule bookkeeping");
        }

        self.ring.push(ScheduleOutcome::processed(definition.id, created));
        let _ = self.store.release_lock(&lock_namespace, &owner_id).await;
    }

    async fn create_and_enqueue(
        &self,
        definition: &WorkflowDefinition,
        fire_time: DateTime<Utc>,
    ) -> Result<(), String> {
        let now = Utc::now();
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_definition_id: definition.id,
            status: WorkflowRunStatus::Pending,
            parameters: definition.default_parameters.clone(),
            shared: json!({}),
            metrics: json!({}),
            triggered_by: RunTrigger::Schedule,
            trigger_payload: Some(json!({ "scheduledFor": fire_time.to_rfc3339() })),
            trace_context: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        let created = self
            .store
            .create_workflow_run(run)
            .await
            .map_err(|err| err.to_string())?;

        enqueue_workflow_run(&self.store, &self.queue, created.id)
            .await
            .map_err(|err| err.to_string())?;

        self.events.publish(DomainEvent::WorkflowRunStarted {
            workflow_run_id: created.id,
            workflow_definition_id: definition.id,
            occurred_at: now,
        });

        info!(workflow_run_id = %created.id, workflow_definition_id = %definition.id, %fire_time, "materialized scheduled run");
        Ok(())
    }
}

/// Computes fire times in `[cursor, now]` (or `[cursor, endWindow]` if
/// earlier), respecting `startWindow` as a floor and collapsing to the
/// single latest fire time when `catchUp` is false.
fn compute_fire_times(schedule: &WorkflowSchedule, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, String> {
    let tz: Tz = schedule
        .timezone
        .parse()
        .map_err(|_| format!("unknown timezone `{}`", schedule.timezone))?;
    let cron_schedule =
        CronSchedule::from_str(&schedule.cron_expression).map_err(|err| format!("invalid cron expression: {err}"))?;

    let cursor = schedule
        .catch_up_cursor
        .or(schedule.last_materialized_window_end)
        .or(schedule.start_window)
        .unwrap_or(now);
    let floor = schedule.start_window.map(|w| w.max(cursor)).unwrap_or(cursor);
    let ceiling = schedule.end_window.map(|w| w.min(now)).unwrap_or(now);

    if floor >= ceiling {
        return Ok(Vec::new());
    }

    let mut fire_times: Vec<DateTime<Utc>> = cron_schedule
        .after(&floor.with_timezone(&tz))
        .map(|dt| dt.with_timezone(&Utc))
        .take_while(|dt| *dt <= ceiling)
        .collect();

    if !schedule.catch_up {
        if let Some(latest) = fire_times.pop() {
            fire_times = vec![latest];
        }
    }

    Ok(fire_times)
}

fn next_fire_after(schedule: &WorkflowSchedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    let tz: Tz = schedule
        .timezone
        .parse()
        .map_err(|_| format!("unknown timezone `{}`", schedule.timezone))?;
    let cron_schedule =
        CronSchedule::from_str(&schedule.cron_expression).map_err(|err| format!("invalid cron expression: {err}"))?;
    Ok(cron_schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn minutely_schedule(catch_up: bool) -> WorkflowSchedule {
        WorkflowSchedule {
            cron_expression: "0 * * * * *".to_string(),
            timezone: "UTC".to_string(),
            catch_up,
            start_window: None,
            end_window: None,
            catch_up_cursor: None,
            last_materialized_window_end: None,
            schedule_next_run_at: None,
        }
    }

    #[test]
    fn catch_up_collapses_to_latest_fire() {
        let now = Utc::now();
        let mut schedule = minutely_schedule(false);
        schedule.catch_up_cursor = Some(now - ChronoDuration::hours(2));
        let fires = compute_fire_times(&schedule, now).unwrap();
        assert_eq!(fires.len(), 1);
    }

    #[test]
    fn catch_up_true_returns_every_fire_in_window() {
        let now = Utc::now();
        let mut schedule = minutely_schedule(true);
        schedule.catch_up_cursor = Some(now - ChronoDuration::minutes(5));
        let fires = compute_fire_times(&schedule, now).unwrap();
        assert!(fires.len() >= 3);
    }

    #[test]
    fn empty_window_produces_no_fires() {
        let now = Utc::now();
        let mut schedule = minutely_schedule(true);
        schedule.catch_up_cursor = Some(now + ChronoDuration::minutes(5));
        let fires = compute_fire_times(&schedule, now).unwrap();
        assert!(fires.is_empty());
    }
}
