//! Subscribes to the in-process event bus and folds domain events into the
//! metrics registry (spec §4.I: "pure map from queue/state events to a
//! metrics registry"). Grounded in `everruns-observability::emitter::
//! ObservableEventEmitter`'s pattern of tracking a started-at timestamp per
//! in-flight unit of work so the completion event can report a duration,
//! generalized here from per-session LLM/tool spans to per-run job/workflow
//! spans.

use std::sync::Arc;

use dashmap::DashMap;
use dockyard_events::{DomainEvent, EventBus};
use tracing::trace;
use uuid::Uuid;

use crate::registry::MetricsRegistry;

pub struct TelemetryCollector {
    registry: Arc<MetricsRegistry>,
    job_started_at: DashMap<Uuid, chrono::DateTime<chrono::Utc>>,
    workflow_started_at: DashMap<Uuid, chrono::DateTime<chrono::Utc>>,
}

impl TelemetryCollector {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self {
            registry,
            job_started_at: DashMap::new(),
            workflow_started_at: DashMap::new(),
        }
    }

    /// Runs forever, draining every event type the registry cares about.
    /// Intended to be spawned once at process startup alongside the
    /// auto-materializer, mirroring `AutoMaterializer::run`'s named-branch
    /// `tokio::select!` shape.
    pub async fn run(self: Arc<Self>, events: Arc<EventBus>) {
        let mut job_scheduled = events.subscribe("job_run_scheduled");
        let mut job_started = events.subscribe("job_run_started");
        let mut job_succeeded = events.subscribe("job_run_succeeded");
        let mut job_failed = events.subscribe("job_run_failed");
        let mut workflow_started = events.subscribe("workflow_run_started");
        let mut workflow_succeeded = events.subscribe("workflow_run_succeeded");
        let mut workflow_failed = events.subscribe("workflow_run_failed");
        let mut workflow_canceled = events.subscribe("workflow_run_canceled");
        let mut step_completed = events.subscribe("workflow_run_step_completed");
        let mut definition_updated = events.subscribe("workflow_definition_updated");
        let mut asset_produced = events.subscribe("asset_produced");
        let mut asset_expired = events.subscribe("asset_expired");
        let mut leader_acquired = events.subscribe("schedule_leader_acquired");
        let mut leader_lost = events.subscribe("schedule_leader_lost");
        let mut trigger_fired = events.subscribe("event_trigger_fired");
        let mut source_paused = events.subscribe("event_source_paused");
        let mut queue_enqueued = events.subscribe("queue_task_enqueued");

        loop {
            tokio::select! {
                Ok(event) = job_scheduled.recv() => self.handle(event),
                Ok(event) = job_started.recv() => self.handle(event),
                Ok(event) = job_succeeded.recv() => self.handle(event),
                Ok(event) = job_failed.recv() => self.handle(event),
                Ok(event) = workflow_started.recv() => self.handle(event),
                Ok(event) = workflow_succeeded.recv() => self.handle(event),
                Ok(event) = workflow_failed.recv() => self.handle(event),
                Ok(event) = workflow_canceled.recv() => self.handle(event),
                Ok(event) = step_completed.recv() => self.handle(event),
                Ok(event) = definition_updated.recv() => self.handle(event),
                Ok(event) = asset_produced.recv() => self.handle(event),
                Ok(event) = asset_expired.recv() => self.handle(event),
                Ok(event) = leader_acquired.recv() => self.handle(event),
                Ok(event) = leader_lost.recv() => self.handle(event),
                Ok(event) = trigger_fired.recv() => self.handle(event),
                Ok(event) = source_paused.recv() => self.handle(event),
                Ok(event) = queue_enqueued.recv() => self.handle(event),
            }
        }
    }

    fn handle(&self, event: DomainEvent) {
        trace!(event_type = event.type_name(), "telemetry collector observed event");
        match event {
            DomainEvent::JobRunScheduled { .. } => {
                self.registry.incr("job_runs.scheduled", 1);
            }
            DomainEvent::JobRunStarted { job_run_id, occurred_at, .. } => {
                self.job_started_at.insert(job_run_id, occurred_at);
                self.registry.incr("job_runs.started", 1);
            }
            DomainEvent::JobRunSucceeded { job_run_id, occurred_at } => {
                self.registry.incr("job_runs.succeeded", 1);
                self.record_duration(&self.job_started_at, job_run_id, occurred_at, "job_run.duration_ms");
            }
            DomainEvent::JobRunFailed { job_run_id, retryable, occurred_at } => {
                self.registry.incr(if retryable { "job_runs.failed.retryable" } else { "job_runs.failed.terminal" }, 1);
                self.record_duration(&self.job_started_at, job_run_id, occurred_at, "job_run.duration_ms");
            }
            DomainEvent::WorkflowRunStarted { workflow_run_id, occurred_at, .. } => {
                self.workflow_started_at.insert(workflow_run_id, occurred_at);
                self.registry.incr("workflow_runs.started", 1);
            }
            DomainEvent::WorkflowRunSucceeded { workflow_run_id, occurred_at } => {
                self.registry.incr("workflow_runs.succeeded", 1);
                self.record_duration(&self.workflow_started_at, workflow_run_id, occurred_at, "workflow_run.duration_ms");
            }
            DomainEvent::WorkflowRunFailed { workflow_run_id, occurred_at } => {
                self.registry.incr("workflow_runs.failed", 1);
                self.record_duration(&self.workflow_started_at, workflow_run_id, occurred_at, "workflow_run.duration_ms");
            }
            DomainEvent::WorkflowRunCanceled { workflow_run_id, occurred_at } => {
                self.registry.incr("workflow_runs.canceled", 1);
                self.record_duration(&self.workflow_started_at, workflow_run_id, occurred_at, "workflow_run.duration_ms");
            }
            DomainEvent::WorkflowRunStepCompleted { succeeded, .. } => {
                self.registry.incr(if succeeded { "workflow_run_steps.succeeded" } else { "workflow_run_steps.failed" }, 1);
            }
            DomainEvent::WorkflowDefinitionUpdated { .. } => {
                self.registry.incr("workflow_definitions.updated", 1);
            }
            DomainEvent::AssetProduced { .. } => {
                self.registry.incr("assets.produced", 1);
            }
            DomainEvent::AssetExpired { .. } => {
                self.registry.incr("assets.expired", 1);
            }
            DomainEvent::ScheduleLeaderAcquired { .. } => {
                self.registry.set_gauge("schedule_leader.held", 1);
                self.registry.incr("schedule_leader.acquired_total", 1);
            }
            DomainEvent::ScheduleLeaderLost { .. } => {
                self.registry.set_gauge("schedule_leader.held", 0);
            }
            DomainEvent::EventTriggerFired { .. } => {
                self.registry.incr("event_triggers.fired", 1);
            }
            DomainEvent::EventSourcePaused { .. } => {
                self.registry.incr("event_sources.paused", 1);
            }
            DomainEvent::QueueTaskEnqueued { queue, .. } => {
                self.registry.incr(format!("queue.{queue}.enqueued"), 1);
            }
        }
    }

    fn record_duration(
        &self,
        started_at: &DashMap<Uuid, chrono::DateTime<chrono::Utc>>,
        id: Uuid,
        completed_at: chrono::DateTime<chrono::Utc>,
        histogram: &str,
    ) {
        if let Some((_, start)) = started_at.remove(&id) {
            let duration_ms = (completed_at - start).num_milliseconds().max(0) as f64;
            self.registry.observe(histogram.to_string(), duration_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn job_success_increments_counter_and_records_duration() {
        let registry = Arc::new(MetricsRegistry::new());
        let collector = TelemetryCollector::new(registry.clone());
        let job_run_id = Uuid::now_v7();
        let started = Utc::now();

        collector.handle(DomainEvent::JobRunStarted { job_run_id, attempt: 1, occurred_at: started });
        collector.handle(DomainEvent::JobRunSucceeded {
            job_run_id,
            occurred_at: started + chrono::Duration::milliseconds(25),
        });

        assert_eq!(registry.gauge("job_runs.succeeded"), 1);
        let hist = registry.histogram("job_run.duration_ms");
        assert_eq!(hist.count, 1);
        assert!((hist.sum_ms - 25.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn queue_enqueue_is_keyed_per_queue() {
        let registry = Arc::new(MetricsRegistry::new());
        let collector = TelemetryCollector::new(registry.clone());

        collector.handle(DomainEvent::QueueTaskEnqueued {
            queue: "workflow".to_string(),
            task_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
        });

        assert_eq!(registry.gauge("queue.workflow.enqueued"), 1);
        assert_eq!(registry.gauge("queue.event.enqueued"), 0);
    }

    #[tokio::test]
    async fn schedule_leader_gauge_tracks_acquire_and_loss() {
        let registry = Arc::new(MetricsRegistry::new());
        let collector = TelemetryCollector::new(registry.clone());

        collector.handle(DomainEvent::ScheduleLeaderAcquired { owner_id: "a".into(), occurred_at: Utc::now() });
        assert_eq!(registry.gauge("schedule_leader.held"), 1);

        collector.handle(DomainEvent::ScheduleLeaderLost { owner_id: "a".into(), occurred_at: Utc::now() });
        assert_eq!(registry.gauge("schedule_leader.held"), 0);
    }
}
