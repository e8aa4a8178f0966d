//! Event-trigger evaluation (spec §4.E). Registered as a [`Consumer`] on
//! `QueueName::EventTrigger`; `dockyard-queue::api::enqueue_event_trigger_evaluation`
//! is the only thing that feeds it, after [`crate::ingest::ingest_event`] has
//! normalized and persisted the envelope.
//!
//! Triggers for the same source are evaluated sequentially (spec: "preserve
//! ordering"); different sources run concurrently because each envelope is
//! its own queue message and the queue itself fans work out across workers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dockyard_events::{DomainEvent, EventBus};
use dockyard_persistence::model::{RunTrigger, WorkflowDefinition, WorkflowEventTrigger, WorkflowRun, WorkflowRunStatus};
use dockyard_persistence::store::Store;
use dockyard_queue::api::enqueue_workflow_run;
use dockyard_queue::queue::{Consumer, Queue};
use dockyard_types::DockyardError;
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::ingest::EventIngestor;

/// How many consecutive evaluation failures pause a trigger (spec §4.E:
/// "pauses the trigger after N failures within a window").
const FAILURE_PAUSE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Filtered,
    Matched,
    Launched,
    Throttled,
    Skipped,
    Failed,
    Paused,
}

impl TriggerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerOutcome::Filtered => "filtered",
            TriggerOutcome::Matched => "matched",
            TriggerOutcome::Launched => "launched",
            TriggerOutcome::Throttled => "throttled",
            TriggerOutcome::Skipped => "skipped",
            TriggerOutcome::Failed => "failed",
            TriggerOutcome::Paused => "paused",
        }
    }
}

struct Window {
    last_fired: Option<Instant>,
    fires: VecDeque<Instant>,
}

impl Window {
    fn new() -> Self {
        Self {
            last_fired: None,
            fires: VecDeque::new(),
        }
    }
}

/// Per-trigger rate state. Kept separately from the persisted
/// `WorkflowEventTrigger` row because `min_interval`/`max_per_window`
/// bookkeeping is high-frequency and doesn't need to survive a restart —
/// losing it just means one extra fire window after a crash.
#[derive(Default)]
pub struct TriggerWindows {
    windows: DashMap<Uuid, Window>,
}

impl TriggerWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if firing now would respect both `min_interval` and
    /// `max_per_window`; if so, records the fire.
    fn admit(&self, trigger: &WorkflowEventTrigger) -> bool {
        let mut entry = self.windows.entry(trigger.id).or_insert_with(Window::new);
        let now = Instant::now();

        if let Some(last) = entry.last_fired {
            if now.duration_since(last) < trigger.min_interval {
                return false;
            }
        }

        let cutoff = now.checked_sub(trigger.window).unwrap_or(now);
        while matches!(entry.fires.front(), Some(t) if *t < cutoff) {
            entry.fires.pop_front();
        }
        if entry.fires.len() as u32 >= trigger.max_per_window {
            return false;
        }

        entry.fires.push_back(now);
        entry.last_fired = Some(now);
        true
    }
}

/// Resolves a dotted path (`"a.b.c"`) against a JSON value.
fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |acc, segment| acc.get(segment))
}

/// A predicate is a flat map of dotted payload path to expected literal
/// value; a trigger matches an envelope when every entry matches. An empty
/// predicate (`{}` or `null`) matches everything from its `source`.
pub fn predicate_matches(predicate: &Value, payload: &Value) -> bool {
    let Some(conditions) = predicate.as_object() else {
        return true;
    };
    conditions
        .iter()
        .all(|(path, expected)| resolve_path(payload, path) == Some(expected))
}

pub struct EventTriggerConsumer {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    events: Arc<EventBus>,
    windows: Arc<TriggerWindows>,
    ingestor: Arc<EventIngestor>,
}

impl EventTriggerConsumer {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        events: Arc<EventBus>,
        windows: Arc<TriggerWindows>,
        ingestor: Arc<EventIngestor>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            windows,
            ingestor,
        }
    }

    #[instrument(skip(self, envelope), fields(source = %envelope.source))]
    async fn evaluate(&self, envelope: &EventEnvelope) -> Result<(), DockyardError> {
        let definitions = self
            .store
            .list_active_workflow_definitions()
            .await
            .map_err(|err| DockyardError::new((&err).into(), err.to_string()))?;

        let mut any_failed = false;
        let mut any_evaluated = false;

        for definition in definitions {
            let mut triggers = definition.event_triggers.clone();
            let mut dirty = false;

            for trigger in triggers.iter_mut().filter(|t| t.source == envelope.source) {
                let outcome = self.evaluate_one(&definition, trigger, envelope).await;
                any_evaluated = true;
                if matches!(outcome, TriggerOutcome::Launched | TriggerOutcome::Matched) {
                    trigger.failure_count = 0;
                    trigger.last_error = None;
                    trigger.paused_until = None;
                    dirty = true;
                } else if outcome == TriggerOutcome::Failed {
                    any_failed = true;
                    trigger.failure_count += 1;
                    trigger.last_error = Some("trigger evaluation failed".to_string());
                    if trigger.failure_count >= FAILURE_PAUSE_THRESHOLD {
                        trigger.paused_until = Some(Utc::now() + trigger.window);
                    }
                    dirty = true;
                }
            }

            if dirty {
                if let Err(err) = self
                    .store
                    .update_workflow_event_triggers(definition.id, triggers)
                    .await
                {
                    warn!(workflow_definition_id = %definition.id, error = %err, "failed to persist trigger state");
                }
            }
        }

        if any_evaluated {
            self.ingestor.record_source_result(&envelope.source, !any_failed);
        }

        Ok(())
    }

    async fn evaluate_one(
        &self,
        definition: &WorkflowDefinition,
        trigger: &WorkflowEventTrigger,
        envelope: &EventEnvelope,
    ) -> TriggerOutcome {
        if !trigger.active {
            return TriggerOutcome::Skipped;
        }
        if trigger.paused_until.is_some_and(|until| until > Utc::now()) {
            return TriggerOutcome::Paused;
        }
        if !predicate_matches(&trigger.predicate, &envelope.payload) {
            return TriggerOutcome::Filtered;
        }
        if !self.windows.admit(trigger) {
            return TriggerOutcome::Throttled;
        }

        match self.launch(definition, envelope).await {
            Ok(()) => {
                self.events.publish(DomainEvent::EventTriggerFired {
                    trigger_id: trigger.id,
                    source: envelope.source.clone(),
                    payload: envelope.payload.clone(),
                    occurred_at: Utc::now(),
                });
                TriggerOutcome::Launched
            }
            Err(err) => {
                warn!(trigger_id = %trigger.id, error = %err, "trigger launch failed");
                TriggerOutcome::Failed
            }
        }
    }

    async fn launch(&self, definition: &WorkflowDefinition, envelope: &EventEnvelope) -> Result<(), DockyardError> {
        let now = Utc::now();
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_definition_id: definition.id,
            status: WorkflowRunStatus::Pending,
            parameters: definition.default_parameters.clone(),
            shared: Value::Object(Default::default()),
            metrics: Value::Object(Default::default()),
            triggered_by: RunTrigger::Event,
            trigger_payload: Some(envelope.to_json()),
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
            .map_err(|err| DockyardError::new((&err).into(), err.to_string()))?;

        enqueue_workflow_run(&self.store, &self.queue, created.id)
            .await
            .map_err(|err| DockyardError::from(&err))?;
        Ok(())
    }
}

#[async_trait]
impl Consumer for EventTriggerConsumer {
    async fn consume(&self, _message_id: Uuid, payload: Value) -> Result<(), DockyardError> {
        let envelope: EventEnvelope = serde_json::from_value(payload)
            .map_err(|err| DockyardError::validation(format!("invalid event envelope: {err}")))?;
        self.evaluate(&envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicate_matches_flat_equality() {
        let predicate = json!({"action": "push", "ref": "refs/heads/main"});
        let payload = json!({"action": "push", "ref": "refs/heads/main", "extra": 1});
        assert!(predicate_matches(&predicate, &payload));
    }

    #[test]
    fn predicate_rejects_mismatch() {
        let predicate = json!({"action": "push"});
        let payload = json!({"action": "close"});
        assert!(!predicate_matches(&predicate, &payload));
    }

    #[test]
    fn empty_predicate_matches_everything() {
        assert!(predicate_matches(&json!({}), &json!({"anything": true})));
    }

    #[test]
    fn nested_path_resolves_with_dots() {
        let predicate = json!({"repository.name": "dockyard"});
        let payload = json!({"repository": {"name": "dockyard"}});
        assert!(predicate_matches(&predicate, &payload));
    }

    #[test]
    fn window_enforces_min_interval() {
        let windows = TriggerWindows::new();
        let trigger = WorkflowEventTrigger {
            id: Uuid::now_v7(),
            source: "github".into(),
            predicate: json!({}),
            min_interval: Duration::from_secs(3600),
            max_per_window: 100,
            window: Duration::from_secs(3600),
            active: true,
            failure_count: 0,
            last_error: None,
            paused_until: None,
        };
        assert!(windows.admit(&trigger));
        assert!(!windows.admit(&trigger));
    }

    #[test]
    fn window_enforces_max_per_window() {
        let windows = TriggerWindows::new();
        let trigger = WorkflowEventTrigger {
            id: Uuid::now_v7(),
            source: "github".into(),
            predicate: json!({}),
            min_interval: Duration::from_secs(0),
            max_per_window: 2,
            window: Duration::from_secs(3600),
            active: true,
            failure_count: 0,
            last_error: None,
            paused_until: None,
        };
        assert!(windows.admit(&trigger));
        assert!(windows.admit(&trigger));
        assert!(!windows.admit(&trigger));
    }
}
