//! Event-bus subscriber driving the materializer (spec §4.F). Subscribes to
//! the event types the graph cares about and, for each, runs the
//! "consider enqueue" guards before materializing a new `WorkflowRun`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockyard_events::{DomainEvent, EventBus};
use dockyard_persistence::model::{RunTrigger, WorkflowRun, WorkflowRunStatus};
use dockyard_persistence::store::Store;
use dockyard_queue::api::enqueue_workflow_run;
use dockyard_queue::queue::Queue;
use dockyard_types::RetryPolicy;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::graph::MaterializerGraph;

const EVENT_TYPES: &[&str] = &[
    "workflow_definition_updated",
    "asset_produced",
    "asset_expired",
    "workflow_run_succeeded",
    "workflow_run_failed",
    "workflow_run_canceled",
];

const BASE_BACKOFF: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(3600);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub struct AutoMaterializer {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    events: Arc<EventBus>,
    graph: Arc<MaterializerGraph>,
    retry_policy: RetryPolicy,
}

impl AutoMaterializer {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, events: Arc<EventBus>, graph: Arc<MaterializerGraph>) -> Self {
        Self {
            store,
            queue,
            events,
            graph,
            retry_policy: RetryPolicy::exponential(),
        }
    }

    /// Runs forever, draining the event bus and the periodic graph-refresh
    /// safety net. Intended to be spawned once at process startup.
    pub async fn run(self: Arc<Self>) {
        self.graph.refresh(&self.store).await;

        let mut definition_updated = self.events.subscribe("workflow_definition_updated");
        let mut asset_produced = self.events.subscribe("asset_produced");
        let mut asset_expired = self.events.subscribe("asset_expired");
        let mut run_succeeded = self.events.subscribe("workflow_run_succeeded");
        let mut run_failed = self.events.subscribe("workflow_run_failed");
        let mut run_canceled = self.events.subscribe("workflow_run_canceled");
        let mut refresh_ticker = tokio::time::interval(DEFAULT_REFRESH_INTERVAL);

        loop {
            tokio::select! {
                Ok(event) = definition_updated.recv() => self.handle(event).await,
                Ok(event) = asset_produced.recv() => self.handle(event).await,
                Ok(event) = asset_expired.recv() => self.handle(event).await,
                Ok(event) = run_succeeded.recv() => self.handle(event).await,
                Ok(event) = run_failed.recv() => self.handle(event).await,
                Ok(event) = run_canceled.recv() => self.handle(event).await,
                _ = refresh_ticker.tick() => {
                    self.graph.refresh(&self.store).await;
                }
            }
        }
    }

    async fn handle(&self, event: DomainEvent) {
        match event {
            DomainEvent::WorkflowDefinitionUpdated { workflow_definition_id, .. } => {
                match self.store.get_workflow_definition(workflow_definition_id).await {
                    Ok(definition) => self.graph.upsert_definition(&definition),
                    Err(err) => warn!(error = %err, "failed to refresh updated workflow definition"),
                }
            }
            DomainEvent::AssetProduced {
                asset_id,
                partition_key,
                workflow_run_id,
                occurred_at,
            } => {
                self.handle_asset_produced(&asset_id, &partition_key, workflow_run_id, occurred_at).await;
            }
            DomainEvent::AssetExpired { asset_id, partition_key, .. } => {
                self.handle_asset_expired(&asset_id, &partition_key).await;
            }
            DomainEvent::WorkflowRunSucceeded { workflow_run_id, .. } => {
                if let Ok(run) = self.store.get_workflow_run(workflow_run_id).await {
                    self.graph.clear_in_flight(run.workflow_definition_id, workflow_run_id);
                    self.graph.record_success(run.workflow_definition_id);
                }
            }
            DomainEvent::WorkflowRunFailed { workflow_run_id, .. } => {
                if let Ok(run) = self.store.get_workflow_run(workflow_run_id).await {
                    self.graph.clear_in_flight(run.workflow_definition_id, workflow_run_id);
                    self.graph
                        .record_failure(run.workflow_definition_id, &self.retry_policy, BASE_BACKOFF, MAX_BACKOFF);
                }
            }
            DomainEvent::WorkflowRunCanceled { workflow_run_id, .. } => {
                if let Ok(run) = self.store.get_workflow_run(workflow_run_id).await {
                    self.graph.clear_in_flight(run.workflow_definition_id, workflow_run_id);
                }
            }
            _ => {}
        }
    }

    async fn handle_asset_produced(
        &self,
        asset_id: &str,
        partition_key: &str,
        producing_run_id: Uuid,
        produced_at: chrono::DateTime<Utc>,
    ) {
        let producing_workflow_id = match self.store.get_workflow_run(producing_run_id).await {
            Ok(run) => run.workflow_definition_id,
            Err(err) => {
                warn!(error = %err, "could not resolve producing workflow for asset.produced");
                return;
            }
        };

        for consumer_id in self.graph.consumers_of(asset_id) {
            self.graph
                .record_produced_asset(producing_workflow_id, asset_id, Some(partition_key), produced_at, producing_run_id);

            let Some(config) = self.graph.config_of(consumer_id) else { continue };
            if !config.on_upstream_update {
                continue;
            }

            let latest = self.graph.latest_materialization(consumer_id, asset_id, partition_key);
            let upstream_is_newer = latest.as_ref().map(|l| l.produced_at < produced_at).unwrap_or(true);

            let normalized = dockyard_types::AssetId::new(asset_id).normalized;
            let max_staleness = config.consumes.get(&normalized).and_then(|c| c.max_staleness);
            let consumer_is_stale = match (&latest, max_staleness) {
                (Some(l), Some(max_staleness)) => {
                    Utc::now() - l.produced_at >= chrono::Duration::from_std(max_staleness).unwrap_or_default()
                }
                (None, Some(_)) => true,
                _ => false,
            };

            // Record this production as the one the consumer has now
            // evaluated, whether or not it triggers a run: the next
            // production's `upstream_is_newer`/`consumer_is_stale` checks
            // compare against whatever was last evaluated, not just what
            // was last consumed.
            self.graph
                .record_produced_asset(consumer_id, asset_id, Some(partition_key), produced_at, producing_run_id);

            if !upstream_is_newer && !consumer_is_stale {
                continue;
            }

            let reason = if upstream_is_newer { "upstream_update" } else { "max_staleness_exceeded" };
            self.consider_enqueue(consumer_id, reason, asset_id, partition_key).await;
        }
    }

    async fn handle_asset_expired(&self, asset_id: &str, partition_key: &str) {
        // "if no newer production exists, consider enqueuing the workflow
        // itself" (spec §4.F) — the workflow that *produces* this asset,
        // not its consumers.
        for (workflow_id, config) in self.all_producers_of(asset_id) {
            let has_newer = self
                .graph
                .latest_materialization(workflow_id, asset_id, partition_key)
                .is_some();
            if has_newer {
                continue;
            }
            let _ = &config;
            self.consider_enqueue(workflow_id, "asset_expired", asset_id, partition_key).await;
        }
    }

    fn all_producers_of(&self, asset_id: &str) -> Vec<(Uuid, crate::graph::WorkflowConfig)> {
        // The graph indexes consumers, not producers, by asset; producers
        // are looked up the same way the consumer-driven initial graph
        // build populates `produces`, so this walks every known workflow
        // rather than a second reverse index kept only for this one path.
        self.graph.known_workflows_producing(asset_id)
    }

    async fn consider_enqueue(&self, workflow_id: Uuid, reason: &str, asset_id: &str, partition_key: &str) {
        if self.graph.has_in_flight(workflow_id) {
            return;
        }
        if !self.graph.is_eligible(workflow_id) {
            return;
        }

        let definition = match self.store.get_workflow_definition(workflow_id).await {
            Ok(def) if def.active => def,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "consider_enqueue: workflow definition lookup failed");
                return;
            }
        };

        let now = Utc::now();
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_definition_id: definition.id,
            status: WorkflowRunStatus::Pending,
            parameters: definition.default_parameters.clone(),
            shared: json!({}),
            metrics: json!({}),
            triggered_by: RunTrigger::Asset,
            trigger_payload: Some(json!({
                "reason": reason,
                "assetId": asset_id,
                "partitionKey": partition_key,
            })),
            trace_context: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        let created = match self.store.create_workflow_run(run).await {
            Ok(run) => run,
            Err(err) => {
                error!(error = %err, "failed to create auto-materialization run");
                return;
            }
        };

        self.graph.mark_in_flight(workflow_id, created.id);

        if let Err(err) = enqueue_workflow_run(&self.store, &self.queue, created.id).await {
            error!(error = %err, "failed to enqueue auto-materialization run");
            self.graph.clear_in_flight(workflow_id, created.id);
            return;
        }

        self.events.publish(DomainEvent::WorkflowRunStarted {
            workflow_run_id: created.id,
            workflow_definition_id: workflow_id,
            occurred_at: now,
        });

        info!(workflow_id = %workflow_id, workflow_run_id = %created.id, reason, "auto-materialized workflow run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dockyard_persistence::model::{AssetDeclaration, WorkflowDefinition};
    use dockyard_persistence::InMemoryStore;
    use dockyard_queue::inline::InlineQueue;
    use dockyard_queue::queue::{Consumer, QueueName};
    use serde_json::{json, Value as Json};

    struct NoopConsumer;

    #[async_trait]
    impl Consumer for NoopConsumer {
        async fn consume(&self, _message_id: Uuid, _payload: Json) -> Result<(), dockyard_types::DockyardError> {
            Ok(())
        }
    }

    async fn seed(store: &Arc<dyn Store>) -> (Uuid, Uuid, Uuid) {
        let producer = store
            .create_workflow_definition(WorkflowDefinition {
                id: Uuid::now_v7(),
                slug: "producer".to_string(),
                version: 1,
                steps: vec![dockyard_persistence::model::WorkflowStep::Job {
                    id: "produce".to_string(),
                    job_slug: "test.produce".to_string(),
                    parameter_template: json!({}),
                    retry_override: None,
                    timeout_override: None,
                    store_result_as: None,
                    produces: vec![AssetDeclaration {
                        asset_id: "raw/orders".to_string(),
                        partition_key_template: None,
                        max_age: None,
                        cadence: None,
                    }],
                    depends_on: vec![],
                }],
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

        let consumer = store
            .create_workflow_definition(WorkflowDefinition {
                id: Uuid::now_v7(),
                slug: "consumer".to_string(),
                version: 1,
                steps: vec![],
                consumes: vec![dockyard_persistence::model::WorkflowAssetConsumer {
                    asset_id: "raw/orders".to_string(),
                    partition_key_template: None,
                    max_staleness: None,
                }],
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
        let producing_run = store
            .create_workflow_run(WorkflowRun {
                id: Uuid::now_v7(),
                workflow_definition_id: producer.id,
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

        (producer.id, consumer.id, producing_run.id)
    }

    fn materializer(store: Arc<dyn Store>, events: Arc<EventBus>) -> Arc<AutoMaterializer> {
        let queue: Arc<dyn Queue> = Arc::new(InlineQueue::new(events.clone()));
        queue.register_consumer(QueueName::Workflow, Arc::new(NoopConsumer));
        Arc::new(AutoMaterializer::new(store, queue, events, Arc::new(MaterializerGraph::new())))
    }

    #[tokio::test]
    async fn asset_produced_enqueues_a_run_for_the_interested_consumer() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let (_producer_id, consumer_id, producing_run_id) = seed(&store).await;

        let materializer = materializer(store.clone(), events.clone());
        materializer.graph.refresh(&store).await;

        materializer
            .handle(DomainEvent::AssetProduced {
                asset_id: "raw/orders".to_string(),
                partition_key: "default".to_string(),
                workflow_run_id: producing_run_id,
                occurred_at: Utc::now(),
            })
            .await;

        assert!(materializer.graph.has_in_flight(consumer_id));
    }

    #[tokio::test]
    async fn an_already_in_flight_consumer_is_not_enqueued_twice() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let (_producer_id, consumer_id, producing_run_id) = seed(&store).await;

        let materializer = materializer(store.clone(), events.clone());
        materializer.graph.refresh(&store).await;
        materializer.graph.mark_in_flight(consumer_id, Uuid::now_v7());

        materializer
            .handle(DomainEvent::AssetProduced {
                asset_id: "raw/orders".to_string(),
                partition_key: "default".to_string(),
                workflow_run_id: producing_run_id,
                occurred_at: Utc::now(),
            })
            .await;

        // Still exactly the one in-flight run we seeded, not a second one.
        assert!(materializer.graph.has_in_flight(consumer_id));
    }

    #[tokio::test]
    async fn max_staleness_triggers_enqueue_even_when_upstream_is_not_newer() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let (_producer_id, consumer_id, producing_run_id) = seed(&store).await;

        // Rewrite the consumer's declaration with a tight max_staleness so
        // an already-evaluated, non-newer production still re-qualifies.
        let mut rewritten = store.get_workflow_definition(consumer_id).await.unwrap();
        rewritten.consumes[0].max_staleness = Some(Duration::from_secs(1));

        let materializer = materializer(store.clone(), events.clone());
        materializer.graph.upsert_definition(&rewritten);

        let stale_at = Utc::now() - chrono::Duration::seconds(5);
        materializer
            .graph
            .record_produced_asset(consumer_id, "raw/orders", Some("default"), stale_at, producing_run_id);

        materializer
            .handle(DomainEvent::AssetProduced {
                asset_id: "raw/orders".to_string(),
                partition_key: "default".to_string(),
                workflow_run_id: producing_run_id,
                occurred_at: stale_at,
            })
            .await;

        assert!(materializer.graph.has_in_flight(consumer_id));
    }

    #[tokio::test]
    async fn workflow_run_succeeded_clears_in_flight_and_failure_state() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let (producer_id, _consumer_id, run_id) = seed(&store).await;

        let materializer = materializer(store.clone(), events.clone());
        materializer.graph.mark_in_flight(producer_id, run_id);
        materializer.graph.record_failure(
            producer_id,
            &RetryPolicy::exponential(),
            Duration::from_secs(30),
            Duration::from_secs(3600),
        );

        materializer
            .handle(DomainEvent::WorkflowRunSucceeded { workflow_run_id: run_id, occurred_at: Utc::now() })
            .await;

        assert!(!materializer.graph.has_in_flight(producer_id));
        assert!(materializer.graph.is_eligible(producer_id));
    }
}
