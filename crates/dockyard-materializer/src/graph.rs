//! In-memory asset/workflow dependency graph (spec §4.F). Rebuilt from
//! persisted `WorkflowDefinition`s on a refresh timer and incrementally
//! updated as `workflow.definition.updated` events arrive; has no direct
//! teacher analogue (the teacher has no asset-materialization concept), so
//! the shape is spec-driven, kept in the same `dashmap`-backed style as
//! `dockyard_events::EventBus` and `dockyard-workflow::ServiceRegistry`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use dockyard_persistence::model::WorkflowDefinition;
use dockyard_persistence::store::Store;
use dockyard_types::normalize_partition_key;
use tracing::{info, warn};
use uuid::Uuid;

/// One workflow's materialization-relevant configuration, derived from its
/// `steps[].produces` and `consumes` declarations.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub slug: String,
    /// Normalized asset id -> step id that declares it, across all steps.
    pub produces: HashMap<String, String>,
    /// Normalized asset id -> the consumer declaration (staleness policy).
    pub consumes: HashMap<String, dockyard_persistence::model::WorkflowAssetConsumer>,
    /// Whether an upstream `asset.produced` should be considered for
    /// auto-triggering this workflow at all. True whenever the workflow
    /// declares any consumers (a workflow with no consumers has nothing to
    /// react to).
    pub on_upstream_update: bool,
}

#[derive(Debug, Clone)]
pub struct LatestAsset {
    pub produced_at: chrono::DateTime<chrono::Utc>,
    pub workflow_run_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailureState {
    pub failures: u32,
    pub next_eligible_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// An asset's declared freshness policy, keyed by normalized asset id. Last
/// declaration wins on conflicting `upsert_definition` calls, matching how
/// `produces`/`consumes` indexing already tolerates more than one workflow
/// naming the same asset.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetFreshness {
    pub max_age: Option<std::time::Duration>,
    pub cadence: Option<std::time::Duration>,
}

/// The graph plus all the per-workflow in-flight/failure/freshness state
/// that the "consider enqueue" guards read.
#[derive(Default)]
pub struct MaterializerGraph {
    workflow_configs: DashMap<Uuid, WorkflowConfig>,
    /// normalized asset id -> workflow ids that consume it.
    asset_consumers: DashMap<String, HashSet<Uuid>>,
    /// normalized asset id -> workflow ids that declare a step producing it.
    asset_producers: DashMap<String, HashSet<Uuid>>,
    /// normalized asset id -> the `maxAge`/`cadence` declared by whichever
    /// step produces it.
    asset_freshness: DashMap<String, AssetFreshness>,
    /// (workflow_id, normalized asset id, partition key) -> latest known
    /// materialization the workflow has produced for that asset/partition.
    latest_assets: DashMap<(Uuid, String, String), LatestAsset>,
    /// (normalized asset id, partition key) -> last time the expiry scanner
    /// evaluated this pair, used to honor `cadence` independent of `max_age`.
    last_expiry_check: DashMap<(String, String), chrono::DateTime<chrono::Utc>>,
    in_flight: DashMap<Uuid, HashSet<Uuid>>,
    failure_state: DashMap<Uuid, FailureState>,
}

impl MaterializerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safety-net rebuild from persistence (spec §4.F: "Graph refresh
    /// timer: rebuild from persistence every `refreshIntervalMs`").
    pub async fn refresh(&self, store: &Arc<dyn Store>) {
        match store.list_active_workflow_definitions().await {
            Ok(definitions) => {
                for definition in definitions {
                    self.upsert_definition(&definition);
                }
            }
            Err(err) => warn!(error = %err, "materializer graph refresh failed"),
        }
    }

    pub fn upsert_definition(&self, definition: &WorkflowDefinition) {
        let mut produces = HashMap::new();
        for step in &definition.steps {
            for declaration in step.produces() {
                let normalized = dockyard_types::AssetId::new(&declaration.asset_id).normalized;
                produces.insert(normalized.clone(), step.id().to_string());
                self.asset_producers
                    .entry(normalized.clone())
                    .or_default()
                    .insert(definition.id);
                if declaration.max_age.is_some() || declaration.cadence.is_some() {
                    self.asset_freshness.insert(
                        normalized,
                        AssetFreshness { max_age: declaration.max_age, cadence: declaration.cadence },
                    );
                }
            }
        }

        let mut consumes = HashMap::new();
        for consumer in &definition.consumes {
            let normalized = dockyard_types::AssetId::new(&consumer.asset_id).normalized;
            consumes.insert(normalized.clone(), consumer.clone());
            self.asset_consumers
                .entry(normalized)
                .or_default()
                .insert(definition.id);
        }

        let on_upstream_update = !consumes.is_empty();

        self.workflow_configs.insert(
            definition.id,
            WorkflowConfig {
                slug: definition.slug.clone(),
                produces,
                consumes,
                on_upstream_update,
            },
        );

        info!(workflow_definition_id = %definition.id, slug = %definition.slug, "materializer graph updated");
    }

    pub fn consumers_of(&self, asset_id: &str) -> Vec<Uuid> {
        let normalized = dockyard_types::AssetId::new(asset_id).normalized;
        self.asset_consumers
            .get(&normalized)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn config_of(&self, workflow_id: Uuid) -> Option<WorkflowConfig> {
        self.workflow_configs.get(&workflow_id).map(|e| e.clone())
    }

    /// Workflows with a step declaring `asset_id` as produced, paired with
    /// their current config. Used by `asset.expired` handling (spec §4.F:
    /// "consider enqueuing the workflow itself").
    pub fn known_workflows_producing(&self, asset_id: &str) -> Vec<(Uuid, WorkflowConfig)> {
        let normalized = dockyard_types::AssetId::new(asset_id).normalized;
        self.asset_producers
            .get(&normalized)
            .map(|set| {
                set.iter()
                    .filter_map(|id| self.config_of(*id).map(|cfg| (*id, cfg)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record_produced_asset(
        &self,
        workflow_id: Uuid,
        asset_id: &str,
        partition_key: Option<&str>,
        produced_at: chrono::DateTime<chrono::Utc>,
        workflow_run_id: Uuid,
    ) {
        let normalized = dockyard_types::AssetId::new(asset_id).normalized;
        let partition_key = normalize_partition_key(partition_key);
        self.latest_assets.insert(
            (workflow_id, normalized, partition_key),
            LatestAsset { produced_at, workflow_run_id },
        );
    }

    pub fn latest_materialization(
        &self,
        workflow_id: Uuid,
        asset_id: &str,
        partition_key: &str,
    ) -> Option<LatestAsset> {
        let normalized = dockyard_types::AssetId::new(asset_id).normalized;
        self.latest_assets
            .get(&(workflow_id, normalized, partition_key.to_string()))
            .map(|e| e.clone())
    }

    pub fn mark_in_flight(&self, workflow_id: Uuid, run_id: Uuid) {
        self.in_flight.entry(workflow_id).or_default().insert(run_id);
    }

    pub fn clear_in_flight(&self, workflow_id: Uuid, run_id: Uuid) {
        if let Some(mut set) = self.in_flight.get_mut(&workflow_id) {
            set.remove(&run_id);
        }
    }

    pub fn has_in_flight(&self, workflow_id: Uuid) -> bool {
        self.in_flight
            .get(&workflow_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn record_success(&self, workflow_id: Uuid) {
        self.failure_state.remove(&workflow_id);
    }

    pub fn record_failure(&self, workflow_id: Uuid, policy: &dockyard_types::RetryPolicy, base_backoff: std::time::Duration, max_backoff: std::time::Duration) {
        let mut entry = self.failure_state.entry(workflow_id).or_default();
        entry.failures += 1;
        let delay = policy.delay_for_attempt(entry.failures).min(max_backoff).max(base_backoff);
        entry.next_eligible_at = Some(chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
    }

    pub fn is_eligible(&self, workflow_id: Uuid) -> bool {
        match self.failure_state.get(&workflow_id).and_then(|e| e.next_eligible_at) {
            None => true,
            Some(at) => at <= chrono::Utc::now(),
        }
    }

    pub fn freshness_of(&self, asset_id: &str) -> Option<AssetFreshness> {
        let normalized = dockyard_types::AssetId::new(asset_id).normalized;
        self.asset_freshness.get(&normalized).map(|e| *e)
    }

    /// Every `(asset_id, partition_key)` the graph has a recorded
    /// materialization for, with the freshness policy that applies (if
    /// any). Assets with no `maxAge`/`cadence` declared are skipped: the
    /// scanner has nothing to check for them.
    pub fn expirable_assets(&self) -> Vec<(String, String, LatestAsset, AssetFreshness)> {
        let mut seen: HashMap<(String, String), LatestAsset> = HashMap::new();
        for entry in self.latest_assets.iter() {
            let (_, asset_id, partition_key) = entry.key().clone();
            let asset = entry.value().clone();
            seen.entry((asset_id, partition_key))
                .and_modify(|existing| {
                    if asset.produced_at > existing.produced_at {
                        *existing = asset.clone();
                    }
                })
                .or_insert(asset);
        }

        seen.into_iter()
            .filter_map(|((asset_id, partition_key), latest)| {
                self.freshness_of(&asset_id)
                    .map(|freshness| (asset_id, partition_key, latest, freshness))
            })
            .collect()
    }

    /// Whether `cadence` allows checking `(asset_id, partition_key)` again
    /// right now, and if so records this pass as the new last-checked time.
    pub fn mark_expiry_checked_if_due(
        &self,
        asset_id: &str,
        partition_key: &str,
        cadence: Option<std::time::Duration>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        let key = (asset_id.to_string(), partition_key.to_string());
        if let Some(cadence) = cadence {
            if let Some(last) = self.last_expiry_check.get(&key) {
                let elapsed = now - *last;
                if elapsed < chrono::Duration::from_std(cadence).unwrap_or_default() {
                    return false;
                }
            }
        }
        self.last_expiry_check.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_persistence::model::{AssetDeclaration, WorkflowAssetConsumer, WorkflowStep};
    use serde_json::json;

    fn producer_definition(id: Uuid, asset_id: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id,
            slug: "producer".to_string(),
            version: 1,
            steps: vec![WorkflowStep::Job {
                id: "produce".to_string(),
                job_slug: "test.produce".to_string(),
                parameter_template: json!({}),
                retry_override: None,
                timeout_override: None,
                store_result_as: None,
                produces: vec![AssetDeclaration {
                    asset_id: asset_id.to_string(),
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
            created_at: chrono::Utc::now(),
        }
    }

    fn consumer_definition(id: Uuid, asset_id: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id,
            slug: "consumer".to_string(),
            version: 1,
            steps: vec![],
            consumes: vec![WorkflowAssetConsumer {
                asset_id: asset_id.to_string(),
                partition_key_template: None,
                max_staleness: None,
            }],
            schedule: None,
            event_triggers: vec![],
            default_parameters: json!({}),
            metadata: json!({}),
            active: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn upsert_definition_indexes_both_producers_and_consumers() {
        let graph = MaterializerGraph::new();
        let producer_id = Uuid::now_v7();
        let consumer_id = Uuid::now_v7();
        graph.upsert_definition(&producer_definition(producer_id, "raw/orders"));
        graph.upsert_definition(&consumer_definition(consumer_id, "raw/orders"));

        assert_eq!(graph.consumers_of("raw/orders"), vec![consumer_id]);
        let producers = graph.known_workflows_producing("raw/orders");
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].0, producer_id);
        assert!(!producers[0].1.on_upstream_update);
        assert!(graph.config_of(consumer_id).unwrap().on_upstream_update);
    }

    #[test]
    fn asset_ids_are_normalized_across_lookups() {
        let graph = MaterializerGraph::new();
        let consumer_id = Uuid::now_v7();
        graph.upsert_definition(&consumer_definition(consumer_id, "Raw/Orders"));
        assert_eq!(graph.consumers_of("raw/orders"), vec![consumer_id]);
    }

    #[test]
    fn in_flight_tracking_is_per_workflow() {
        let graph = MaterializerGraph::new();
        let workflow_id = Uuid::now_v7();
        let run_id = Uuid::now_v7();
        assert!(!graph.has_in_flight(workflow_id));

        graph.mark_in_flight(workflow_id, run_id);
        assert!(graph.has_in_flight(workflow_id));

        graph.clear_in_flight(workflow_id, run_id);
        assert!(!graph.has_in_flight(workflow_id));
    }

    #[test]
    fn failure_backoff_makes_a_workflow_ineligible_until_its_deadline() {
        let graph = MaterializerGraph::new();
        let workflow_id = Uuid::now_v7();
        assert!(graph.is_eligible(workflow_id));

        graph.record_failure(
            workflow_id,
            &dockyard_types::RetryPolicy::exponential(),
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(3600),
        );
        assert!(!graph.is_eligible(workflow_id));

        graph.record_success(workflow_id);
        assert!(graph.is_eligible(workflow_id));
    }
}
