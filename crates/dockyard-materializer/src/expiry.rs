//! TTL/cadence-driven half of auto-materialization: a scanner that walks
//! every asset the graph has a recorded materialization for and enqueues
//! `asset.expired` candidates once `maxAge` has elapsed, honoring `cadence`
//! so a fast-producing asset isn't rechecked more often than its declared
//! interval. Grounded in `dockyard_jobs::poller::run_due_run_poller`'s
//! shape: a fixed-interval loop reading `Store`/`MaterializerGraph` state
//! and pushing onto a queue, stopped via a shared `watch::Receiver<bool>`.

use std::sync::Arc;
use std::time::Duration;

use dockyard_events::{DomainEvent, EventBus};
use dockyard_queue::queue::{Consumer, Queue, QueueName};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::graph::MaterializerGraph;

#[derive(Debug, Clone)]
pub struct AssetExpiryScannerConfig {
    pub scan_interval: Duration,
}

impl Default for AssetExpiryScannerConfig {
    fn default() -> Self {
        Self { scan_interval: Duration::from_secs(30) }
    }
}

/// Periodically checks `MaterializerGraph::expirable_assets` for
/// materializations whose `maxAge` has elapsed and enqueues one
/// `QueueName::AssetExpiry` message per expired `(asset_id, partition_key)`.
/// `cadence` (if declared) rate-limits how often the same pair is
/// re-checked, independent of the scan interval itself.
pub async fn run_asset_expiry_scanner(
    graph: Arc<MaterializerGraph>,
    queue: Arc<dyn Queue>,
    config: AssetExpiryScannerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.scan_interval);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                scan_once(&graph, &queue).await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn scan_once(graph: &Arc<MaterializerGraph>, queue: &Arc<dyn Queue>) {
    let now = chrono::Utc::now();
    let mut expired = 0;
    for (asset_id, partition_key, latest, freshness) in graph.expirable_assets() {
        let Some(max_age) = freshness.max_age else { continue };
        let age = now - latest.produced_at;
        if age < chrono::Duration::from_std(max_age).unwrap_or_default() {
            continue;
        }
        if !graph.mark_expiry_checked_if_due(&asset_id, &partition_key, freshness.cadence, now) {
            continue;
        }

        let payload = json!({ "assetId": asset_id, "partitionKey": partition_key });
        match queue.enqueue(QueueName::AssetExpiry, payload).await {
            Ok(_) => expired += 1,
            Err(err) => error!(asset_id, partition_key, %err, "failed to enqueue asset expiry"),
        }
    }
    if expired > 0 {
        debug!(expired, "asset expiry scan enqueued candidates");
    }
}

/// Drains `QueueName::AssetExpiry` and republishes each candidate as
/// `DomainEvent::AssetExpired`, which `AutoMaterializer::handle_asset_expired`
/// already subscribes to.
pub struct AssetExpiryConsumer {
    events: Arc<EventBus>,
}

impl AssetExpiryConsumer {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

#[async_trait::async_trait]
impl Consumer for AssetExpiryConsumer {
    async fn consume(&self, _message_id: Uuid, payload: Value) -> Result<(), dockyard_types::DockyardError> {
        let asset_id = payload
            .get("assetId")
            .and_then(Value::as_str)
            .ok_or_else(|| dockyard_types::DockyardError::validation("asset expiry payload missing assetId"))?
            .to_string();
        let partition_key = payload
            .get("partitionKey")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.events.publish(DomainEvent::AssetExpired {
            asset_id,
            partition_key,
            occurred_at: chrono::Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_events::EventBus;
    use dockyard_persistence::model::WorkflowDefinition;
    use serde_json::json as jsonify;

    fn producer_with_freshness(
        asset_id: &str,
        max_age: Option<Duration>,
        cadence: Option<Duration>,
    ) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            slug: "producer".to_string(),
            version: 1,
            steps: vec![dockyard_persistence::model::WorkflowStep::Job {
                id: "produce".to_string(),
                job_slug: "test.produce".to_string(),
                parameter_template: jsonify!({}),
                retry_override: None,
                timeout_override: None,
                store_result_as: None,
                produces: vec![dockyard_persistence::model::AssetDeclaration {
                    asset_id: asset_id.to_string(),
                    partition_key_template: None,
                    max_age,
                    cadence,
                }],
                depends_on: vec![],
            }],
            consumes: vec![],
            schedule: None,
            event_triggers: vec![],
            default_parameters: jsonify!({}),
            metadata: jsonify!({}),
            active: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn scan_enqueues_only_assets_past_their_max_age() {
        let graph = Arc::new(MaterializerGraph::new());
        graph.upsert_definition(&producer_with_freshness("raw/stale", Some(Duration::from_secs(60)), None));
        graph.upsert_definition(&producer_with_freshness("raw/fresh", Some(Duration::from_secs(3600)), None));

        let workflow_id = Uuid::now_v7();
        let now = chrono::Utc::now();
        graph.record_produced_asset(workflow_id, "raw/stale", None, now - chrono::Duration::seconds(120), Uuid::now_v7());
        graph.record_produced_asset(workflow_id, "raw/fresh", None, now, Uuid::now_v7());

        let events = Arc::new(EventBus::default());
        let queue: Arc<dyn Queue> = Arc::new(dockyard_queue::inline::InlineQueue::new(events.clone()));
        queue.register_consumer(QueueName::AssetExpiry, Arc::new(AssetExpiryConsumer::new(events.clone())));

        let mut asset_expired = events.subscribe("asset_expired");
        scan_once(&graph, &queue).await;

        let event = tokio::time::timeout(Duration::from_millis(500), asset_expired.recv())
            .await
            .expect("asset_expired should fire")
            .unwrap();
        match event {
            DomainEvent::AssetExpired { asset_id, .. } => assert_eq!(asset_id, "raw/stale"),
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(asset_expired.try_recv().is_err(), "raw/fresh should not have expired");
    }

    #[tokio::test]
    async fn cadence_suppresses_a_repeat_check_within_the_window() {
        let graph = Arc::new(MaterializerGraph::new());
        graph.upsert_definition(&producer_with_freshness(
            "raw/daily",
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(3600)),
        ));
        let workflow_id = Uuid::now_v7();
        let now = chrono::Utc::now();
        graph.record_produced_asset(workflow_id, "raw/daily", None, now - chrono::Duration::seconds(10), Uuid::now_v7());

        let events = Arc::new(EventBus::default());
        let queue: Arc<dyn Queue> = Arc::new(dockyard_queue::inline::InlineQueue::new(events.clone()));
        queue.register_consumer(QueueName::AssetExpiry, Arc::new(AssetExpiryConsumer::new(events.clone())));

        let mut asset_expired = events.subscribe("asset_expired");
        scan_once(&graph, &queue).await;
        tokio::time::timeout(Duration::from_millis(500), asset_expired.recv())
            .await
            .expect("first scan should fire")
            .unwrap();

        scan_once(&graph, &queue).await;
        assert!(
            asset_expired.try_recv().is_err(),
            "second scan inside the cadence window should not re-enqueue"
        );
    }
}
