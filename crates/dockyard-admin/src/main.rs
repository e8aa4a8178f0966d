//! Demo/integration-test binary: wires every dockyard-* crate together with
//! the in-process (inline queue, in-memory store) backends and serves the
//! minimal HTTP surface from [`dockyard_admin::routes`]. Grounded in
//! `everruns-api`/`control-plane::main`'s wiring shape (tracing init, build
//! shared state, build router, serve), trimmed to what this workspace's
//! thin test-harness surface actually needs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dockyard_admin::{router, AppState};
use dockyard_events::EventBus;
use dockyard_jobs::{JobHandlerRegistry, JobRunConsumer};
use dockyard_materializer::{
    run_asset_expiry_scanner, AssetExpiryConsumer, AssetExpiryScannerConfig, AutoMaterializer, MaterializerGraph,
};
use dockyard_persistence::{InMemoryStore, Store};
use dockyard_queue::inline::InlineQueue;
use dockyard_queue::queue::{Queue, QueueName};
use dockyard_scheduler::{
    EventAuditConsumer, EventIngestor, EventTriggerConsumer, IngestStats, LoggingScalingTarget, RuntimeScalingAgent,
    ScalingTargetConfig, ScheduleLeader, ScheduleLeaderConfig, ScheduleMaterializer, ScheduleRing, SourceAdmission,
    TriggerWindows,
};
use dockyard_telemetry::{MetricsRegistry, TelemetryCollector};
use dockyard_types::CircuitBreakerConfig;
use dockyard_workflow::{OrchestratorDeps, SecretStore, ServiceRegistry, WorkflowRunConsumer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
    let events = Arc::new(EventBus::default());
    let queue: Arc<dyn Queue> = Arc::new(InlineQueue::new(events.clone()));

    let job_registry = Arc::new(JobHandlerRegistry::new());
    let orchestrator_deps = Arc::new(OrchestratorDeps {
        store: store.clone(),
        events: events.clone(),
        job_registry: job_registry.clone(),
        service_registry: Arc::new(ServiceRegistry::default()),
        secrets: Arc::new(SecretStore::default()),
        http_client: reqwest::Client::new(),
    });

    let job_consumer = Arc::new(JobRunConsumer::new(store.clone(), events.clone(), job_registry.clone()));
    for queue_name in [
        QueueName::Ingest,
        QueueName::Build,
        QueueName::Launch,
        QueueName::ExampleBundle,
    ] {
        queue.register_consumer(queue_name, job_consumer.clone());
    }
    queue.register_consumer(
        QueueName::Workflow,
        Arc::new(WorkflowRunConsumer::new(orchestrator_deps.clone())),
    );

    let materializer_graph = Arc::new(MaterializerGraph::new());
    let materializer = Arc::new(AutoMaterializer::new(
        store.clone(),
        queue.clone(),
        events.clone(),
        materializer_graph.clone(),
    ));
    tokio::spawn(materializer.run());

    queue.register_consumer(QueueName::AssetExpiry, Arc::new(AssetExpiryConsumer::new(events.clone())));
    let (expiry_shutdown_tx, expiry_shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(run_asset_expiry_scanner(
        materializer_graph,
        queue.clone(),
        AssetExpiryScannerConfig::default(),
        expiry_shutdown_rx,
    ));

    let admission = Arc::new(SourceAdmission::new(CircuitBreakerConfig::default()));
    let ingest_stats = Arc::new(IngestStats::new());
    let ingestor = Arc::new(EventIngestor::new(queue.clone(), admission, ingest_stats));
    queue.register_consumer(QueueName::Event, Arc::new(EventAuditConsumer::new(store.clone())));
    queue.register_consumer(
        QueueName::EventTrigger,
        Arc::new(EventTriggerConsumer::new(
            store.clone(),
            queue.clone(),
            events.clone(),
            Arc::new(TriggerWindows::new()),
            ingestor.clone(),
        )),
    );

    let metrics = Arc::new(MetricsRegistry::new());
    for queue_name in [
        QueueName::Ingest,
        QueueName::Build,
        QueueName::Launch,
        QueueName::Workflow,
        QueueName::Event,
        QueueName::EventTrigger,
        QueueName::ExampleBundle,
        QueueName::AssetExpiry,
    ] {
        metrics.reset_gauge(&format!("queue.{}.enqueued", queue_name.as_str()));
    }
    let telemetry = Arc::new(TelemetryCollector::new(metrics.clone()));
    tokio::spawn(telemetry.run(events.clone()));

    let leader = ScheduleLeader::new(
        store.clone(),
        events.clone(),
        ScheduleLeaderConfig::new(format!("dockyard-admin-{}", uuid::Uuid::now_v7())),
    );
    leader.start();

    let schedule_ring = Arc::new(ScheduleRing::new());
    let schedule_materializer = Arc::new(ScheduleMaterializer::new(
        store.clone(),
        queue.clone(),
        events.clone(),
        leader.clone(),
        schedule_ring,
    ));
    let (schedule_shutdown_tx, mut schedule_shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => schedule_materializer.run_once().await,
                _ = schedule_shutdown_rx.changed() => break,
            }
        }
    });

    let scaling_agent = Arc::new(RuntimeScalingAgent::new(
        vec![
            ScalingTargetConfig {
                key: "ingest".to_string(),
                default: 1,
                min: 1,
                max: 8,
                rate_limit: Duration::from_secs(30),
            },
            ScalingTargetConfig {
                key: "workflow".to_string(),
                default: 1,
                min: 1,
                max: 8,
                rate_limit: Duration::from_secs(30),
            },
        ],
        Arc::new(LoggingScalingTarget),
    ));
    // No queue backend currently produces `RuntimeScalingSnapshot`s (see
    // `dockyard_scheduler::scaling`'s module doc); the sender is kept alive
    // for the life of the process so the agent's feed loop has something to
    // wait on rather than exiting immediately.
    let (_scaling_feed_tx, scaling_feed_rx) = tokio::sync::mpsc::channel(64);
    let scaling_shutdown_tx = scaling_agent.spawn(scaling_feed_rx);

    let state = AppState {
        store: store.clone(),
        queue: queue.clone(),
        events: events.clone(),
        metrics: metrics.clone(),
        ingestor,
    };

    let app = router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = std::env::var("DOCKYARD_ADMIN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "dockyard-admin listening");

    tokio::select! {
        result = axum::serve(listener, app) => { result?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = expiry_shutdown_tx.send(true);
    let _ = schedule_shutdown_tx.send(true);
    let _ = scaling_shutdown_tx.send(true);
    leader.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
