//! Exercises the minimal HTTP surface end to end against `InMemoryStore` +
//! `InlineQueue`, mirroring `durable`'s own in-memory-backed integration
//! test style (no Postgres/Redis needed, per SPEC_FULL.md §8).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use dockyard_admin::{router, AppState};
use dockyard_events::EventBus;
use dockyard_jobs::JobHandlerRegistry;
use dockyard_persistence::model::{RunTrigger, WorkflowDefinition, WorkflowRun, WorkflowRunStatus};
use dockyard_persistence::{InMemoryStore, Store};
use dockyard_queue::inline::InlineQueue;
use dockyard_queue::queue::{Queue, QueueName};
use dockyard_scheduler::{EventAuditConsumer, EventIngestor, EventTriggerConsumer, IngestStats, SourceAdmission, TriggerWindows};
use dockyard_telemetry::MetricsRegistry;
use dockyard_types::CircuitBreakerConfig;
use dockyard_workflow::{OrchestratorDeps, SecretStore, ServiceRegistry, WorkflowRunConsumer};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

async fn test_state() -> (AppState, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
    let events = Arc::new(EventBus::default());
    let queue: Arc<dyn Queue> = Arc::new(InlineQueue::new(events.clone()));

    let deps = Arc::new(OrchestratorDeps {
        store: store.clone(),
        events: events.clone(),
        job_registry: Arc::new(JobHandlerRegistry::new()),
        service_registry: Arc::new(ServiceRegistry::default()),
        secrets: Arc::new(SecretStore::default()),
        http_client: reqwest::Client::new(),
    });
    queue.register_consumer(QueueName::Workflow, Arc::new(WorkflowRunConsumer::new(deps)));

    let ingestor = Arc::new(EventIngestor::new(
        queue.clone(),
        Arc::new(SourceAdmission::new(CircuitBreakerConfig::default())),
        Arc::new(IngestStats::new()),
    ));
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

    let state = AppState {
        store: store.clone(),
        queue,
        events,
        metrics: Arc::new(MetricsRegistry::new()),
        ingestor,
    };
    (state, store)
}

async fn create_empty_workflow_run(store: &Arc<dyn Store>) -> WorkflowRun {
    let definition = WorkflowDefinition {
        id: Uuid::now_v7(),
        slug: "noop".to_string(),
        version: 1,
        steps: vec![],
        consumes: vec![],
        schedule: None,
        event_triggers: vec![],
        default_parameters: json!({}),
        metadata: json!({}),
        active: true,
        created_at: Utc::now(),
    };
    let definition = store.create_workflow_definition(definition).await.unwrap();

    let now = Utc::now();
    let run = WorkflowRun {
        id: Uuid::now_v7(),
        workflow_definition_id: definition.id,
        status: WorkflowRunStatus::Pending,
        parameters: json!({}),
        shared: json!({}),
        metrics: json!({}),
        triggered_by: RunTrigger::Manual,
        trigger_payload: None,
        trace_context: None,
        error_message: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
    };
    store.create_workflow_run(run).await.unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (state, _store) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn enqueueing_a_zero_step_workflow_run_succeeds_inline() {
    let (state, store) = test_state().await;
    let run = create_empty_workflow_run(&store).await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/workflow-runs/{}/enqueue", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let persisted = store.get_workflow_run(run.id).await.unwrap();
    assert_eq!(persisted.status, WorkflowRunStatus::Succeeded);
}

#[tokio::test]
async fn enqueueing_an_unknown_workflow_run_fails_with_precondition_status() {
    let (state, _store) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/workflow-runs/{}/enqueue", Uuid::now_v7()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn posting_an_event_admits_and_audits_it() {
    let (state, store) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(json!({"source": "github", "payload": {"action": "push"}}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["admitted"], json!(true));

    let _ = store;
}

#[tokio::test]
async fn posting_an_event_with_no_source_is_rejected() {
    let (state, _store) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(json!({"payload": {}}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listing_workflow_run_events_paginates_with_a_cursor() {
    let (state, store) = test_state().await;
    let run = create_empty_workflow_run(&store).await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/workflow-runs/{}/events?limit=10", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed["events"].as_array().is_some());
}

#[tokio::test]
async fn metrics_snapshot_reflects_inline_enqueue() {
    let (state, store) = test_state().await;
    let run = create_empty_workflow_run(&store).await;
    let metrics = state.metrics.clone();
    let events = state.events.clone();
    let collector = Arc::new(dockyard_telemetry::TelemetryCollector::new(metrics.clone()));
    tokio::spawn(collector.run(events));

    let app = router(state);
    let _ = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/workflow-runs/{}/enqueue", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Give the spawned collector a turn to drain the bus.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app
        .oneshot(Request::builder().uri("/metrics-snapshot").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let snapshot: Value = serde_json::from_slice(&body).unwrap();
    assert!(snapshot["gauges"]["queue.workflow.enqueued"].as_i64().unwrap() >= 1);
}
