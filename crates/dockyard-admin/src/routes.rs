//! The minimal HTTP surface (spec.md §6, SPEC_FULL.md §6): a health check
//! and just enough of the enqueue API to exercise the engine end to end in
//! integration tests. This is a test harness, not the product API surface
//! spec.md's Non-goals exclude — no OpenAPI/WebSocket/auth layer.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dockyard_persistence::store::Pagination;
use dockyard_queue::api::enqueue_workflow_run;
use dockyard_types::{DockyardError, ErrorKind, EventCursor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/events", post(ingest_event_route))
        .route("/workflow-runs/:id/enqueue", post(enqueue_workflow_run_route))
        .route("/workflow-runs/:id/events", get(list_workflow_run_events_route))
        .route("/metrics-snapshot", get(metrics_snapshot))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn enqueue_workflow_run_route(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = enqueue_workflow_run(&state.store, &state.queue, id)
        .await
        .map_err(|err| ApiError(DockyardError::from(&err)))?;
    Ok(Json(serde_json::json!({
        "id": run.id,
        "status": run.status,
    })))
}

async fn ingest_event_route(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .ingestor
        .ingest(payload)
        .await
        .map_err(|err| ApiError(DockyardError::from(&err)))?;
    Ok(Json(serde_json::json!({
        "envelopeId": outcome.envelope_id,
        "admitted": outcome.admitted,
    })))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<u32>,
    cursor: Option<String>,
}

async fn list_workflow_run_events_route(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cursor = query.cursor.as_deref().and_then(EventCursor::decode);
    let page = Pagination {
        limit: query.limit.unwrap_or(50),
        cursor,
    };
    let events = state
        .store
        .list_workflow_run_events(id, page)
        .await
        .map_err(|err| ApiError(DockyardError::new((&err).into(), err.to_string())))?;

    let next_cursor = events
        .last()
        .map(|event| EventCursor::new(event.occurred_at, event.id).encode());

    Ok(Json(serde_json::json!({
        "events": events,
        "nextCursor": next_cursor,
    })))
}

async fn metrics_snapshot(State(state): State<AppState>) -> Json<dockyard_telemetry::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Maps `ErrorKind` to the status codes spec.md §7's propagation policy
/// names: Validation->400, Precondition->409, Conflict->409, Timeout->504,
/// RetriableIo->502, Fatal->500.
struct ApiError(DockyardError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Precondition | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::RetriableIo => StatusCode::BAD_GATEWAY,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.message, "kind": self.0.kind }))).into_response()
    }
}
