//! `execute_job_run`: the single entrypoint of the job runtime (spec §4.C).

use std::sync::Arc;

use chrono::Utc;
use dockyard_events::{DomainEvent, EventBus};
use dockyard_persistence::model::JobRun;
use dockyard_persistence::store::Store;
use dockyard_types::{DockyardError, ErrorKind};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::context::JobRunContext;
use crate::handler::JobHandlerRegistry;

#[derive(Debug, thiserror::Error)]
pub enum JobRuntimeError {
    #[error("persistence error: {0}")]
    Persistence(#[from] dockyard_persistence::store::PersistenceError),
}

impl From<&JobRuntimeError> for ErrorKind {
    fn from(err: &JobRuntimeError) -> Self {
        match err {
            JobRuntimeError::Persistence(p) => p.into(),
        }
    }
}

/// Executes (or resumes) a single job run. Idempotent on already-terminal
/// runs (step 1); safe to call concurrently from multiple workers racing to
/// claim the same run (step 2's conditional transition picks one winner).
#[instrument(skip(store, events, registry), fields(job_run_id = %run_id))]
pub async fn execute_job_run(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    registry: &JobHandlerRegistry,
    run_id: Uuid,
) -> Result<JobRun, JobRuntimeError> {
    // Step 1: idempotent no-op on already-terminal runs.
    let run = store.get_job_run(run_id).await?;
    if run.status.is_terminal() {
        return Ok(run);
    }

    // Step 2: conditional pending -> running transition. If another worker
    // already won the race, re-load and return whatever it left behind.
    let claimed = match store.claim_job_run(run_id).await? {
        Some(claimed) => claimed,
        None => return Ok(store.get_job_run(run_id).await?),
    };
    let run = claimed.run;
    events.publish(DomainEvent::JobRunStarted {
        job_run_id: run.id,
        attempt: run.attempt,
        occurred_at: Utc::now(),
    });

    // Step 3: resolve handler by slug -> definition -> registered handler.
    let definition = store.get_job_definition(run.job_definition_id).await?;
    let handler = match registry.resolve(&definition.entry_point) {
        Some(handler) => handler,
        None => {
            return Ok(terminally_fail(
                store,
                events,
                &run,
                ErrorKind::Fatal,
                format!("no handler registered for entry point: {}", definition.entry_point),
            )
            .await?)
        }
    };

    // Step 4: build the context the handler executes under.
    let ctx = JobRunContext::new(
        run.id,
        run.parameters.clone(),
        run.attempt,
        run.max_attempts,
        run.scheduled_at,
    );

    // Step 5: invoke under a timeout.
    let timeout = definition.timeout;
    let outcome = tokio::time::timeout(timeout, handler.execute(&ctx, run.parameters.clone())).await;

    let metrics = ctx.snapshot_metrics();
    match outcome {
        Err(_elapsed) => {
            // Timeout: mark expired with a synthetic error, no retry.
            let message = format!("job run exceeded timeout of {timeout:?}");
            warn!(job_run_id = %run.id, "job run timed out");
            store.expire_job_run(run.id, message, metrics).await?;
            events.publish(DomainEvent::JobRunFailed {
                job_run_id: run.id,
                retryable: false,
                occurred_at: Utc::now(),
            });
            Ok(store.get_job_run(run.id).await?)
        }
        Ok(Err(err)) => {
            // Step 6/7: classify, retry or terminally fail.
            handle_failure(store, events, &run, &definition.retry_policy, err, metrics).await
        }
        Ok(Ok(result)) => {
            // Step 8: success.
            store
                .complete_job_run(run.id, result, metrics)
                .await?;
            events.publish(DomainEvent::JobRunSucceeded {
                job_run_id: run.id,
                occurred_at: Utc::now(),
            });
            info!(job_run_id = %run.id, "job run succeeded");
            Ok(store.get_job_run(run.id).await?)
        }
    }
}

async fn handle_failure(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    run: &JobRun,
    retry_policy: &dockyard_types::reliability::RetryPolicy,
    err: DockyardError,
    metrics: Value,
) -> Result<JobRun, JobRuntimeError> {
    let retryable = err.is_retryable() && retry_policy.has_attempts_remaining(run.attempt);
    if retryable {
        let delay = retry_policy.delay_for_attempt(run.attempt + 1);
        let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        store
            .fail_job_run(run.id, err.kind, err.message.clone(), metrics, Some(retry_at))
            .await?;
        events.publish(DomainEvent::JobRunFailed {
            job_run_id: run.id,
            retryable: true,
            occurred_at: Utc::now(),
        });
    } else {
        store
            .fail_job_run(run.id, err.kind, err.message.clone(), metrics, None)
            .await?;
        events.publish(DomainEvent::JobRunFailed {
            job_run_id: run.id,
            retryable: false,
            occurred_at: Utc::now(),
        });
    }
    Ok(store.get_job_run(run.id).await?)
}

async fn terminally_fail(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    run: &JobRun,
    kind: ErrorKind,
    message: String,
) -> Result<JobRun, JobRuntimeError> {
    store
        .fail_job_run(run.id, kind, message, Value::Null, None)
        .await?;
    events.publish(DomainEvent::JobRunFailed {
        job_run_id: run.id,
        retryable: false,
        occurred_at: Utc::now(),
    });
    Ok(store.get_job_run(run.id).await?)
}
