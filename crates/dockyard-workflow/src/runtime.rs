//! `runWorkflowOrchestration(runId)` (spec §4.D): loads the run, computes
//! the ready set from the step dependency graph, dispatches steps by
//! variant, and drives the run to a terminal state. Every transition is
//! appended to the `workflow_run_events` journal before it is acted on
//! (`durable::workflow::event::WorkflowEvent`'s recovery model), so a
//! worker that re-acquires a `running` run after a crash can tell which
//! steps were already durable.
//!
//! Job steps run through `dockyard_jobs::execute_job_run` directly in the
//! orchestrator's own task rather than round-tripping through
//! `dockyard-queue`: the 8 named queue keywords have no dedicated
//! job-dispatch lane, and a step's own progress depends on having the
//! result in hand regardless of the process-wide queue mode. This keeps
//! "inline mode awaits directly" true by construction; the due-run poller
//! in `dockyard-jobs` still owns redelivering a step's `JobRun` if its
//! retry was scheduled for later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockyard_events::{DomainEvent, EventBus};
use dockyard_jobs::JobHandlerRegistry;
use dockyard_persistence::model::{
    AssetDeclaration, JobRun, JobRunStatus, ProducedAsset, RunTrigger, WorkflowDefinition,
    WorkflowRun, WorkflowRunEvent, WorkflowRunEventKind, WorkflowRunStatus, WorkflowRunStep,
    WorkflowRunStepStatus, WorkflowStep,
};
use dockyard_persistence::store::PersistenceError;
use dockyard_persistence::Store;
use dockyard_types::reliability::RetryPolicy;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::graph::{GraphError, StepGraph};
use crate::service::{self, SecretStore, ServiceRegistry};
use crate::template::{self, Environment, StepEnvEntry, TemplateError};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowRuntimeError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("workflow graph error: {0}")]
    Graph(#[from] GraphError),
}

/// Collaborators a running orchestration needs beyond the `Store`/
/// `EventBus` every dockyard crate takes. Bundled so `run_workflow_orchestration`
/// doesn't grow an unwieldy parameter list.
pub struct OrchestratorDeps {
    pub store: Arc<dyn Store>,
    pub events: Arc<EventBus>,
    pub job_registry: Arc<JobHandlerRegistry>,
    pub service_registry: Arc<ServiceRegistry>,
    pub secrets: Arc<SecretStore>,
    pub http_client: reqwest::Client,
}

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

#[instrument(skip(deps), fields(workflow_run_id = %run_id))]
pub async fn run_workflow_orchestration(
    deps: &OrchestratorDeps,
    run_id: Uuid,
) -> Result<WorkflowRun, WorkflowRuntimeError> {
    let mut run = deps.store.get_workflow_run(run_id).await?;
    if run.status.is_terminal() {
        return Ok(run);
    }

    let definition = deps.store.get_workflow_definition(run.workflow_definition_id).await?;
    let graph = StepGraph::build(&definition.steps)?;

    if run.status == WorkflowRunStatus::Pending {
        deps.store
            .update_workflow_run_status(run_id, WorkflowRunStatus::Pending, WorkflowRunStatus::Running, None)
            .await?;
        append_event(deps, run_id, WorkflowRunEventKind::Started).await;
        deps.events.publish(DomainEvent::WorkflowRunStarted {
            workflow_run_id: run_id,
            workflow_definition_id: definition.id,
            occurred_at: Utc::now(),
        });
        run = deps.store.get_workflow_run(run_id).await?;
    }

    loop {
        run = deps.store.get_workflow_run(run_id).await?;
        if run.status != WorkflowRunStatus::Running {
            return Ok(run);
        }

        let persisted_steps = deps.store.list_workflow_run_steps(run_id).await?;
        let step_status: HashMap<String, WorkflowRunStepStatus> = persisted_steps
            .iter()
            .filter(|s| s.fanout_parent_id.is_none())
            .map(|s| (s.step_id.clone(), s.status))
            .collect();

        // A step left `running` by a crashed worker is re-dispatched before
        // any new step starts (spec §4.D "Failure model": at-least-once).
        let resumable = persisted_steps
            .iter()
            .find(|s| s.fanout_parent_id.is_none() && s.status == WorkflowRunStepStatus::Running)
            .and_then(|s| graph.step(&s.step_id));

        let step = match resumable.or_else(|| graph.ready_steps(&step_status).first().copied()) {
            Some(step) => step,
            None => break,
        };

        let outcome = dispatch_step(deps, &definition, &run, &persisted_steps, step).await?;
        match outcome {
            StepOutcome::Succeeded => {}
            StepOutcome::Failed { message } => {
                fail_run_from_step(deps, run_id, &graph, step.id(), message).await?;
                return Ok(deps.store.get_workflow_run(run_id).await?);
            }
        }
    }

    run = deps.store.get_workflow_run(run_id).await?;
    if run.status != WorkflowRunStatus::Running {
        return Ok(run);
    }

    let final_steps = deps.store.list_workflow_run_steps(run_id).await?;
    let all_resolved = final_steps.iter().all(|s| {
        matches!(
            s.status,
            WorkflowRunStepStatus::Succeeded | WorkflowRunStepStatus::Skipped
        )
    });

    if all_resolved {
        deps.store
            .update_workflow_run_status(run_id, WorkflowRunStatus::Running, WorkflowRunStatus::Succeeded, None)
            .await?;
        append_event(deps, run_id, WorkflowRunEventKind::Completed).await;
        deps.events.publish(DomainEvent::WorkflowRunSucceeded {
            workflow_run_id: run_id,
            occurred_at: Utc::now(),
        });
        info!(workflow_run_id = %run_id, "workflow run succeeded");
    }

    Ok(deps.store.get_workflow_run(run_id).await?)
}

enum StepOutcome {
    Succeeded,
    Failed { message: String },
}

#[instrument(skip(deps, definition, run, persisted_steps, step), fields(step_id = %step.id()))]
async fn dispatch_step(
    deps: &OrchestratorDeps,
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    persisted_steps: &[WorkflowRunStep],
    step: &WorkflowStep,
) -> Result<StepOutcome, WorkflowRuntimeError> {
    let existing = persisted_steps
        .iter()
        .find(|s| s.step_id == step.id() && s.fanout_parent_id.is_none())
        .cloned();

    let run_step = match existing {
        Some(existing) => existing,
        None => {
            let now = Utc::now();
            let created = deps
                .store
                .create_workflow_run_step(WorkflowRunStep {
                    id: Uuid::now_v7(),
                    workflow_run_id: run.id,
                    step_id: step.id().to_string(),
                    status: WorkflowRunStepStatus::Running,
                    attempt: 1,
                    job_run_id: None,
                    input: Value::Null,
                    output: None,
                    metrics: Value::Null,
                    error_message: None,
                    fanout_parent_id: None,
                    fanout_index: None,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
            append_event(
                deps,
                run.id,
                WorkflowRunEventKind::StepStarted { step_id: step.id().to_string(), attempt: 1 },
            )
            .await;
            created
        }
    };

    let env = build_environment(deps, run, persisted_steps).await?;

    let dispatch_result = match step {
        WorkflowStep::Job { .. } => dispatch_job_step(deps, run, step, &env).await,
        WorkflowStep::Service { .. } => dispatch_service_step(deps, step, &env).await,
        WorkflowStep::FanOut { .. } => {
            dispatch_fanout_step(deps, run, step, &env, persisted_steps).await
        }
    };

    match dispatch_result {
        Ok(StepSuccess { output }) => {
            deps.store
                .update_workflow_run_step_status(
                    run_step.id,
                    WorkflowRunStepStatus::Running,
                    WorkflowRunStepStatus::Succeeded,
                    Some(run_step.attempt),
                    Some(output.clone()),
                    None,
                    None,
                )
                .await?;
            record_produced_assets(deps, definition, run, step, &output, &env).await?;
            append_event(
                deps,
                run.id,
                WorkflowRunEventKind::StepSucceeded { step_id: step.id().to_string() },
            )
            .await;
            deps.events.publish(DomainEvent::WorkflowRunStepCompleted {
                workflow_run_id: run.id,
                step_id: step.id().to_string(),
                succeeded: true,
                occurred_at: Utc::now(),
            });
            Ok(StepOutcome::Succeeded)
        }
        Err(err) => {
            let retry_policy = step_retry_policy(step);
            let retryable = err.kind.is_retryable() && retry_policy.has_attempts_remaining(run_step.attempt);
            if retryable {
                let delay = retry_policy.delay_for_attempt(run_step.attempt + 1);
                tokio::time::sleep(delay).await;
                deps.store
                    .update_workflow_run_step_status(
                        run_step.id,
                        WorkflowRunStepStatus::Running,
                        WorkflowRunStepStatus::Running,
                        Some(run_step.attempt + 1),
                        None,
                        None,
                        Some(err.message.clone()),
                    )
                    .await?;
                // retried in place: the step row keeps its identity, only
                // `attempt` advances on the existing row.
                Box::pin(retry_step(deps, run, step, run_step.attempt + 1)).await
            } else {
                deps.store
                    .update_workflow_run_step_status(
                        run_step.id,
                        WorkflowRunStepStatus::Running,
                        WorkflowRunStepStatus::Failed,
                        Some(run_step.attempt),
                        None,
                        None,
                        Some(err.message.clone()),
                    )
                    .await?;
                append_event(
                    deps,
                    run.id,
                    WorkflowRunEventKind::StepFailed {
                        step_id: step.id().to_string(),
                        retryable: false,
                    },
                )
                .await;
                deps.events.publish(DomainEvent::WorkflowRunStepCompleted {
                    workflow_run_id: run.id,
                    step_id: step.id().to_string(),
                    succeeded: false,
                    occurred_at: Utc::now(),
                });
                Ok(StepOutcome::Failed { message: err.message })
            }
        }
    }
}

async fn retry_step(
    deps: &OrchestratorDeps,
    run: &WorkflowRun,
    step: &WorkflowStep,
    attempt: u32,
) -> Result<StepOutcome, WorkflowRuntimeError> {
    let persisted_steps = deps.store.list_workflow_run_steps(run.id).await?;
    let env = build_environment(deps, run, &persisted_steps).await?;
    let run_step = persisted_steps
        .iter()
        .find(|s| s.step_id == step.id() && s.fanout_parent_id.is_none())
        .cloned()
        .ok_or_else(|| PersistenceError::WorkflowRunStepNotFound(run.id))?;

    let dispatch_result = match step {
        WorkflowStep::Job { .. } => dispatch_job_step(deps, run, step, &env).await,
        WorkflowStep::Service { .. } => dispatch_service_step(deps, step, &env).await,
        WorkflowStep::FanOut { .. } => {
            dispatch_fanout_step(deps, run, step, &env, &persisted_steps).await
        }
    };

    match dispatch_result {
        Ok(success) => {
            deps.store
                .update_workflow_run_step_status(
                    run_step.id,
                    WorkflowRunStepStatus::Running,
                    WorkflowRunStepStatus::Succeeded,
                    Some(attempt),
                    Some(success.output.clone()),
                    None,
                    None,
                )
                .await?;
            append_event(
                deps,
                run.id,
                WorkflowRunEventKind::StepSucceeded { step_id: step.id().to_string() },
            )
            .await;
            Ok(StepOutcome::Succeeded)
        }
        Err(err) => {
            let retry_policy = step_retry_policy(step);
            if err.kind.is_retryable() && retry_policy.has_attempts_remaining(attempt) {
                let delay = retry_policy.delay_for_attempt(attempt + 1);
                tokio::time::sleep(delay).await;
                Box::pin(retry_step(deps, run, step, attempt + 1)).await
            } else {
                deps.store
                    .update_workflow_run_step_status(
                        run_step.id,
                        WorkflowRunStepStatus::Running,
                        WorkflowRunStepStatus::Failed,
                        Some(attempt),
                        None,
                        None,
                        Some(err.message.clone()),
                    )
                    .await?;
                append_event(
                    deps,
                    run.id,
                    WorkflowRunEventKind::StepFailed { step_id: step.id().to_string(), retryable: false },
                )
                .await;
                Ok(StepOutcome::Failed { message: err.message })
            }
        }
    }
}

struct StepSuccess {
    output: Value,
}

fn step_retry_policy(step: &WorkflowStep) -> RetryPolicy {
    match step {
        WorkflowStep::Job { retry_override, .. } => retry_override.clone().unwrap_or_default(),
        WorkflowStep::Service { .. } => RetryPolicy::no_retry(),
        WorkflowStep::FanOut { .. } => RetryPolicy::no_retry(),
    }
}

async fn dispatch_job_step(
    deps: &OrchestratorDeps,
    run: &WorkflowRun,
    step: &WorkflowStep,
    env: &Environment,
) -> Result<StepSuccess, dockyard_types::DockyardError> {
    let WorkflowStep::Job {
        job_slug,
        parameter_template,
        retry_override,
        timeout_override,
        ..
    } = step
    else {
        unreachable!("dispatch_job_step called with non-job step")
    };

    let parameters = template::resolve(parameter_template, env)
        .map_err(template_error_to_dockyard)?;

    let definition = deps
        .store
        .get_job_definition_by_slug(job_slug)
        .await
        .map_err(persistence_error_to_dockyard)?;

    let now = Utc::now();
    let mut job_run = JobRun {
        id: Uuid::now_v7(),
        job_definition_id: definition.id,
        status: JobRunStatus::Pending,
        parameters,
        result: None,
        metrics: Value::Null,
        error_message: None,
        error_kind: None,
        attempt: 0,
        max_attempts: retry_override
            .clone()
            .map(|p| p.max_attempts)
            .unwrap_or(definition.retry_policy.max_attempts),
        triggered_by: RunTrigger::Workflow,
        workflow_run_step_id: None,
        trace_context: run.trace_context.clone(),
        scheduled_at: now,
        started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    };
    let _ = timeout_override;
    job_run = deps
        .store
        .create_job_run(job_run)
        .await
        .map_err(persistence_error_to_dockyard)?;

    let completed = dockyard_jobs::execute_job_run(&deps.store, &deps.events, &deps.job_registry, job_run.id)
        .await
        .map_err(|e| dockyard_types::DockyardError::fatal(e.to_string()))?;

    match completed.status {
        JobRunStatus::Succeeded => Ok(StepSuccess {
            output: completed.result.unwrap_or(Value::Null),
        }),
        _ => {
            let message = completed
                .error_message
                .unwrap_or_else(|| format!("job run {} ended in status {:?}", completed.id, completed.status));
            let kind = match completed.status {
                JobRunStatus::Expired => dockyard_types::ErrorKind::Timeout,
                _ => dockyard_types::ErrorKind::RetriableIo,
            };
            Err(dockyard_types::DockyardError::new(kind, message))
        }
    }
}

async fn dispatch_service_step(
    deps: &OrchestratorDeps,
    step: &WorkflowStep,
    env: &Environment,
) -> Result<StepSuccess, dockyard_types::DockyardError> {
    let WorkflowStep::Service {
        service_slug,
        method,
        path_template,
        query_template,
        headers_template,
        body_template,
        require_healthy,
        allow_degraded,
        timeout_override,
        capture_response,
        ..
    } = step
    else {
        unreachable!("dispatch_service_step called with non-service step")
    };

    let endpoint = deps
        .service_registry
        .get(service_slug)
        .ok_or_else(|| dockyard_types::DockyardError::validation(format!("unknown service: {service_slug}")))?;

    let path = template::resolve(&Value::String(path_template.clone()), env)
        .map_err(template_error_to_dockyard)?
        .as_str()
        .unwrap_or_default()
        .to_string();

    let mut query = HashMap::new();
    for (name, value_template) in query_template {
        let resolved = template::resolve(&Value::String(value_template.clone()), env)
            .map_err(template_error_to_dockyard)?;
        query.insert(name.clone(), resolved.as_str().unwrap_or_default().to_string());
    }

    let mut headers = HashMap::new();
    for (name, value_template) in headers_template {
        let resolved = template::resolve(&Value::String(value_template.clone()), env)
            .map_err(template_error_to_dockyard)?;
        let resolved = resolved.as_str().unwrap_or_default();
        let expanded = deps.secrets.expand(resolved)?;
        headers.insert(name.clone(), expanded);
    }

    let body = match body_template {
        Some(template) => Some(template::resolve(template, env).map_err(template_error_to_dockyard)?),
        None => None,
    };

    let response = service::dispatch(
        &deps.http_client,
        &endpoint,
        *require_healthy,
        *allow_degraded,
        method,
        &path,
        &query,
        &headers,
        body.as_ref(),
        timeout_override.unwrap_or(DEFAULT_STEP_TIMEOUT),
        *capture_response,
    )
    .await?;

    let output = serde_json::json!({
        "status": response.status,
        "headers": response.headers,
        "body": response.body,
    });

    Ok(StepSuccess { output })
}

async fn dispatch_fanout_step(
    deps: &OrchestratorDeps,
    run: &WorkflowRun,
    step: &WorkflowStep,
    env: &Environment,
    persisted_steps: &[WorkflowRunStep],
) -> Result<StepSuccess, dockyard_types::DockyardError> {
    let WorkflowStep::FanOut {
        id,
        collection_template,
        max_items,
        max_concurrency,
        template: item_template,
        ..
    } = step
    else {
        unreachable!("dispatch_fanout_step called with non-fanout step")
    };

    let collection = template::resolve(&Value::String(collection_template.clone()), env)
        .map_err(template_error_to_dockyard)?;
    let mut items = match collection {
        Value::Array(items) => items,
        other => return Err(dockyard_types::DockyardError::validation(format!(
            "fan-out collection did not resolve to an array: {other}"
        ))),
    };
    if let Some(max) = max_items {
        items.truncate(*max);
    }

    let existing_children: HashMap<i32, WorkflowRunStep> = persisted_steps
        .iter()
        .filter(|s| s.fanout_parent_id.as_deref() == Some(id.as_str()))
        .map(|s| (s.fanout_index.unwrap_or(-1), s.clone()))
        .collect();

    let semaphore = Arc::new(tokio::sync::Semaphore::new((*max_concurrency).max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let child_template = (**item_template).clone();
        let already = existing_children.get(&(index as i32)).cloned();
        let parent_id = id.clone();
        let mut child_env = env.clone();
        child_env.shared = merge_item_into_shared(&child_env.shared, &item);

        let store = deps.store.clone();
        let events = deps.events.clone();
        let job_registry = deps.job_registry.clone();
        let service_registry = deps.service_registry.clone();
        let secrets = deps.secrets.clone();
        let http_client = deps.http_client.clone();
        let run_id = run.id;
        let run_trace = run.trace_context.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let child_deps = OrchestratorDeps {
                store: store.clone(),
                events,
                job_registry,
                service_registry,
                secrets,
                http_client,
            };

            let run_step = match already {
                Some(existing) => existing,
                None => {
                    let now = Utc::now();
                    store
                        .create_workflow_run_step(WorkflowRunStep {
                            id: Uuid::now_v7(),
                            workflow_run_id: run_id,
                            step_id: format!("{parent_id}[{index}]"),
                            status: WorkflowRunStepStatus::Running,
                            attempt: 1,
                            job_run_id: None,
                            input: item.clone(),
                            output: None,
                            metrics: Value::Null,
                            error_message: None,
                            fanout_parent_id: Some(parent_id.clone()),
                            fanout_index: Some(index as i32),
                            created_at: now,
                            updated_at: now,
                        })
                        .await
                        .expect("create fan-out child step")
                }
            };

            if run_step.status.is_terminal() {
                return (index, run_step.clone());
            }

            let dispatch_result: Result<StepSuccess, dockyard_types::DockyardError> = match &child_template {
                WorkflowStep::Job { .. } => {
                    let stub_run = WorkflowRun { id: run_id, trace_context: run_trace, ..placeholder_run() };
                    dispatch_job_step(&child_deps, &stub_run, &child_template, &child_env).await
                }
                WorkflowStep::Service { .. } => {
                    dispatch_service_step(&child_deps, &child_template, &child_env).await
                }
                WorkflowStep::FanOut { .. } => Err(dockyard_types::DockyardError::validation(
                    "nested fan-out templates are not supported",
                )),
            };

            match dispatch_result {
                Ok(success) => {
                    let _ = store
                        .update_workflow_run_step_status(
                            run_step.id,
                            WorkflowRunStepStatus::Running,
                            WorkflowRunStepStatus::Succeeded,
                            None,
                            Some(success.output),
                            None,
                            None,
                        )
                        .await;
                    (index, store.get_workflow_run_step(run_step.id).await.unwrap_or(run_step))
                }
                Err(err) => {
                    let _ = store
                        .update_workflow_run_step_status(
                            run_step.id,
                            WorkflowRunStepStatus::Running,
                            WorkflowRunStepStatus::Failed,
                            None,
                            None,
                            None,
                            Some(err.message),
                        )
                        .await;
                    (index, store.get_workflow_run_step(run_step.id).await.unwrap_or(run_step))
                }
            }
        }));
    }

    let mut results: Vec<Option<Value>> = vec![None; handles.len()];
    let mut any_failed = false;
    for handle in handles {
        let (index, child_step) = handle.await.expect("fan-out child task panicked");
        if child_step.status == WorkflowRunStepStatus::Succeeded {
            results[index] = child_step.output;
        } else {
            any_failed = true;
        }
    }

    if any_failed {
        return Err(dockyard_types::DockyardError::new(
            dockyard_types::ErrorKind::Fatal,
            format!("fan-out step {id} had one or more failed children"),
        ));
    }

    Ok(StepSuccess {
        output: Value::Array(results.into_iter().map(|v| v.unwrap_or(Value::Null)).collect()),
    })
}

fn merge_item_into_shared(shared: &Value, item: &Value) -> Value {
    let mut map = shared.as_object().cloned().unwrap_or_default();
    map.insert("item".to_string(), item.clone());
    Value::Object(map)
}

/// A throwaway `WorkflowRun` used only to satisfy `dispatch_job_step`'s
/// signature when dispatching a fan-out child: only `id` and
/// `trace_context` are read by that function.
fn placeholder_run() -> WorkflowRun {
    let now = Utc::now();
    WorkflowRun {
        id: Uuid::nil(),
        workflow_definition_id: Uuid::nil(),
        status: WorkflowRunStatus::Running,
        parameters: Value::Null,
        shared: Value::Null,
        metrics: Value::Null,
        triggered_by: RunTrigger::Workflow,
        trigger_payload: None,
        trace_context: None,
        error_message: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
    }
}

async fn record_produced_assets(
    deps: &OrchestratorDeps,
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    step: &WorkflowStep,
    output: &Value,
    env: &Environment,
) -> Result<(), WorkflowRuntimeError> {
    let declarations: &[AssetDeclaration] = match step {
        WorkflowStep::Job { produces, .. } => produces,
        WorkflowStep::Service { produces, .. } => produces,
        WorkflowStep::FanOut { .. } => &[],
    };

    for declaration in declarations {
        let partition_key = match &declaration.partition_key_template {
            Some(template_str) => template::resolve(&Value::String(template_str.clone()), env)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            None => String::new(),
        };
        deps.store
            .record_produced_asset(ProducedAsset {
                id: Uuid::now_v7(),
                asset_id: declaration.asset_id.clone(),
                partition_key,
                workflow_definition_id: definition.id,
                workflow_run_id: run.id,
                step_id: step.id().to_string(),
                payload: output.clone(),
                produced_at: Utc::now(),
            })
            .await?;
        deps.events.publish(DomainEvent::AssetProduced {
            asset_id: declaration.asset_id.clone(),
            partition_key: String::new(),
            workflow_run_id: run.id,
            occurred_at: Utc::now(),
        });
    }
    Ok(())
}

async fn build_environment(
    deps: &OrchestratorDeps,
    run: &WorkflowRun,
    persisted_steps: &[WorkflowRunStep],
) -> Result<Environment, WorkflowRuntimeError> {
    let mut steps = HashMap::new();
    for step in persisted_steps {
        if step.fanout_parent_id.is_some() {
            continue;
        }
        if step.status == WorkflowRunStepStatus::Succeeded {
            steps.insert(
                step.step_id.clone(),
                StepEnvEntry {
                    output: step.output.clone(),
                    response: step.output.clone(),
                },
            );
        }
    }

    let definition = deps.store.get_workflow_definition(run.workflow_definition_id).await?;
    let mut assets = HashMap::new();
    for consumer in &definition.consumes {
        let partition_key = consumer.partition_key_template.clone().unwrap_or_default();
        if let Some(asset) = deps.store.latest_asset(&consumer.asset_id, &partition_key).await? {
            assets.insert(consumer.asset_id.clone(), asset.payload);
        }
    }

    Ok(Environment {
        parameters: run.parameters.clone(),
        steps,
        shared: run.shared.clone(),
        run_id: run.id,
        triggered_by: run.triggered_by,
        trigger_payload: run.trigger_payload.clone(),
        assets,
    })
}

async fn fail_run_from_step(
    deps: &OrchestratorDeps,
    run_id: Uuid,
    graph: &StepGraph<'_>,
    failed_step_id: &str,
    message: String,
) -> Result<(), WorkflowRuntimeError> {
    let descendants = graph.descendants_of(failed_step_id);
    let persisted_steps = deps.store.list_workflow_run_steps(run_id).await?;
    for descendant_id in descendants {
        if let Some(existing) = persisted_steps
            .iter()
            .find(|s| s.step_id == descendant_id && s.fanout_parent_id.is_none())
        {
            if !existing.status.is_terminal() {
                deps.store
                    .update_workflow_run_step_status(
                        existing.id,
                        existing.status,
                        WorkflowRunStepStatus::Skipped,
                        None,
                        None,
                        None,
                        Some("ancestor step failed".to_string()),
                    )
                    .await?;
                append_event(
                    deps,
                    run_id,
                    WorkflowRunEventKind::StepSkipped {
                        step_id: descendant_id.to_string(),
                        reason: "ancestor step failed".to_string(),
                    },
                )
                .await;
            }
        } else {
            let now = Utc::now();
            deps.store
                .create_workflow_run_step(WorkflowRunStep {
                    id: Uuid::now_v7(),
                    workflow_run_id: run_id,
                    step_id: descendant_id.to_string(),
                    status: WorkflowRunStepStatus::Skipped,
                    attempt: 0,
                    job_run_id: None,
                    input: Value::Null,
                    output: None,
                    metrics: Value::Null,
                    error_message: Some("ancestor step failed".to_string()),
                    fanout_parent_id: None,
                    fanout_index: None,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }
    }

    deps.store
        .update_workflow_run_status(
            run_id,
            WorkflowRunStatus::Running,
            WorkflowRunStatus::Failed,
            Some(message.clone()),
        )
        .await?;
    append_event(deps, run_id, WorkflowRunEventKind::Failed { message: message.clone() }).await;
    deps.events.publish(DomainEvent::WorkflowRunFailed { workflow_run_id: run_id, occurred_at: Utc::now() });
    warn!(workflow_run_id = %run_id, step_id = %failed_step_id, %message, "workflow run failed");
    Ok(())
}

/// Cancel a running workflow run: sets the run `canceled`, cascades
/// `skipped` to every non-terminal step, and persists the reason. Does not
/// require the orchestrator loop to be live — a concurrent orchestrator
/// observes the status change the next time it re-reads the run (spec
/// §4.D "Cancellation is cooperative").
pub async fn cancel_workflow_run(
    store: &Arc<dyn Store>,
    events: &Arc<EventBus>,
    run_id: Uuid,
    reason: String,
) -> Result<bool, WorkflowRuntimeError> {
    let transitioned = store
        .update_workflow_run_status(run_id, WorkflowRunStatus::Running, WorkflowRunStatus::Canceled, Some(reason.clone()))
        .await?;
    if !transitioned {
        return Ok(false);
    }

    let steps = store.list_workflow_run_steps(run_id).await?;
    for step in steps {
        if !step.status.is_terminal() {
            store
                .update_workflow_run_step_status(
                    step.id,
                    step.status,
                    WorkflowRunStepStatus::Skipped,
                    None,
                    None,
                    None,
                    Some(reason.clone()),
                )
                .await?;
        }
    }

    store
        .append_workflow_run_event(WorkflowRunEvent {
            id: Uuid::now_v7(),
            workflow_run_id: run_id,
            kind: WorkflowRunEventKind::Canceled { reason },
            occurred_at: Utc::now(),
        })
        .await?;
    events.publish(DomainEvent::WorkflowRunCanceled { workflow_run_id: run_id, occurred_at: Utc::now() });
    Ok(true)
}

async fn append_event(deps: &OrchestratorDeps, run_id: Uuid, kind: WorkflowRunEventKind) {
    let result = deps
        .store
        .append_workflow_run_event(WorkflowRunEvent {
            id: Uuid::now_v7(),
            workflow_run_id: run_id,
            kind,
            occurred_at: Utc::now(),
        })
        .await;
    if let Err(err) = result {
        warn!(workflow_run_id = %run_id, %err, "failed to append workflow run event");
    }
}

fn template_error_to_dockyard(err: TemplateError) -> dockyard_types::DockyardError {
    dockyard_types::DockyardError::validation(err.to_string())
}

fn persistence_error_to_dockyard(err: PersistenceError) -> dockyard_types::DockyardError {
    let kind: dockyard_types::ErrorKind = (&err).into();
    dockyard_types::DockyardError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_jobs::JobHandler;
    use dockyard_persistence::model::JobDefinition;
    use dockyard_persistence::InMemoryStore;
    use serde_json::json;

    fn deps(store: Arc<dyn Store>, events: Arc<EventBus>, job_registry: JobHandlerRegistry) -> OrchestratorDeps {
        OrchestratorDeps {
            store,
            events,
            job_registry: Arc::new(job_registry),
            service_registry: Arc::new(ServiceRegistry::default()),
            secrets: Arc::new(SecretStore::default()),
            http_client: reqwest::Client::new(),
        }
    }

    async fn create_definition(store: &Arc<dyn Store>, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        store
            .create_workflow_definition(WorkflowDefinition {
                id: Uuid::now_v7(),
                slug: "test-workflow".to_string(),
                version: 1,
                steps,
                consumes: vec![],
                schedule: None,
                event_triggers: vec![],
                default_parameters: json!({}),
                metadata: json!({}),
                active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    async fn create_run(store: &Arc<dyn Store>, definition_id: Uuid) -> WorkflowRun {
        let now = Utc::now();
        store
            .create_workflow_run(WorkflowRun {
                id: Uuid::now_v7(),
                workflow_definition_id: definition_id,
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
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn zero_step_workflow_succeeds_immediately() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let definition = create_definition(&store, vec![]).await;
        let run = create_run(&store, definition.id).await;

        let deps = deps(store.clone(), events, JobHandlerRegistry::new());
        let result = run_workflow_orchestration(&deps, run.id).await.unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Succeeded);
    }

    #[tokio::test]
    async fn single_job_step_runs_to_completion() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());

        store
            .create_job_definition(JobDefinition {
                id: Uuid::now_v7(),
                slug: "test.echo".to_string(),
                version: 1,
                entry_point: "echo".to_string(),
                default_parameters: json!({}),
                parameters_schema: None,
                timeout: Duration::from_secs(5),
                retry_policy: RetryPolicy::exponential(),
                metadata: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let step = WorkflowStep::Job {
            id: "echo".to_string(),
            job_slug: "test.echo".to_string(),
            parameter_template: json!({ "value": 1 }),
            retry_override: None,
            timeout_override: None,
            store_result_as: Some("echoed".to_string()),
            produces: vec![],
            depends_on: vec![],
        };
        let definition = create_definition(&store, vec![step]).await;
        let run = create_run(&store, definition.id).await;

        let mut registry = JobHandlerRegistry::new();
        let echo: Arc<dyn JobHandler> =
            Arc::new(|_ctx: &dockyard_jobs::context::JobRunContext, params: Value| async move { Ok(params) });
        registry.register("echo", echo);

        let deps = deps(store.clone(), events, registry);
        let result = run_workflow_orchestration(&deps, run.id).await.unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Succeeded);

        let steps = store.list_workflow_run_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, WorkflowRunStepStatus::Succeeded);
    }

    #[tokio::test]
    async fn job_step_with_no_registered_handler_fails_the_run() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());

        store
            .create_job_definition(JobDefinition {
                id: Uuid::now_v7(),
                slug: "test.missing".to_string(),
                version: 1,
                entry_point: "missing".to_string(),
                default_parameters: json!({}),
                parameters_schema: None,
                timeout: Duration::from_secs(5),
                retry_policy: RetryPolicy::no_retry(),
                metadata: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let step = WorkflowStep::Job {
            id: "missing".to_string(),
            job_slug: "test.missing".to_string(),
            parameter_template: json!({}),
            retry_override: None,
            timeout_override: None,
            store_result_as: None,
            produces: vec![],
            depends_on: vec![],
        };
        let definition = create_definition(&store, vec![step]).await;
        let run = create_run(&store, definition.id).await;

        let deps = deps(store.clone(), events, JobHandlerRegistry::new());
        let result = run_workflow_orchestration(&deps, run.id).await.unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Failed);
    }

    #[tokio::test]
    async fn already_terminal_run_is_a_no_op() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
        let events = Arc::new(EventBus::default());
        let definition = create_definition(&store, vec![]).await;
        let run = create_run(&store, definition.id).await;

        let deps = deps(store.clone(), events, JobHandlerRegistry::new());
        let first = run_workflow_orchestration(&deps, run.id).await.unwrap();
        assert_eq!(first.status, WorkflowRunStatus::Succeeded);

        let second = run_workflow_orchestration(&deps, run.id).await.unwrap();
        assert_eq!(second.status, WorkflowRunStatus::Succeeded);
    }
}
