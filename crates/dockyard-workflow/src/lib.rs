//! Workflow orchestrator (spec §4.D): the step dependency graph, the
//! parameter template language, service-step HTTP dispatch, and the
//! `run_workflow_orchestration` state machine that drives a `WorkflowRun`
//! from `pending` to a terminal status.

pub mod consumer;
pub mod graph;
pub mod runtime;
pub mod service;
pub mod template;

pub use consumer::WorkflowRunConsumer;
pub use graph::StepGraph;
pub use runtime::{cancel_workflow_run, run_workflow_orchestration, OrchestratorDeps, WorkflowRuntimeError};
pub use service::{SecretStore, ServiceEndpoint, ServiceRegistry};
pub use template::Environment;
