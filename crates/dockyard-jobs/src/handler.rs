//! `JobHandler` trait + process-wide registry.
//!
//! Grounded in `durable::engine::registry::WorkflowRegistry`: type-erased
//! registration by string key, looked up at dispatch time. Unlike the
//! teacher's registry (which wraps a typed `Workflow` behind an `AnyWorkflow`
//! factory), handlers here already operate on `Value` directly — job
//! parameters and results are untyped JSON per spec, so no wrapper/factory
//! indirection is needed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dockyard_types::DockyardError;
use serde_json::Value;

use crate::context::JobRunContext;

/// A registered unit of work, looked up by a job definition's `entry_point`.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: &JobRunContext, parameters: Value) -> Result<Value, DockyardError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(&JobRunContext, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, DockyardError>> + Send + 'static,
{
    async fn execute(&self, ctx: &JobRunContext, parameters: Value) -> Result<Value, DockyardError> {
        (self)(ctx, parameters).await
    }
}

/// Maps an `entry_point` string to a registered handler. Handlers are
/// registered once at process init; the registry is otherwise read-only.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry_point: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(entry_point.into(), handler);
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.handlers.contains_key(entry_point)
    }

    pub fn resolve(&self, entry_point: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(entry_point).cloned()
    }
}

impl fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("entry_points", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
