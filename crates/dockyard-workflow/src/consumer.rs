//! Adapts [`run_workflow_orchestration`] to the [`dockyard_queue::Consumer`]
//! interface, mirroring `dockyard_jobs::JobRunConsumer`. Registered against
//! the `workflow` queue.

use std::sync::Arc;

use async_trait::async_trait;
use dockyard_queue::queue::Consumer;
use dockyard_types::DockyardError;
use serde_json::Value;
use uuid::Uuid;

use crate::runtime::{run_workflow_orchestration, OrchestratorDeps};

pub struct WorkflowRunConsumer {
    deps: Arc<OrchestratorDeps>,
}

impl WorkflowRunConsumer {
    pub fn new(deps: Arc<OrchestratorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Consumer for WorkflowRunConsumer {
    async fn consume(&self, _message_id: Uuid, payload: Value) -> Result<(), DockyardError> {
        let workflow_run_id: Uuid = payload
            .get("workflowRunId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| DockyardError::validation("message payload missing workflowRunId"))?;

        run_workflow_orchestration(&self.deps, workflow_run_id)
            .await
            .map_err(|err| DockyardError::fatal(err.to_string()))?;
        Ok(())
    }
}
