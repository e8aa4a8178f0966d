//! `JobRunContext`: what a handler sees during `execute`.
//!
//! Generalized from `durable::activity::context::ActivityContext` (attempt
//! bookkeeping, a cancellation flag, a heartbeat channel). Job handlers in
//! this spec are plain async functions invoked under a timeout, not
//! long-running heartbeat-driven activities, so the heartbeat channel is
//! replaced with a `tracing::Span`-scoped logger and an `update(patch)`
//! callback that accumulates partial metrics for step 6's persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::Span;
use uuid::Uuid;

#[derive(Debug)]
pub struct JobRunContext {
    pub job_run_id: Uuid,
    parameters: Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    metrics: Arc<Mutex<Value>>,
    span: Span,
}

impl JobRunContext {
    pub fn new(
        job_run_id: Uuid,
        parameters: Value,
        attempt: u32,
        max_attempts: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let span = tracing::info_span!("job_run", %job_run_id, attempt);
        Self {
            job_run_id,
            parameters,
            attempt,
            max_attempts,
            scheduled_at,
            metrics: Arc::new(Mutex::new(Value::Object(Default::default()))),
            span,
        }
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn logger(&self) -> &Span {
        &self.span
    }

    /// Merge `patch` into the accumulated metrics object. Non-object patches
    /// replace the whole value, matching `serde_json`'s merge convention
    /// elsewhere in this workspace (shared-namespace writes, step output).
    pub fn update(&self, patch: Value) {
        let mut metrics = self.metrics.lock();
        match (&mut *metrics, patch) {
            (Value::Object(current), Value::Object(incoming)) => {
                current.extend(incoming);
            }
            (slot, patch) => *slot = patch,
        }
    }

    /// Final metrics snapshot, read by `execute_job_run` after the handler
    /// returns (success or failure) for persistence.
    pub fn snapshot_metrics(&self) -> Value {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_merges_object_patches() {
        let ctx = JobRunContext::new(Uuid::now_v7(), Value::Null, 1, 3, Utc::now());
        ctx.update(serde_json::json!({"rows_processed": 10}));
        ctx.update(serde_json::json!({"bytes_written": 512}));
        assert_eq!(
            ctx.snapshot_metrics(),
            serde_json::json!({"rows_processed": 10, "bytes_written": 512})
        );
    }

    #[test]
    fn is_last_attempt_matches_max() {
        let ctx = JobRunContext::new(Uuid::now_v7(), Value::Null, 3, 3, Utc::now());
        assert!(ctx.is_last_attempt());
        let ctx = JobRunContext::new(Uuid::now_v7(), Value::Null, 2, 3, Utc::now());
        assert!(!ctx.is_last_attempt());
    }
}
