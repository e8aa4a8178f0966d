//! Event ingestion entrypoint (spec §4.E, step 1-2): normalize the raw
//! producer payload, run it past the per-source admission circuit, record
//! ingest-rate accounting, then forward the envelope to both the audit
//! queue and the trigger-evaluation queue. Trigger evaluation itself lives
//! in [`crate::trigger`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dockyard_persistence::model::AuditEvent;
use dockyard_persistence::store::Store;
use dockyard_queue::api::{enqueue_event_trigger_evaluation, enqueue_workflow_event, EnqueueApiError};
use dockyard_queue::queue::{Consumer, Queue};
use dockyard_types::DockyardError;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::circuit::{Admission, SourceAdmission};
use crate::envelope::EventEnvelope;

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceRateStats {
    pub total: u64,
    pub dropped: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Per-source ingest-rate accounting: total/dropped counts and recency,
/// exposed to `dockyard-telemetry` via [`IngestStats::snapshot`].
#[derive(Default)]
pub struct IngestStats {
    by_source: DashMap<String, SourceRateStats>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, source: &str, occurred_at: DateTime<Utc>, dropped: bool) {
        let mut stats = self.by_source.entry(source.to_string()).or_default();
        stats.total += 1;
        if dropped {
            stats.dropped += 1;
        }
        stats.last_event_at = Some(occurred_at);
    }

    pub fn snapshot(&self) -> Vec<(String, SourceRateStats)> {
        self.by_source.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

pub struct EventIngestor {
    queue: Arc<dyn Queue>,
    admission: Arc<SourceAdmission>,
    stats: Arc<IngestStats>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid event envelope: {0}")]
    InvalidEnvelope(String),
    #[error("enqueue failed: {0}")]
    Enqueue(#[from] EnqueueApiError),
}

impl From<&IngestError> for DockyardError {
    fn from(err: &IngestError) -> Self {
        match err {
            IngestError::InvalidEnvelope(msg) => DockyardError::validation(msg.clone()),
            IngestError::Enqueue(e) => DockyardError::from(e),
        }
    }
}

pub struct IngestOutcome {
    pub envelope_id: Uuid,
    pub admitted: bool,
}

impl EventIngestor {
    pub fn new(queue: Arc<dyn Queue>, admission: Arc<SourceAdmission>, stats: Arc<IngestStats>) -> Self {
        Self { queue, admission, stats }
    }

    /// Processes one raw producer payload end to end. Denied envelopes
    /// (source circuit open) are still persisted for audit via the `event`
    /// queue, but are never forwarded to trigger evaluation — matching
    /// spec §4.E's "denial increments dropped/throttled counters but the
    /// envelope is still persisted for audit in inline mode".
    pub async fn ingest(&self, raw: Value) -> Result<IngestOutcome, IngestError> {
        let envelope = EventEnvelope::normalize(raw, Utc::now()).map_err(IngestError::InvalidEnvelope)?;

        let admission = self.admission.check(&envelope.source);
        let admitted = admission == Admission::Allowed;
        self.stats.record(&envelope.source, envelope.occurred_at, !admitted);

        if !admitted {
            warn!(source = %envelope.source, envelope_id = %envelope.id, "event source circuit open, dropping from trigger evaluation");
        }

        enqueue_workflow_event(&self.queue, envelope.to_json()).await?;

        if admitted {
            enqueue_event_trigger_evaluation(&self.queue, envelope.to_json()).await?;
        }

        info!(source = %envelope.source, envelope_id = %envelope.id, admitted, "ingested event envelope");

        Ok(IngestOutcome {
            envelope_id: envelope.id,
            admitted,
        })
    }

    /// Called by `EventTriggerConsumer` after evaluating all triggers for
    /// a source, so repeated evaluation failures eventually open the
    /// circuit rather than hammering a flaky upstream forever.
    pub fn record_source_result(&self, source: &str, succeeded: bool) {
        if succeeded {
            self.admission.record_success(source);
        } else {
            self.admission.record_failure(source);
        }
    }
}

pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Registered on `QueueName::Event`: the audit half of `EventIngestor::ingest`,
/// persisting every envelope (admitted or denied) as an `AuditEvent` row.
pub struct EventAuditConsumer {
    store: Arc<dyn Store>,
}

impl EventAuditConsumer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Consumer for EventAuditConsumer {
    async fn consume(&self, _message_id: Uuid, payload: Value) -> Result<(), DockyardError> {
        let envelope: EventEnvelope = serde_json::from_value(payload)
            .map_err(|err| DockyardError::validation(format!("invalid event envelope: {err}")))?;

        self.store
            .record_audit_event(AuditEvent {
                id: Uuid::now_v7(),
                entity_type: "event_envelope".to_string(),
                entity_id: envelope.id,
                action: "ingested".to_string(),
                detail: envelope.to_json(),
                created_at: envelope.occurred_at,
            })
            .await
            .map_err(|err| DockyardError::new((&err).into(), err.to_string()))
    }
}
