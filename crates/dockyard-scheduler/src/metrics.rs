//! Small ring buffer of schedule-leader/materialization outcomes (spec
//! §4.G: "Metrics: leader state + schedule outcomes ... recorded into a
//! small ring buffer"). Exposed to `dockyard-telemetry` and `dockyard-admin`
//! via [`ScheduleRing::snapshot`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

const RING_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub workflow_definition_id: Uuid,
    pub kind: ScheduleOutcomeKind,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ScheduleOutcomeKind {
    LockAcquired,
    LockContention,
    Processed { runs_created: usize },
    Skipped,
    Error(String),
}

impl ScheduleOutcome {
    pub fn lock_acquired(workflow_definition_id: Uuid) -> Self {
        Self::new(workflow_definition_id, ScheduleOutcomeKind::LockAcquired)
    }

    pub fn lock_contention(workflow_definition_id: Uuid) -> Self {
        Self::new(workflow_definition_id, ScheduleOutcomeKind::LockContention)
    }

    pub fn processed(workflow_definition_id: Uuid, runs_created: usize) -> Self {
        Self::new(workflow_definition_id, ScheduleOutcomeKind::Processed { runs_created })
    }

    pub fn skipped(workflow_definition_id: Uuid) -> Self {
        Self::new(workflow_definition_id, ScheduleOutcomeKind::Skipped)
    }

    pub fn error(workflow_definition_id: Uuid, message: String) -> Self {
        Self::new(workflow_definition_id, ScheduleOutcomeKind::Error(message))
    }

    fn new(workflow_definition_id: Uuid, kind: ScheduleOutcomeKind) -> Self {
        Self {
            workflow_definition_id,
            kind,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct ScheduleRing {
    entries: Mutex<VecDeque<ScheduleOutcome>>,
}

impl ScheduleRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ScheduleOutcome) {
        let mut entries = self.entries.lock();
        if entries.len() >= RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(outcome);
    }

    pub fn snapshot(&self) -> Vec<ScheduleOutcome> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let ring = ScheduleRing::new();
        for _ in 0..(RING_CAPACITY + 10) {
            ring.push(ScheduleOutcome::lock_acquired(Uuid::now_v7()));
        }
        assert_eq!(ring.snapshot().len(), RING_CAPACITY);
    }
}
