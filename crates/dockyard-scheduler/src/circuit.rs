//! Per-source admission control (spec §4.E): "a source is a circuit; paused
//! maps to `Open`." Reuses `dockyard_types::reliability::{CircuitBreakerConfig,
//! CircuitState}` for the shape, but keeps state in-process via `dashmap`
//! rather than the teacher's Postgres-backed `DistributedCircuitBreaker`
//! (`durable::reliability::distributed_circuit_breaker`) — that type is
//! itself marked an unintegrated future feature in the teacher, and a single
//! scheduler instance owning its own per-source state is sufficient here,
//! matching the auto-materializer's equally in-memory `failureState` map.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dockyard_types::{CircuitBreakerConfig, CircuitState};

struct SourceState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

impl SourceState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
        }
    }
}

/// Outcome of an admission check for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Paused,
}

/// Tracks one circuit per event source. `register_failure`/`register_success`
/// are called after each trigger-evaluation pass for that source; `check`
/// gates whether the source's envelopes are evaluated against triggers at
/// all (denied envelopes are still persisted for audit, per spec §4.E).
pub struct SourceAdmission {
    config: CircuitBreakerConfig,
    sources: DashMap<String, SourceState>,
}

impl SourceAdmission {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            sources: DashMap::new(),
        }
    }

    pub fn check(&self, source: &str) -> Admission {
        let mut entry = self.sources.entry(source.to_string()).or_insert_with(SourceState::new);
        match entry.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    entry.state = CircuitState::HalfOpen;
                    entry.success_count = 0;
                    Admission::Allowed
                } else {
                    Admission::Paused
                }
            }
            CircuitState::HalfOpen => Admission::Allowed,
        }
    }

    pub fn record_success(&self, source: &str) {
        let mut entry = self.sources.entry(source.to_string()).or_insert_with(SourceState::new);
        match entry.state {
            CircuitState::Closed => {
                entry.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                entry.success_count += 1;
                if entry.success_count >= self.config.success_threshold {
                    entry.state = CircuitState::Closed;
                    entry.failure_count = 0;
                    entry.success_count = 0;
                    entry.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, source: &str) {
        let mut entry = self.sources.entry(source.to_string()).or_insert_with(SourceState::new);
        match entry.state {
            CircuitState::Closed => {
                entry.failure_count += 1;
                if entry.failure_count >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                entry.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state_of(&self, source: &str) -> CircuitState {
        self.sources
            .get(source)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_failure_threshold() {
        let admission = SourceAdmission::new(CircuitBreakerConfig::default().with_failure_threshold(2));
        admission.record_failure("github");
        assert_eq!(admission.check("github"), Admission::Allowed);
        admission.record_failure("github");
        assert_eq!(admission.check("github"), Admission::Paused);
    }

    #[test]
    fn success_in_closed_state_resets_failure_count() {
        let admission = SourceAdmission::new(CircuitBreakerConfig::default().with_failure_threshold(2));
        admission.record_failure("github");
        admission.record_success("github");
        admission.record_failure("github");
        assert_eq!(admission.check("github"), Admission::Allowed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let admission = SourceAdmission::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(0)),
        );
        admission.record_failure("github");
        assert_eq!(admission.check("github"), Admission::Allowed);
        admission.record_failure("github");
        assert_eq!(admission.state_of("github"), CircuitState::Open);
    }
}
