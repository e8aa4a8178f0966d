//! Runtime scaling agent (spec §4.H). Grounded in
//! `durable::worker::backpressure::BackpressureState`'s load-ratio gating,
//! generalized from "this pool's own load" to "an externally supplied
//! desired concurrency for a named target", debounced the way
//! `WorkerPool::shutdown` waits out its join handles on a deadline rather
//! than polling.
//!
//! `ScalingTarget` is the seam a queue concurrency knob would implement;
//! none of the current queue backends expose dynamic resize (`RedisQueue`
//! spawns a fixed number of workers at construction), so this agent
//! computes and logs desired state today and is the integration point for
//! whichever queue backend grows that knob later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

/// Static configuration for one scalable target (a queue's consumer pool).
#[derive(Debug, Clone)]
pub struct ScalingTargetConfig {
    pub key: String,
    pub default: usize,
    pub min: usize,
    pub max: usize,
    pub rate_limit: Duration,
}

/// A snapshot pushed onto the scaling feed: "I would like `target` to run
/// at `desired` concurrency, for `reason`."
#[derive(Debug, Clone)]
pub struct RuntimeScalingSnapshot {
    pub target: String,
    pub desired: usize,
    pub reason: String,
    pub source: String,
}

pub trait ScalingTarget: Send + Sync {
    fn apply(&self, key: &str, concurrency: usize);
    fn pause(&self, key: &str);
    fn resume(&self, key: &str);
}

struct TargetState {
    config: ScalingTargetConfig,
    current: usize,
    paused: bool,
    last_applied_at: Option<Instant>,
    pending: Option<RuntimeScalingSnapshot>,
}

/// Applies debounced [`RuntimeScalingSnapshot`]s to a set of targets.
/// Rapid snapshots for the same target within its `rate_limit` window
/// collapse to the last value seen once the window elapses.
pub struct RuntimeScalingAgent {
    targets: HashMap<String, std::sync::Mutex<TargetState>>,
    target_impl: Arc<dyn ScalingTarget>,
}

impl RuntimeScalingAgent {
    pub fn new(configs: Vec<ScalingTargetConfig>, target_impl: Arc<dyn ScalingTarget>) -> Self {
        let targets = configs
            .into_iter()
            .map(|config| {
                let key = config.key.clone();
                let current = config.default;
                (
                    key,
                    std::sync::Mutex::new(TargetState {
                        config,
                        current,
                        paused: false,
                        last_applied_at: None,
                        pending: None,
                    }),
                )
            })
            .collect();
        Self { targets, target_impl }
    }

    /// Spawns a task draining `feed` and applying debounced updates. Returns
    /// a `watch::Sender<bool>` the caller can flip to stop it.
    pub fn spawn(self: Arc<Self>, mut feed: mpsc::Receiver<RuntimeScalingSnapshot>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(&self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    snapshot = feed.recv() => {
                        match snapshot {
                            Some(snapshot) => this.ingest(snapshot),
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        shutdown_tx
    }

    fn ingest(&self, snapshot: RuntimeScalingSnapshot) {
        let Some(state_lock) = self.targets.get(&snapshot.target) else {
            warn!(target = %snapshot.target, "runtime scaling snapshot for unknown target");
            return;
        };
        let mut state = state_lock.lock().unwrap();

        let ready = state
            .last_applied_at
            .map_or(true, |last| last.elapsed() >= state.config.rate_limit);

        if ready {
            self.apply(&mut state, snapshot);
        } else {
            state.pending = Some(snapshot);
        }
    }

    fn apply(&self, state: &mut TargetState, snapshot: RuntimeScalingSnapshot) {
        let clamped = snapshot.desired.clamp(state.config.min, state.config.max);

        if snapshot.desired == 0 {
            if !state.paused {
                state.paused = true;
                self.target_impl.pause(&state.config.key);
                info!(target = %snapshot.target, reason = %snapshot.reason, source = %snapshot.source, "paused scaling target");
            }
        } else {
            if state.paused {
                state.paused = false;
                self.target_impl.resume(&state.config.key);
            }
            if clamped != state.current {
                state.current = clamped;
                self.target_impl.apply(&state.config.key, clamped);
                info!(target = %snapshot.target, desired = clamped, reason = %snapshot.reason, source = %snapshot.source, "applied scaling target update");
            }
        }

        state.last_applied_at = Some(Instant::now());
        state.pending = None;
    }

    /// Flushes any snapshot still waiting out its target's debounce window.
    /// Call this periodically (e.g. from the same ticker driving schedule
    /// materialization) so a collapsed-but-pending update isn't stranded
    /// forever if no further snapshots arrive.
    pub fn flush_expired(&self) {
        for state_lock in self.targets.values() {
            let mut state = state_lock.lock().unwrap();
            let ready = state
                .last_applied_at
                .map_or(true, |last| last.elapsed() >= state.config.rate_limit);
            if ready {
                if let Some(snapshot) = state.pending.take() {
                    self.apply(&mut state, snapshot);
                }
            }
        }
    }
}

/// The only `ScalingTarget` this workspace ships today: no queue backend
/// exposes dynamic resize yet, so applying a scaling decision means logging
/// it for an operator to act on rather than calling into a live pool.
pub struct LoggingScalingTarget;

impl ScalingTarget for LoggingScalingTarget {
    fn apply(&self, key: &str, concurrency: usize) {
        info!(target = key, concurrency, "scaling target would apply concurrency");
    }

    fn pause(&self, key: &str) {
        info!(target = key, "scaling target would pause");
    }

    fn resume(&self, key: &str) {
        info!(target = key, "scaling target would resume");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingTarget {
        applied: Mutex<Vec<usize>>,
        paused: AtomicUsize,
    }

    impl ScalingTarget for RecordingTarget {
        fn apply(&self, _key: &str, concurrency: usize) {
            self.applied.lock().unwrap().push(concurrency);
        }
        fn pause(&self, _key: &str) {
            self.paused.fetch_add(1, Ordering::SeqCst);
        }
        fn resume(&self, _key: &str) {}
    }

    fn config(rate_limit: Duration) -> ScalingTargetConfig {
        ScalingTargetConfig {
            key: "ingest".to_string(),
            default: 1,
            min: 1,
            max: 10,
            rate_limit,
        }
    }

    #[test]
    fn first_snapshot_applies_immediately() {
        let target = Arc::new(RecordingTarget {
            applied: Mutex::new(vec![]),
            paused: AtomicUsize::new(0),
        });
        let agent = RuntimeScalingAgent::new(vec![config(Duration::from_secs(60))], target.clone());
        agent.ingest(RuntimeScalingSnapshot {
            target: "ingest".into(),
            desired: 5,
            reason: "backlog".into(),
            source: "test".into(),
        });
        assert_eq!(*target.applied.lock().unwrap(), vec![5]);
    }

    #[test]
    fn desired_zero_pauses() {
        let target = Arc::new(RecordingTarget {
            applied: Mutex::new(vec![]),
            paused: AtomicUsize::new(0),
        });
        let agent = RuntimeScalingAgent::new(vec![config(Duration::from_secs(60))], target.clone());
        agent.ingest(RuntimeScalingSnapshot {
            target: "ingest".into(),
            desired: 0,
            reason: "drain".into(),
            source: "test".into(),
        });
        assert_eq!(target.paused.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn desired_clamped_to_max() {
        let target = Arc::new(RecordingTarget {
            applied: Mutex::new(vec![]),
            paused: AtomicUsize::new(0),
        });
        let agent = RuntimeScalingAgent::new(vec![config(Duration::from_secs(60))], target.clone());
        agent.ingest(RuntimeScalingSnapshot {
            target: "ingest".into(),
            desired: 100,
            reason: "burst".into(),
            source: "test".into(),
        });
        assert_eq!(*target.applied.lock().unwrap(), vec![10]);
    }

    #[test]
    fn rapid_snapshots_within_window_collapse_to_last() {
        let target = Arc::new(RecordingTarget {
            applied: Mutex::new(vec![]),
            paused: AtomicUsize::new(0),
        });
        let agent = RuntimeScalingAgent::new(vec![config(Duration::from_secs(3600))], target.clone());
        agent.ingest(RuntimeScalingSnapshot {
            target: "ingest".into(),
            desired: 3,
            reason: "a".into(),
            source: "test".into(),
        });
        agent.ingest(RuntimeScalingSnapshot {
            target: "ingest".into(),
            desired: 7,
            reason: "b".into(),
            source: "test".into(),
        });
        // Second snapshot lands within the debounce window: only the first
        // applied immediately, the second stays pending.
        assert_eq!(*target.applied.lock().unwrap(), vec![3]);
    }
}
