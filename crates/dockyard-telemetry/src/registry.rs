//! The in-process metrics registry (spec §4.I). Holds gauges (point-in-time
//! counts per state) and histograms (latency observations), both keyed by a
//! flat string label so the snapshot shape stays independent of whatever
//! exporter eventually reads it (Prometheus exposition is out of scope per
//! spec.md Non-goals). Grounded in `everruns-observability::backend`'s
//! pluggable, `Arc`-shared, snapshot-queryable shape, generalized from "send
//! events to an external backend" to "hold counters the HTTP collaborator
//! can read back".

use dashmap::DashMap;

/// Running latency statistics for one named histogram. Not a bucketed
/// Prometheus histogram — just enough to answer "how many, how long, how
/// slow did it get", which is what `dockyard-admin`'s `/metrics-snapshot`
/// and any future exporter actually need from the core.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub max_ms: f64,
}

impl HistogramSnapshot {
    fn observe(&mut self, value_ms: f64) {
        self.count += 1;
        self.sum_ms += value_ms;
        if value_ms > self.max_ms {
            self.max_ms = value_ms;
        }
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    gauges: DashMap<String, i64>,
    histograms: DashMap<String, HistogramSnapshot>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: impl Into<String>, delta: i64) {
        *self.gauges.entry(name.into()).or_insert(0) += delta;
    }

    pub fn set_gauge(&self, name: impl Into<String>, value: i64) {
        self.gauges.insert(name.into(), value);
    }

    /// Reset a single gauge to zero. Used on queue disposal and on a mode
    /// switch to inline (spec §4.I: "reset gauges on queue disposal or mode
    /// switch to inline").
    pub fn reset_gauge(&self, name: &str) {
        self.gauges.insert(name.to_string(), 0);
    }

    pub fn observe(&self, name: impl Into<String>, value_ms: f64) {
        self.histograms.entry(name.into()).or_default().observe(value_ms);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn histogram(&self, name: &str) -> HistogramSnapshot {
        self.histograms.get(name).map(|h| h.clone()).unwrap_or_default()
    }

    /// A full point-in-time snapshot, consumed by the HTTP collaborator
    /// (spec §4.I: "exposes a snapshot getter").
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gauges: self.gauges.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            histograms: self
                .histograms
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    pub gauges: std::collections::BTreeMap<String, i64>,
    pub histograms: std::collections::BTreeMap<String, HistogramSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_accumulates() {
        let registry = MetricsRegistry::new();
        registry.incr("queue.ingest.enqueued", 1);
        registry.incr("queue.ingest.enqueued", 1);
        assert_eq!(registry.gauge("queue.ingest.enqueued"), 2);
    }

    #[test]
    fn reset_gauge_zeroes_existing_value() {
        let registry = MetricsRegistry::new();
        registry.incr("queue.workflow.enqueued", 5);
        registry.reset_gauge("queue.workflow.enqueued");
        assert_eq!(registry.gauge("queue.workflow.enqueued"), 0);
    }

    #[test]
    fn histogram_tracks_count_sum_and_max() {
        let registry = MetricsRegistry::new();
        registry.observe("job_run.duration_ms", 10.0);
        registry.observe("job_run.duration_ms", 30.0);
        let snapshot = registry.histogram("job_run.duration_ms");
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.sum_ms, 40.0);
        assert_eq!(snapshot.max_ms, 30.0);
        assert_eq!(snapshot.mean_ms(), 20.0);
    }

    #[test]
    fn snapshot_is_a_stable_point_in_time_copy() {
        let registry = MetricsRegistry::new();
        registry.incr("a", 1);
        let snap = registry.snapshot();
        registry.incr("a", 1);
        assert_eq!(*snap.gauges.get("a").unwrap(), 1);
        assert_eq!(registry.gauge("a"), 2);
    }
}
