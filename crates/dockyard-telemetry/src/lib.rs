//! Telemetry pipeline (spec §4.I): a pure map from queue/run/schedule
//! domain events to an in-process metrics registry, exposed to the
//! `dockyard-admin` HTTP collaborator via a snapshot getter.

pub mod collector;
pub mod registry;

pub use collector::TelemetryCollector;
pub use registry::{HistogramSnapshot, MetricsRegistry, MetricsSnapshot};
