//! Shared application state threaded through every route handler.
//! Grounded in `everruns-api`/`control-plane`'s `AppState { db: Arc<Database> }`
//! pattern, generalized to the handful of shared services this workspace's
//! routes actually touch.

use std::sync::Arc;

use dockyard_events::EventBus;
use dockyard_persistence::Store;
use dockyard_queue::queue::Queue;
use dockyard_scheduler::EventIngestor;
use dockyard_telemetry::MetricsRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn Queue>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
    pub ingestor: Arc<EventIngestor>,
}
