//! Auto-materializer: the in-memory asset/workflow dependency graph, the
//! event-bus-driven consumer that decides, on asset production or expiry,
//! whether to enqueue a downstream `WorkflowRun`, and the TTL/cadence
//! scanner that produces the expiry half of that decision.

pub mod consumer;
pub mod expiry;
pub mod graph;

pub use consumer::AutoMaterializer;
pub use expiry::{run_asset_expiry_scanner, AssetExpiryConsumer, AssetExpiryScannerConfig};
pub use graph::MaterializerGraph;
