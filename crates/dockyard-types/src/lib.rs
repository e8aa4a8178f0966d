//! Shared types for the Dockyard workspace: error taxonomy, retry/circuit
//! breaker configuration, the event-pagination cursor, and asset-id
//! normalization. Every other crate in the workspace depends on this one and
//! nothing else depends on them, keeping the dependency graph a DAG.

pub mod asset_id;
pub mod cursor;
pub mod error;
pub mod reliability;

pub use asset_id::{normalize_partition_key, AssetId};
pub use cursor::EventCursor;
pub use error::{DockyardError, ErrorKind};
pub use reliability::{BackoffStrategy, CircuitBreakerConfig, CircuitState, Jitter, RetryPolicy};
