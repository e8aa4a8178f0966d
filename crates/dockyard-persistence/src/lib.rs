//! Durable storage for the catalog and workflow engine: entities, the
//! backend-agnostic [`store::Store`] trait, and its two implementations.

pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{ClaimedJobRun, PersistenceError, Store};
