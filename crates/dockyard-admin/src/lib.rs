//! Thin wiring + minimal HTTP surface for exercising the engine end to end
//! (SPEC_FULL.md §6): not a product API, just enough to drive
//! `dockyard-queue`/`dockyard-workflow` from integration tests.

pub mod state;
pub mod routes;

pub use routes::router;
pub use state::AppState;
