//! Job runtime (spec §4.C): `JobHandler` registry, execution context, and
//! the `execute_job_run` entrypoint, plus the due-run poller that re-drives
//! retries scheduled by `Store::fail_job_run`.

pub mod consumer;
pub mod context;
pub mod handler;
pub mod poller;
pub mod runtime;

pub use consumer::JobRunConsumer;
pub use context::JobRunContext;
pub use handler::{JobHandler, JobHandlerRegistry};
pub use runtime::{execute_job_run, JobRuntimeError};
