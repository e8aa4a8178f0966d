//! In-process domain event bus used to decouple the queue, job/workflow
//! engines, scheduler, and materializer from one another.

pub mod bus;
pub mod event;

pub use bus::EventBus;
pub use event::DomainEvent;
