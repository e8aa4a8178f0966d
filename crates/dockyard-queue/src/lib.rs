//! One enqueue API, two backends (spec §4.B).

pub mod api;
pub mod inline;
pub mod queue;
pub mod redis_queue;

pub use inline::InlineQueue;
pub use queue::{Consumer, Queue, QueueError, QueueMode, QueueName};
pub use redis_queue::{RedisQueue, RedisQueueConfig};
