//! Durable background task queue.
//!
//! At-least-once delivery with bounded retries and a dead-letter sink.
//! Used by the AI side-channel only; when no queue is configured the
//! publisher degrades to synchronous in-process handling.

pub mod queue;
pub mod registry;
pub mod task;
pub mod worker;

pub use queue::{InMemoryTaskQueue, PostgresTaskQueue, TaskQueue};
pub use registry::TaskRegistry;
pub use task::Task;
pub use worker::{TaskWorker, TaskWorkerConfig};
