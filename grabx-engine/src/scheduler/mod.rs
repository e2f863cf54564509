//! Scheduler layer for the engine
//!
//! This layer holds the pending queue and the worker pool that drains it.
//! It manages each job's attempts from dequeue to recorded outcome,
//! including scheduling retries.

pub mod pool;
pub mod queue;

pub use pool::WorkerPool;
pub use queue::{PendingQueue, PushError};
