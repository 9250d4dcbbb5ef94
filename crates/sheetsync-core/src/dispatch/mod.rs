//! Bounded-throughput delivery used by both sync directions

mod backoff;
mod batch;
mod queue;

pub use backoff::{exponential, RetryPolicy};
pub use batch::{Batch, BatchAccumulator, BatchConfig, FlushReason};
pub use queue::{DeliveryError, DeliveryHandler, DispatchQueue, QueueConfig, QueueStats};
