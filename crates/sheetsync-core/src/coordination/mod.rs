//! Coordination store: expiring keys and windowed counters shared by every
//! engine instance
//!
//! Row locks and admission limiters live here rather than in process memory
//! so that several workers pointed at the same database cooperate.

mod lock;
mod memory;
mod rate_limit;
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;

pub use lock::{LockAttempt, RowLease, RowLocks};
pub use memory::MemoryCoordinationStore;
pub use rate_limit::{Admission, RateLimitMetricsSnapshot, WindowedRateLimiter};
pub use sqlite::SqliteCoordinationStore;

use crate::error::Result;

/// Counter value after an increment, with the time left in its window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub resets_in: Duration,
}

/// Capabilities the engine needs from a shared key/value store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set `key` to `value` for `ttl` unless a live value exists.
    ///
    /// Returns `true` when this call set the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Live value of `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    /// Expire `key` `ttl` from now, only while it still holds a live `value`.
    async fn extend_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Increment the counter for `key` in a fixed window starting at the
    /// first increment.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount>;
}
