//! Windowed admission limiter over the coordination store

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::CoordinationStore;
use crate::error::Result;

const MIN_WAIT: Duration = Duration::from_millis(50);

/// Admits at most `limit` operations per window across every instance
#[derive(Clone)]
pub struct WindowedRateLimiter {
    store: Arc<dyn CoordinationStore>,
    key: String,
    limit: u64,
    window: Duration,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Default)]
struct RateLimitMetrics {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub allowed: u64,
    pub limited: u64,
}

/// Result of a single admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Limited { retry_after: Duration },
}

impl WindowedRateLimiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            key: format!("rate:{}", key.into()),
            limit,
            window,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self) -> Result<Admission> {
        let counted = self.store.incr_window(&self.key, self.window).await?;
        if counted.count > self.limit {
            self.metrics.limited.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                limiter = %self.key,
                retry_after_ms = u64::try_from(counted.resets_in.as_millis()).unwrap_or(u64::MAX),
                "Rate limit reached"
            );
            return Ok(Admission::Limited {
                retry_after: counted.resets_in,
            });
        }
        self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(Admission::Allowed)
    }

    /// Wait until the window admits one more operation.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            match self.check().await? {
                Admission::Allowed => return Ok(()),
                Admission::Limited { retry_after } => {
                    tokio::time::sleep(retry_after.max(MIN_WAIT)).await;
                }
            }
        }
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            limited: self.metrics.limited.load(Ordering::Relaxed),
        }
    }
}
