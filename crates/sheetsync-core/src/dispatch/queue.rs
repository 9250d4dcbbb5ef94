//! Rate-limited, retrying delivery queue
//!
//! Items sharing a partition key run strictly in submission order on one
//! lane; lanes run concurrently up to the queue's concurrency. Every attempt
//! passes the admission limiter first. Exhausted and fatal items are written
//! to `failed_deliveries` before the handler's failure hook runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};

use super::backoff::RetryPolicy;
use crate::coordination::WindowedRateLimiter;
use crate::db::{Database, SqliteFailedDeliveryRepository};
use crate::error::{Error, Result};
use crate::sheet::SheetError;
use crate::util::now_millis;

/// Outcome of a failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// May succeed later; `retry_after` raises the backoff delay when set
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Never retried
    Fatal(String),
}

impl DeliveryError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable { reason, .. } | Self::Fatal(reason) => reason,
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl From<Error> for DeliveryError {
    fn from(error: Error) -> Self {
        let retry_after = match &error {
            Error::Sheet(SheetError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        };
        if error.is_retryable() {
            Self::Retryable {
                reason: error.to_string(),
                retry_after,
            }
        } else {
            Self::Fatal(error.to_string())
        }
    }
}

/// Delivers one queue item
#[async_trait]
pub trait DeliveryHandler<T>: Send + Sync + 'static {
    /// Items with equal keys are delivered in submission order.
    fn partition_key(&self, item: &T) -> String;

    /// Attempt delivery; `attempt` starts at 1.
    async fn deliver(&self, item: &T, attempt: u32) -> std::result::Result<(), DeliveryError>;

    /// Runs after the item was recorded as a failed delivery.
    async fn on_failed(&self, _item: &T, _error: &DeliveryError) {}
}

#[derive(Clone)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub limiter: Option<WindowedRateLimiter>,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Submitted and not yet picked up
    pub queued: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

struct Inner<T> {
    name: String,
    handler: Arc<dyn DeliveryHandler<T>>,
    db: Database,
    retry: RetryPolicy,
    limiter: Option<WindowedRateLimiter>,
    permits: Semaphore,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<T>>>,
    closed: AtomicBool,
    outstanding: watch::Sender<u64>,
    counters: Counters,
}

/// Owned handle to a running queue; clones share the same queue
pub struct DispatchQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> DispatchQueue<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(config: QueueConfig, db: Database, handler: Arc<dyn DeliveryHandler<T>>) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name: config.name,
                handler,
                db,
                retry: config.retry,
                limiter: config.limiter,
                permits: Semaphore::new(config.concurrency.max(1)),
                lanes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                outstanding,
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue an item without waiting for delivery.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, item: T) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::QueueClosed(self.inner.name.clone()));
        }
        let key = self.inner.handler.partition_key(&item);

        let mut lanes = self.inner.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.outstanding.send_modify(|count| *count += 1);
        let item = match lanes.get(&key) {
            Some(sender) => match sender.send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // Cannot fail: the receiver is still in scope.
        let _ = sender.send(item);
        lanes.insert(key.clone(), sender);
        drop(lanes);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_lane(key, receiver).await });
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.inner.counters;
        let outstanding = *self.inner.outstanding.borrow();
        let in_flight = counters.in_flight.load(Ordering::Relaxed);
        QueueStats {
            queued: outstanding.saturating_sub(in_flight),
            in_flight,
            delivered: counters.delivered.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait until every submitted item has been delivered or failed.
    pub async fn drain(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        // The sender lives in `inner`, which this handle keeps alive.
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }

    /// Stop accepting items and wait for the queued ones to finish.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.drain().await;
        tracing::debug!(queue = %self.inner.name, "Queue drained");
    }
}

impl<T> Inner<T>
where
    T: Serialize + Send + Sync + 'static,
{
    async fn run_lane(self: Arc<Self>, key: String, mut receiver: mpsc::UnboundedReceiver<T>) {
        loop {
            let item = match receiver.try_recv() {
                Ok(item) => item,
                Err(_) => {
                    let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
                    match receiver.try_recv() {
                        Ok(item) => item,
                        Err(_) => {
                            lanes.remove(&key);
                            return;
                        }
                    }
                }
            };
            self.process(&key, item).await;
            self.outstanding
                .send_modify(|count| *count = count.saturating_sub(1));
        }
    }

    async fn process(&self, key: &str, item: T) {
        let mut attempt = 1;
        loop {
            let result = self.attempt(&item, attempt).await;
            let error = match result {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(error) => error,
            };

            match &error {
                DeliveryError::Retryable {
                    reason,
                    retry_after,
                } if self.retry.allows_retry_after(attempt) => {
                    let delay = self
                        .retry
                        .delay_after(attempt)
                        .max(retry_after.unwrap_or_default());
                    tracing::warn!(
                        queue = %self.name,
                        key = %key,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %reason,
                        "Delivery attempt failed; retrying"
                    );
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => {
                    self.fail(key, &item, &error, attempt).await;
                    return;
                }
            }
        }
    }

    async fn attempt(&self, item: &T, attempt: u32) -> std::result::Result<(), DeliveryError> {
        let Ok(_permit) = self.permits.acquire().await else {
            return Err(DeliveryError::Fatal(format!("queue '{}' closed", self.name)));
        };
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = async {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await?;
            }
            self.handler.deliver(item, attempt).await
        }
        .await;
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn fail(&self, key: &str, item: &T, error: &DeliveryError, attempts: u32) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            queue = %self.name,
            key = %key,
            attempts,
            error = %error,
            "Delivery failed permanently"
        );

        match self.record_failure(key, item, error, attempts).await {
            Ok(id) => tracing::info!(queue = %self.name, failed_delivery = id, "Recorded failed delivery"),
            Err(record_error) => tracing::error!(
                queue = %self.name,
                key = %key,
                error = %record_error,
                "Failed to record failed delivery"
            ),
        }
        self.handler.on_failed(item, error).await;
    }

    async fn record_failure(
        &self,
        key: &str,
        item: &T,
        error: &DeliveryError,
        attempts: u32,
    ) -> Result<i64> {
        let payload = serde_json::to_string(item)?;
        let queue = self.name.clone();
        let key = key.to_string();
        let reason = error.reason().to_string();
        self.db
            .call(move |conn| {
                SqliteFailedDeliveryRepository::new(conn)
                    .insert(&queue, &key, &payload, &reason, attempts, now_millis())
                    .map(|failed| failed.id)
            })
            .await
    }
}
