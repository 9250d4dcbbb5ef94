//! Engine wiring: queues, capture loop and operator actions
//!
//! [`SyncEngine::start`] builds both dispatch queues over one coordination
//! store and, when a sheet writer is given, spawns the change-capture loop.
//! [`SyncEngine::shutdown`] stops the loop, flushes its pending batches and
//! drains both queues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{CoordinationBackend, EngineConfig};
use crate::coordination::{
    CoordinationStore, MemoryCoordinationStore, RowLocks, SqliteCoordinationStore,
    WindowedRateLimiter,
};
use crate::db::{
    Database, SqliteChangeLogRepository, SqliteConflictRepository, SqliteFailedDeliveryRepository,
    SqliteRowRepository,
};
use crate::dispatch::{exponential, DeliveryHandler, DispatchQueue, QueueConfig};
use crate::error::{Error, Result};
use crate::guard::GuardChain;
use crate::health::{DispatchHealth, HealthMonitor, HealthReport};
use crate::models::{
    CellNotification, ChangeLogEntry, FailedDelivery, RejectReason, Resolution, SubmitOutcome,
    SyncConflict, SyncedDocument,
};
use crate::pipeline::{
    ChangeCapture, EventBus, IngestHandler, SheetBatch, SheetDeliveryHandler, SyncEvent,
    INGEST_QUEUE, SHEET_QUEUE,
};
use crate::schema::{coerce, SchemaRegistry};
use crate::sheet::SheetWriter;
use crate::util::now_millis;

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

/// Database-derived state shown by operator tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub documents: usize,
    pub enabled_documents: usize,
    pub pending_changes: u64,
    pub pending_conflicts: u64,
    pub failed_deliveries: u64,
}

/// Read [`StoreStatus`] without starting an engine.
pub async fn store_status(db: &Database) -> Result<StoreStatus> {
    db.call(|conn| {
        let documents = SchemaRegistry::new(conn).list_documents()?;
        Ok(StoreStatus {
            documents: documents.len(),
            enabled_documents: documents.iter().filter(|document| document.enabled).count(),
            pending_changes: SqliteChangeLogRepository::new(conn).pending_count()?,
            pending_conflicts: SqliteConflictRepository::new(conn).pending_count()?,
            failed_deliveries: SqliteFailedDeliveryRepository::new(conn).open_count()?,
        })
    })
    .await
}

struct CaptureRuntime {
    queue: DispatchQueue<SheetBatch>,
    task: JoinHandle<()>,
}

/// A running sync engine
pub struct SyncEngine {
    db: Database,
    config: EngineConfig,
    events: EventBus,
    health: HealthMonitor,
    ingest: DispatchQueue<CellNotification>,
    sheet_limiter: WindowedRateLimiter,
    store_limiter: WindowedRateLimiter,
    shutdown: watch::Sender<bool>,
    capture: Mutex<Option<CaptureRuntime>>,
}

impl SyncEngine {
    /// Start the engine on `db`.
    ///
    /// Without a sheet writer only the ingest direction runs; store edits
    /// stay in the change log until an engine with a writer picks them up.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        db: Database,
        sheet: Option<Arc<dyn SheetWriter>>,
    ) -> Self {
        let store: Arc<dyn CoordinationStore> = match config.coordination {
            CoordinationBackend::Sqlite => Arc::new(SqliteCoordinationStore::new(db.clone())),
            CoordinationBackend::Memory => Arc::new(MemoryCoordinationStore::new()),
        };
        let guard = GuardChain::new(RowLocks::new(Arc::clone(&store), config.lock_ttl), config.cooldown);
        let sheet_limiter = WindowedRateLimiter::new(
            Arc::clone(&store),
            SHEET_QUEUE,
            config.sheet_writes_per_window,
            config.rate_limit_window,
        );
        let store_limiter = WindowedRateLimiter::new(
            Arc::clone(&store),
            INGEST_QUEUE,
            config.store_writes_per_window,
            config.rate_limit_window,
        );

        let events = EventBus::default();
        let health = HealthMonitor::new();

        let ingest_handler = IngestHandler::new(
            db.clone(),
            guard.clone(),
            events.clone(),
            health.clone(),
            config.header_row,
        );
        let ingest = DispatchQueue::new(
            QueueConfig {
                name: INGEST_QUEUE.to_string(),
                concurrency: config.ingest_concurrency,
                retry: config.retry,
                limiter: Some(store_limiter.clone()),
            },
            db.clone(),
            Arc::new(ingest_handler) as Arc<dyn DeliveryHandler<CellNotification>>,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let capture = sheet.map(|writer| {
            let handler = Arc::new(SheetDeliveryHandler::new(
                db.clone(),
                guard.clone(),
                writer,
                events.clone(),
                health.clone(),
            ));
            let in_flight = handler.in_flight();
            let queue = DispatchQueue::new(
                QueueConfig {
                    name: SHEET_QUEUE.to_string(),
                    concurrency: config.sheet_concurrency,
                    retry: config.retry,
                    limiter: Some(sheet_limiter.clone()),
                },
                db.clone(),
                handler as Arc<dyn DeliveryHandler<SheetBatch>>,
            );
            let capture = ChangeCapture::new(
                db.clone(),
                guard.clone(),
                events.clone(),
                queue.clone(),
                in_flight,
                config.batch,
                config.poll_batch_limit,
            );
            let task = tokio::spawn(run_capture(
                capture,
                health.clone(),
                config.poll_interval,
                shutdown_rx,
            ));
            CaptureRuntime { queue, task }
        });

        tracing::info!(
            coordination = config.coordination.as_str(),
            capture = capture.is_some(),
            "Sync engine started"
        );

        Self {
            db,
            config,
            events,
            health,
            ingest,
            sheet_limiter,
            store_limiter,
            shutdown,
            capture: Mutex::new(capture),
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Validate a notification and queue it; never waits for the write.
    pub fn submit_change(&self, notification: CellNotification) -> SubmitOutcome {
        if let Err(reason) = notification.validate() {
            tracing::debug!(reason = %reason, "Notification rejected");
            return SubmitOutcome::Rejected(reason);
        }
        match self.ingest.submit(notification) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(error) => {
                tracing::warn!(error = %error, "Notification refused");
                SubmitOutcome::Rejected(RejectReason::Unavailable)
            }
        }
    }

    /// Parse a raw JSON notification and queue it.
    pub fn submit_json(&self, raw: &str) -> SubmitOutcome {
        match CellNotification::parse(raw) {
            Ok(notification) => self.submit_change(notification),
            Err(reason) => {
                tracing::debug!(reason = %reason, "Notification rejected");
                SubmitOutcome::Rejected(reason)
            }
        }
    }

    /// Record a store-side edit of one row.
    ///
    /// Keys are physical column names or header texts (case-insensitive);
    /// values are coerced to the column type. Returns `None` when nothing
    /// differs from the stored row.
    pub async fn record_store_edit(
        &self,
        document_id: &str,
        sheet_name: &str,
        row_number: u32,
        values: &BTreeMap<String, serde_json::Value>,
        changed_at: i64,
    ) -> Result<Option<ChangeLogEntry>> {
        if row_number <= self.config.header_row {
            return Err(Error::InvalidInput(format!(
                "row {row_number} is not below the header row {}",
                self.config.header_row
            )));
        }
        if values.is_empty() {
            return Err(Error::InvalidInput("no values to write".to_string()));
        }

        let entry = self
            .db
            .call(|conn| {
                let registry = SchemaRegistry::new(conn);
                let document = registry.document(document_id, sheet_name)?.ok_or_else(|| {
                    Error::NotFound(format!("document {document_id} / {sheet_name}"))
                })?;
                let mappings = registry.active_mappings(document_id, sheet_name)?;

                let mut edits = BTreeMap::new();
                for (key, value) in values {
                    let mapping = mappings
                        .iter()
                        .find(|mapping| &mapping.column_name == key)
                        .or_else(|| {
                            mappings
                                .iter()
                                .find(|mapping| mapping.header.eq_ignore_ascii_case(key.trim()))
                        })
                        .ok_or_else(|| {
                            Error::InvalidInput(format!(
                                "{key} is not an active column of {}",
                                document.table_name
                            ))
                        })?;
                    registry.ensure_column_exists_on_table(
                        &document.table_name,
                        &mapping.column_name,
                        mapping.data_type,
                    )?;
                    edits.insert(mapping.column_name.clone(), coerce(value, mapping.data_type));
                }

                SqliteRowRepository::new(conn, &document.table_name).write_store_edit(
                    row_number,
                    &edits,
                    &mappings,
                    changed_at,
                )
            })
            .await?;

        match &entry {
            Some(entry) => tracing::debug!(
                document = %document_id,
                row = row_number,
                entry = entry.id,
                "Store edit recorded"
            ),
            None => tracing::debug!(document = %document_id, row = row_number, "Store edit changed nothing"),
        }
        Ok(entry)
    }

    pub async fn list_documents(&self) -> Result<Vec<SyncedDocument>> {
        self.db
            .call(|conn| SchemaRegistry::new(conn).list_documents())
            .await
    }

    pub async fn set_document_enabled(
        &self,
        document_id: &str,
        sheet_name: &str,
        enabled: bool,
    ) -> Result<()> {
        self.db
            .call(|conn| {
                SchemaRegistry::new(conn).set_document_enabled(document_id, sheet_name, enabled)
            })
            .await
    }

    pub async fn list_conflicts(&self, pending_only: bool, limit: usize) -> Result<Vec<SyncConflict>> {
        self.db
            .call(|conn| SqliteConflictRepository::new(conn).list(pending_only, limit))
            .await
    }

    /// Settle a pending conflict; the rows are left as they are.
    pub async fn resolve_conflict(
        &self,
        id: i64,
        resolution: Resolution,
        resolved_by: Option<&str>,
    ) -> Result<SyncConflict> {
        let now = now_millis();
        let conflict = self
            .db
            .call(|conn| SqliteConflictRepository::new(conn).resolve(id, resolution, resolved_by, now))
            .await?;
        tracing::info!(
            conflict = id,
            resolution = %resolution,
            resolved_by = resolved_by.unwrap_or("-"),
            "Conflict resolved"
        );
        Ok(conflict)
    }

    pub async fn list_failed(&self, include_requeued: bool, limit: usize) -> Result<Vec<FailedDelivery>> {
        self.db
            .call(|conn| SqliteFailedDeliveryRepository::new(conn).list(include_requeued, limit))
            .await
    }

    /// Give a failed delivery another run.
    ///
    /// Ingest payloads are submitted again; sheet batches return their change
    /// log entries to the poll.
    pub async fn requeue_failed(&self, id: i64) -> Result<FailedDelivery> {
        let failed = self
            .db
            .call(|conn| SqliteFailedDeliveryRepository::new(conn).get(id))
            .await?;
        if failed.requeued_at.is_some() {
            return Err(Error::InvalidInput(format!(
                "failed delivery {id} was already requeued"
            )));
        }

        match failed.queue.as_str() {
            INGEST_QUEUE => {
                let notification: CellNotification = serde_json::from_str(&failed.payload)?;
                self.ingest.submit(notification)?;
            }
            SHEET_QUEUE => {
                let batch: SheetBatch = serde_json::from_str(&failed.payload)?;
                let ids = batch.entry_ids();
                self.db
                    .call(|conn| SqliteChangeLogRepository::new(conn).clear_failed(&ids))
                    .await?;
            }
            other => {
                return Err(Error::InvalidInput(format!("unknown queue '{other}'")));
            }
        }

        let now = now_millis();
        let requeued = self
            .db
            .call(|conn| SqliteFailedDeliveryRepository::new(conn).mark_requeued(id, now))
            .await?;
        tracing::info!(failed_delivery = id, queue = %requeued.queue, "Failed delivery requeued");
        Ok(requeued)
    }

    pub async fn store_status(&self) -> Result<StoreStatus> {
        store_status(&self.db).await
    }

    pub async fn health(&self) -> HealthReport {
        let sheet_queue = self
            .capture
            .lock()
            .await
            .as_ref()
            .map(|capture| capture.queue.stats())
            .unwrap_or_default();
        let dispatch = DispatchHealth {
            ingest_queue: self.ingest.stats(),
            sheet_queue,
            sheet_rate_limit: self.sheet_limiter.metrics_snapshot(),
            store_rate_limit: self.store_limiter.metrics_snapshot(),
        };
        self.health.report(dispatch, now_millis())
    }

    /// Wait until every notification submitted so far has been applied or failed.
    pub async fn drain_ingest(&self) {
        self.ingest.drain().await;
    }

    /// Stop the capture loop, flush its pending batches and drain both queues.
    pub async fn shutdown(&self) {
        // Receivers only go away once the loop has already exited.
        let _ = self.shutdown.send(true);

        let capture = self.capture.lock().await.take();
        if let Some(CaptureRuntime { queue, task }) = capture {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "Capture loop ended abnormally");
            }
            queue.shutdown().await;
        }
        self.ingest.shutdown().await;
        tracing::info!("Sync engine stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_capture(
    mut capture: ChangeCapture,
    health: HealthMonitor,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_poll = Instant::now();
    loop {
        let flush_at = capture.next_deadline();
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep_until(next_poll) => {
                match capture.poll_once().await {
                    Ok(accumulated) => {
                        health.record_poll_success(now_millis());
                        if accumulated > 0 {
                            tracing::debug!(accumulated, "Captured store edits");
                        }
                        next_poll = Instant::now() + poll_interval;
                    }
                    Err(error) => {
                        let failures = health.record_poll_failure(&error.to_string(), now_millis());
                        let delay = exponential(poll_interval, failures, MAX_POLL_BACKOFF);
                        tracing::warn!(
                            failures,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %error,
                            "Change log poll failed"
                        );
                        next_poll = Instant::now() + delay;
                    }
                }
            }
            () = sleep_until(flush_at) => {
                if let Err(error) = capture.flush_due().await {
                    tracing::warn!(error = %error, "Failed to flush sheet batches");
                }
            }
        }
    }

    if let Err(error) = capture.flush_all().await {
        tracing::warn!(error = %error, "Failed to flush sheet batches on shutdown");
    }
    tracing::debug!("Capture loop stopped");
}
