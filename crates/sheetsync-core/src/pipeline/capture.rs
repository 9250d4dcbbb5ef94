//! Store → sheet pipeline
//!
//! Unprocessed change log entries are polled in capture order and evaluated
//! against the row's last synchronized values overlaid with the entry's new
//! values. Survivors are grouped per document and flushed as one batched
//! sheet write. An entry is marked processed only once the sheet confirmed
//! its cells and the row metadata was stamped.
//!
//! Entries of one row are handled strictly in order: while an entry of a row
//! is accumulated, in flight or deferred, later entries of that row wait.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{EventBus, SyncEvent};
use crate::coordination::RowLease;
use crate::db::{
    Database, NewConflict, RowWrite, SqliteChangeLogRepository, SqliteConflictRepository,
    SqliteDocumentRepository, SqliteRowRepository, WriteOutcome,
};
use crate::dispatch::{
    Batch, BatchAccumulator, BatchConfig, DeliveryError, DeliveryHandler, DispatchQueue,
};
use crate::error::{Error, Result};
use crate::guard::{Decision, GuardChain, IncomingChange, SkipReason};
use crate::health::{HealthMonitor, Pipeline};
use crate::models::{
    CellValue, ChangeLogEntry, ChangeOperation, ColumnMapping, Direction, Origin, SyncStatus,
    SyncedDocument, SyncedRow,
};
use crate::schema::SchemaRegistry;
use crate::sheet::{CellUpdate, SheetWriter};
use crate::util::now_millis;

pub const SHEET_QUEUE: &str = "sheet";

/// One change log entry cleared for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub entry_id: i64,
    pub table_name: String,
    /// `_id` of the row
    pub row_id: i64,
    pub row_number: u32,
    pub changed_at: i64,
    /// Row metadata as read during evaluation
    pub expected_modified_at: i64,
    pub expected_hash: Option<String>,
    /// Synchronized values once delivered
    pub synced_values: BTreeMap<String, CellValue>,
    pub content_hash: String,
    pub cells: Vec<CellUpdate>,
    #[serde(skip)]
    pub lease: Option<RowLease>,
}

/// All deliveries flushed together for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetBatch {
    pub document_id: String,
    pub deliveries: Vec<PendingDelivery>,
}

impl SheetBatch {
    pub fn entry_ids(&self) -> Vec<i64> {
        self.deliveries.iter().map(|delivery| delivery.entry_id).collect()
    }
}

#[derive(Debug, Default)]
struct InFlightState {
    entries: HashSet<i64>,
    rows: HashSet<(String, i64)>,
}

/// Entries accumulated or in flight, shared by the poller and the handler
#[derive(Debug, Clone, Default)]
pub struct InFlightEntries {
    state: Arc<Mutex<InFlightState>>,
}

impl InFlightEntries {
    fn with_state<T>(&self, f: impl FnOnce(&mut InFlightState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn is_busy(&self, entry: &ChangeLogEntry) -> bool {
        self.with_state(|state| {
            state.entries.contains(&entry.id)
                || state.rows.contains(&(entry.table_name.clone(), entry.row_id))
        })
    }

    fn claim(&self, delivery: &PendingDelivery) {
        self.with_state(|state| {
            state.entries.insert(delivery.entry_id);
            state.rows.insert((delivery.table_name.clone(), delivery.row_id));
        });
    }

    fn release<'a>(&self, deliveries: impl IntoIterator<Item = &'a PendingDelivery>) {
        self.with_state(|state| {
            for delivery in deliveries {
                state.entries.remove(&delivery.entry_id);
                state.rows.remove(&(delivery.table_name.clone(), delivery.row_id));
            }
        });
    }

    pub fn len(&self) -> usize {
        self.with_state(|state| state.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Evaluated {
    Deliver {
        document_id: String,
        delivery: Box<PendingDelivery>,
    },
    /// Left unprocessed for a later poll
    Deferred,
    /// Processed without delivery
    Closed,
}

struct Loaded {
    document: SyncedDocument,
    mappings: Vec<ColumnMapping>,
    row: SyncedRow,
}

/// Poller and accumulator of the change-capture direction
pub struct ChangeCapture {
    db: Database,
    guard: GuardChain,
    events: EventBus,
    queue: DispatchQueue<SheetBatch>,
    batches: BatchAccumulator<PendingDelivery>,
    in_flight: InFlightEntries,
    poll_limit: usize,
}

impl ChangeCapture {
    pub fn new(
        db: Database,
        guard: GuardChain,
        events: EventBus,
        queue: DispatchQueue<SheetBatch>,
        in_flight: InFlightEntries,
        batch: BatchConfig,
        poll_limit: usize,
    ) -> Self {
        Self {
            db,
            guard,
            events,
            queue,
            batches: BatchAccumulator::new(batch),
            in_flight,
            poll_limit: poll_limit.max(1),
        }
    }

    /// Evaluate one page of pending entries; returns how many were accumulated.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let limit = self.poll_limit;
        let entries = self
            .db
            .call(|conn| SqliteChangeLogRepository::new(conn).pending(limit))
            .await?;
        let now = now_millis();

        let mut waiting_rows: HashSet<(String, i64)> = HashSet::new();
        let mut accumulated = 0;
        for entry in entries {
            let row_key = (entry.table_name.clone(), entry.row_id);
            if waiting_rows.contains(&row_key) || self.in_flight.is_busy(&entry) {
                waiting_rows.insert(row_key);
                continue;
            }

            match self.evaluate(&entry, now).await? {
                Evaluated::Deliver {
                    document_id,
                    delivery,
                } => {
                    self.in_flight.claim(&delivery);
                    accumulated += 1;
                    if let Some(batch) = self.batches.push(&document_id, *delivery, Instant::now()) {
                        self.dispatch(batch).await?;
                    }
                }
                Evaluated::Deferred => {
                    waiting_rows.insert(row_key);
                }
                Evaluated::Closed => {}
            }
        }
        Ok(accumulated)
    }

    /// Flush every group whose time budget has run out.
    pub async fn flush_due(&mut self) -> Result<()> {
        for batch in self.batches.take_due(Instant::now()) {
            self.dispatch(batch).await?;
        }
        Ok(())
    }

    /// Flush every group regardless of its deadline.
    pub async fn flush_all(&mut self) -> Result<()> {
        for batch in self.batches.drain() {
            self.dispatch(batch).await?;
        }
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.batches.next_deadline()
    }

    pub fn accumulated(&self) -> usize {
        self.batches.len()
    }

    async fn dispatch(&self, batch: Batch<PendingDelivery>) -> Result<()> {
        tracing::debug!(
            document = %batch.key,
            size = batch.items.len(),
            reason = batch.reason.as_str(),
            "Flushing sheet batch"
        );
        let batch = SheetBatch {
            document_id: batch.key,
            deliveries: batch.items,
        };
        if let Err(error) = self.queue.submit(batch.clone()) {
            self.in_flight.release(&batch.deliveries);
            for delivery in batch.deliveries {
                self.guard.release(delivery.lease).await;
            }
            return Err(error);
        }
        Ok(())
    }

    async fn evaluate(&self, entry: &ChangeLogEntry, now: i64) -> Result<Evaluated> {
        let Some(Loaded {
            document,
            mappings,
            row,
        }) = self.db.call(|conn| load(conn, entry)).await?
        else {
            return Ok(Evaluated::Closed);
        };

        let deliverable: Vec<(&ColumnMapping, CellValue)> = entry
            .changed_columns
            .iter()
            .filter_map(|column| {
                mappings
                    .iter()
                    .find(|mapping| &mapping.column_name == column)
                    .map(|mapping| {
                        let value = entry.new_values.values.get(column).cloned().unwrap_or_default();
                        (mapping, value)
                    })
            })
            .collect();
        if deliverable.is_empty() {
            self.close(entry, "no active column changed").await?;
            return Ok(Evaluated::Closed);
        }

        let mut candidate = row.synced_values.clone();
        for (mapping, value) in &deliverable {
            candidate.insert(mapping.column_name.clone(), value.clone());
        }
        let change = IncomingChange {
            document_id: &document.document_id,
            direction: Direction::ToSheet,
            timestamp: entry.changed_at,
            values: &candidate,
        };

        match self.guard.evaluate(&change, &row.meta, now).await? {
            // Re-evaluated once the cooldown has passed; the hash guard then
            // drops true echoes.
            Decision::Skip(SkipReason::Echo) | Decision::Requeue { .. } => Ok(Evaluated::Deferred),
            Decision::Skip(reason) => {
                self.close(entry, reason.as_str()).await?;
                self.events.emit(SyncEvent::Skipped {
                    direction: Direction::ToSheet,
                    document_id: document.document_id.clone(),
                    row: row.meta.row_number,
                    reason,
                });
                Ok(Evaluated::Closed)
            }
            Decision::Conflict { lease } => {
                let result = self.record_conflicts(entry, &document, &row, &deliverable).await;
                self.guard.release(lease).await;
                result?;
                Ok(Evaluated::Closed)
            }
            Decision::Apply {
                lease,
                content_hash,
            } => {
                let cells = deliverable
                    .iter()
                    .map(|(mapping, value)| CellUpdate {
                        sheet_name: document.sheet_name.clone(),
                        row: row.meta.row_number,
                        col: mapping.column_index,
                        value: value.display(),
                    })
                    .collect();
                Ok(Evaluated::Deliver {
                    document_id: document.document_id.clone(),
                    delivery: Box::new(PendingDelivery {
                        entry_id: entry.id,
                        table_name: entry.table_name.clone(),
                        row_id: entry.row_id,
                        row_number: row.meta.row_number,
                        changed_at: entry.changed_at,
                        expected_modified_at: row.meta.last_modified_at,
                        expected_hash: row.meta.content_hash.clone(),
                        synced_values: candidate,
                        content_hash,
                        cells,
                        lease,
                    }),
                })
            }
        }
    }

    async fn record_conflicts(
        &self,
        entry: &ChangeLogEntry,
        document: &SyncedDocument,
        row: &SyncedRow,
        deliverable: &[(&ColumnMapping, CellValue)],
    ) -> Result<()> {
        let now = now_millis();
        let conflicts: Vec<NewConflict> = deliverable
            .iter()
            .map(|(mapping, value)| NewConflict {
                document_id: document.document_id.clone(),
                row_number: row.meta.row_number,
                column_name: mapping.column_name.clone(),
                external_value: row.synced_value(&mapping.column_name),
                external_updated_at: row.meta.last_modified_at,
                store_value: value.clone(),
                store_updated_at: entry.changed_at,
            })
            .collect();

        self.db
            .call(|conn| {
                let tx = conn.unchecked_transaction()?;
                let repo = SqliteConflictRepository::new(conn);
                for conflict in &conflicts {
                    repo.insert(conflict, now)?;
                }
                SqliteRowRepository::new(conn, &entry.table_name)
                    .set_status(entry.row_id, SyncStatus::Conflict)?;
                SqliteChangeLogRepository::new(conn).mark_processed(&[entry.id])?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        let columns: Vec<String> = conflicts.into_iter().map(|c| c.column_name).collect();
        tracing::warn!(
            document = %document.document_id,
            row = row.meta.row_number,
            entry = entry.id,
            columns = ?columns,
            "Conflicting store edit recorded"
        );
        self.events.emit(SyncEvent::Conflict {
            direction: Direction::ToSheet,
            document_id: document.document_id.clone(),
            row: row.meta.row_number,
            columns,
        });
        Ok(())
    }

    async fn close(&self, entry: &ChangeLogEntry, reason: &str) -> Result<()> {
        self.db
            .call(|conn| close_entry(conn, entry, reason))
            .await
    }
}

fn close_entry(conn: &Connection, entry: &ChangeLogEntry, reason: &str) -> Result<()> {
    SqliteChangeLogRepository::new(conn).mark_processed(&[entry.id])?;
    tracing::debug!(
        entry = entry.id,
        table = %entry.table_name,
        reason,
        "Change log entry closed without delivery"
    );
    Ok(())
}

/// Document, active mappings and row of an entry; closes entries that can
/// never be delivered.
fn load(conn: &Connection, entry: &ChangeLogEntry) -> Result<Option<Loaded>> {
    let registry = SchemaRegistry::new(conn);
    let Some(document) = registry.document_by_table(&entry.table_name)? else {
        close_entry(conn, entry, "table not registered")?;
        return Ok(None);
    };
    if !document.enabled {
        tracing::info!(document = %document.document_id, "Document disabled, skipping store edit");
        close_entry(conn, entry, "document disabled")?;
        return Ok(None);
    }
    if entry.operation == ChangeOperation::Delete {
        close_entry(conn, entry, "row deletes are not synced")?;
        return Ok(None);
    }

    let mappings = registry.active_mappings(&document.document_id, &document.sheet_name)?;
    let Some(row) = SqliteRowRepository::new(conn, &entry.table_name).get_by_id(entry.row_id, &mappings)? else {
        close_entry(conn, entry, "row no longer exists")?;
        return Ok(None);
    };
    Ok(Some(Loaded {
        document,
        mappings,
        row,
    }))
}

/// Writes flushed batches to the sheet and stamps the delivered rows
pub struct SheetDeliveryHandler {
    db: Database,
    guard: GuardChain,
    sheet: Arc<dyn SheetWriter>,
    events: EventBus,
    health: HealthMonitor,
    in_flight: InFlightEntries,
}

impl SheetDeliveryHandler {
    pub fn new(
        db: Database,
        guard: GuardChain,
        sheet: Arc<dyn SheetWriter>,
        events: EventBus,
        health: HealthMonitor,
    ) -> Self {
        Self {
            db,
            guard,
            sheet,
            events,
            health,
            in_flight: InFlightEntries::default(),
        }
    }

    /// The in-flight set the poller must share with this handler
    pub fn in_flight(&self) -> InFlightEntries {
        self.in_flight.clone()
    }

    async fn finish(&self, deliveries: &[PendingDelivery]) {
        self.in_flight.release(deliveries);
        for delivery in deliveries {
            self.guard.release(delivery.lease.clone()).await;
        }
    }

    /// Renew each row lease right before the write. A delivery whose lease
    /// lapsed while it waited is held back and left for the next poll.
    async fn live_deliveries<'a>(
        &self,
        deliveries: &'a [PendingDelivery],
    ) -> Result<Vec<&'a PendingDelivery>> {
        let mut live = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let renewed = match &delivery.lease {
                Some(lease) => self.guard.renew(lease).await?,
                None => true,
            };
            if renewed {
                live.push(delivery);
            } else {
                tracing::warn!(
                    entry = delivery.entry_id,
                    table = %delivery.table_name,
                    row = delivery.row_number,
                    "Row lock lapsed before delivery; entry left for the next poll"
                );
            }
        }
        Ok(live)
    }
}

/// Split a batch by the confirmed update indices; a delivery counts only
/// when every one of its cells was confirmed.
fn confirmed_deliveries<'a>(
    deliveries: &[&'a PendingDelivery],
    confirmed: &[usize],
) -> Vec<&'a PendingDelivery> {
    let mut offset = 0;
    let mut delivered = Vec::new();
    for &delivery in deliveries {
        let range = offset..offset + delivery.cells.len();
        offset = range.end;
        if range.clone().all(|index| confirmed.contains(&index)) {
            delivered.push(delivery);
        }
    }
    delivered
}

/// Stamp delivered rows and mark their entries processed.
fn stamp_delivered(conn: &Connection, delivered: &[&PendingDelivery], now: i64) -> Result<Vec<i64>> {
    let tx = conn.unchecked_transaction()?;
    let mut processed = Vec::with_capacity(delivered.len());
    for delivery in delivered {
        let write = RowWrite {
            internal_id: delivery.row_id,
            expected_modified_at: delivery.expected_modified_at,
            expected_hash: delivery.expected_hash.clone(),
            values: BTreeMap::new(),
            synced_values: delivery.synced_values.clone(),
            content_hash: delivery.content_hash.clone(),
            modified_at: delivery.changed_at,
            modified_by: Origin::Store,
            status: SyncStatus::Synced,
        };
        match SqliteRowRepository::new(conn, &delivery.table_name).apply(&write)? {
            WriteOutcome::Written => {
                SqliteChangeLogRepository::new(conn).mark_processed(&[delivery.entry_id])?;
                SqliteDocumentRepository::new(conn).record_success(&delivery.table_name, now)?;
                processed.push(delivery.entry_id);
            }
            WriteOutcome::Superseded => tracing::warn!(
                entry = delivery.entry_id,
                table = %delivery.table_name,
                row = delivery.row_number,
                "Row changed during delivery; entry left for the next poll"
            ),
        }
    }
    tx.commit()?;
    Ok(processed)
}

#[async_trait]
impl DeliveryHandler<SheetBatch> for SheetDeliveryHandler {
    fn partition_key(&self, item: &SheetBatch) -> String {
        item.document_id.clone()
    }

    async fn deliver(&self, item: &SheetBatch, attempt: u32) -> std::result::Result<(), DeliveryError> {
        let live = self.live_deliveries(&item.deliveries).await?;
        if live.is_empty() {
            self.finish(&item.deliveries).await;
            return Ok(());
        }
        let updates: Vec<CellUpdate> = live
            .iter()
            .flat_map(|delivery| delivery.cells.iter().cloned())
            .collect();

        let report = match self.sheet.batch_write(&item.document_id, &updates).await {
            Ok(report) => report,
            Err(error) => {
                tracing::warn!(
                    document = %item.document_id,
                    attempt,
                    error = %error,
                    "Sheet write failed"
                );
                self.health
                    .record_error(Pipeline::Capture, &error.to_string(), now_millis());
                return Err(Error::Sheet(error).into());
            }
        };

        let delivered = confirmed_deliveries(&live, &report.confirmed);
        if delivered.len() < live.len() {
            tracing::warn!(
                document = %item.document_id,
                confirmed = delivered.len(),
                total = live.len(),
                "Sheet confirmed part of the batch"
            );
        }

        let now = now_millis();
        let processed = self
            .db
            .call(|conn| stamp_delivered(conn, &delivered, now))
            .await
            .map_err(|error| {
                self.health
                    .record_error(Pipeline::Capture, &error.to_string(), now);
                DeliveryError::from(error)
            })?;

        self.finish(&item.deliveries).await;
        self.health.record_success(Pipeline::Capture, now);
        tracing::debug!(
            document = %item.document_id,
            entries = processed.len(),
            "Delivered store edits"
        );
        if !processed.is_empty() {
            self.events.emit(SyncEvent::Delivered {
                document_id: item.document_id.clone(),
                entries: processed,
            });
        }
        Ok(())
    }

    async fn on_failed(&self, item: &SheetBatch, error: &DeliveryError) {
        let ids = item.entry_ids();
        let now = now_millis();
        let marked = self
            .db
            .call(|conn| SqliteChangeLogRepository::new(conn).mark_failed(&ids, now))
            .await;
        if let Err(mark_error) = marked {
            tracing::error!(
                document = %item.document_id,
                error = %mark_error,
                "Failed to mark change log entries failed"
            );
        }
        self.finish(&item.deliveries).await;
        self.events.emit(SyncEvent::DeliveryFailed {
            queue: SHEET_QUEUE.to_string(),
            key: item.document_id.clone(),
            error: error.to_string(),
        });
    }
}
