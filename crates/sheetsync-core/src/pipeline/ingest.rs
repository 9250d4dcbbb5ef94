//! Sheet → store pipeline
//!
//! One queued notification is one cell. The document is registered on first
//! sight; the column is only planned. The candidate content (last
//! synchronized values plus the cell coerced to the planned type) goes
//! through the guard chain, and only an applied change commits the column
//! mapping and writes the row, in one transaction with a compare-and-set on
//! the row metadata.

use async_trait::async_trait;
use rusqlite::Connection;

use super::{EventBus, SyncEvent};
use crate::db::{
    Database, NewConflict, RowWrite, SqliteChangeLogRepository, SqliteConflictRepository,
    SqliteDocumentRepository, SqliteRowRepository, WriteOutcome,
};
use crate::dispatch::{DeliveryError, DeliveryHandler};
use crate::error::Result;
use crate::guard::{Decision, GuardChain, IncomingChange, SkipReason};
use crate::health::{HealthMonitor, Pipeline};
use crate::models::{
    CellNotification, Direction, Origin, SyncStatus, SyncedDocument, SyncedRow,
};
use crate::schema::{coerce, ColumnPlan, SchemaRegistry};
use crate::util::now_millis;

pub const INGEST_QUEUE: &str = "ingest";

/// What happened to one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    Skipped(SkipReason),
    Conflict,
    /// The change-capture pipeline holds the row
    Requeued { holder: Direction },
    /// The row metadata moved between evaluation and write
    Superseded,
    HeaderUpdated,
    /// Above the header row; not row data
    OutsideDataRange,
    DocumentDisabled,
    ColumnDeprecated,
}

struct Target {
    document: SyncedDocument,
    plan: ColumnPlan,
    row: SyncedRow,
    /// Newest store edit of the column not yet on the sheet
    undelivered_at: Option<i64>,
}

enum Prepared {
    Done(IngestOutcome),
    Row(Box<Target>),
}

/// Applies queued cell notifications to the store
#[derive(Clone)]
pub struct IngestHandler {
    db: Database,
    guard: GuardChain,
    events: EventBus,
    health: HealthMonitor,
    header_row: u32,
}

impl IngestHandler {
    pub const fn new(
        db: Database,
        guard: GuardChain,
        events: EventBus,
        health: HealthMonitor,
        header_row: u32,
    ) -> Self {
        Self {
            db,
            guard,
            events,
            health,
            header_row,
        }
    }

    /// Run one notification through registration, the guard chain and the write.
    pub async fn process(&self, notification: &CellNotification) -> Result<IngestOutcome> {
        let now = now_millis();
        let header_row = self.header_row;
        let prepared = self
            .db
            .call(|conn| prepare(conn, notification, header_row, now))
            .await?;
        let target = match prepared {
            Prepared::Done(outcome) => return Ok(outcome),
            Prepared::Row(target) => *target,
        };

        let column = target.plan.column_name.clone();
        let value = coerce(&notification.value, target.plan.data_type);
        let mut candidate = target.row.synced_values.clone();
        candidate.insert(column.clone(), value.clone());

        let change = IncomingChange {
            document_id: &notification.document_id,
            direction: Direction::ToStore,
            timestamp: notification.timestamp,
            values: &candidate,
        };
        let meta = &target.row.meta;
        let table = target.document.table_name.as_str();

        // A store edit still waiting for delivery is the row's latest write
        // for arbitration; the compare-and-set still uses the stored metadata.
        let mut effective = meta.clone();
        if let Some(undelivered_at) = target.undelivered_at {
            if undelivered_at > effective.last_modified_at {
                effective.last_modified_by = Origin::Store;
                effective.last_modified_at = undelivered_at;
            }
        }

        match self.guard.evaluate(&change, &effective, now).await? {
            Decision::Skip(reason) => {
                self.events.emit(SyncEvent::Skipped {
                    direction: Direction::ToStore,
                    document_id: notification.document_id.clone(),
                    row: notification.row,
                    reason,
                });
                Ok(IngestOutcome::Skipped(reason))
            }
            Decision::Requeue { holder } => Ok(IngestOutcome::Requeued { holder }),
            Decision::Apply {
                lease,
                content_hash,
            } => {
                let write = RowWrite {
                    internal_id: meta.internal_id,
                    expected_modified_at: meta.last_modified_at,
                    expected_hash: meta.content_hash.clone(),
                    values: [(column.clone(), value)].into_iter().collect(),
                    synced_values: candidate.clone(),
                    content_hash,
                    modified_at: notification.timestamp,
                    modified_by: Origin::External,
                    status: SyncStatus::Synced,
                };
                let document = &target.document;
                let plan = &target.plan;
                let written = self
                    .db
                    .call(|conn| {
                        let tx = conn.unchecked_transaction()?;
                        let registry = SchemaRegistry::new(conn);
                        let Some(mapping) = registry.commit_column_plan(document, plan, now)? else {
                            return Ok(WriteOutcome::Superseded);
                        };
                        registry.ensure_column_exists_on_table(
                            table,
                            &mapping.column_name,
                            mapping.data_type,
                        )?;
                        let outcome = SqliteRowRepository::new(conn, table).apply(&write)?;
                        if outcome == WriteOutcome::Superseded {
                            return Ok(outcome);
                        }
                        SqliteDocumentRepository::new(conn).record_success(table, now)?;
                        tx.commit()?;
                        Ok(outcome)
                    })
                    .await;
                self.guard.release(lease).await;

                if written? == WriteOutcome::Superseded {
                    return Ok(IngestOutcome::Superseded);
                }
                tracing::debug!(
                    document = %notification.document_id,
                    row = notification.row,
                    column = %column,
                    "Applied sheet edit"
                );
                self.events.emit(SyncEvent::Applied {
                    direction: Direction::ToStore,
                    document_id: notification.document_id.clone(),
                    sheet_name: notification.sheet_name.clone(),
                    row: notification.row,
                    columns: vec![column],
                });
                Ok(IngestOutcome::Applied)
            }
            Decision::Conflict { lease } => {
                let conflict = NewConflict {
                    document_id: notification.document_id.clone(),
                    row_number: notification.row,
                    column_name: column.clone(),
                    external_value: value,
                    external_updated_at: notification.timestamp,
                    store_value: target.row.value(&column),
                    store_updated_at: effective.last_modified_at,
                };
                let internal_id = meta.internal_id;
                let recorded = self
                    .db
                    .call(|conn| {
                        let tx = conn.unchecked_transaction()?;
                        SqliteConflictRepository::new(conn).insert(&conflict, now)?;
                        SqliteRowRepository::new(conn, table)
                            .set_status(internal_id, SyncStatus::Conflict)?;
                        tx.commit()?;
                        Ok(())
                    })
                    .await;
                self.guard.release(lease).await;
                recorded?;

                tracing::warn!(
                    document = %notification.document_id,
                    row = notification.row,
                    column = %column,
                    "Conflicting sheet edit recorded"
                );
                self.events.emit(SyncEvent::Conflict {
                    direction: Direction::ToStore,
                    document_id: notification.document_id.clone(),
                    row: notification.row,
                    columns: vec![column],
                });
                Ok(IngestOutcome::Conflict)
            }
        }
    }

    async fn note_document_error(&self, notification: &CellNotification, error: &str) {
        let result = self
            .db
            .call(|conn| {
                if let Some(document) = SchemaRegistry::new(conn)
                    .document(&notification.document_id, &notification.sheet_name)?
                {
                    SqliteDocumentRepository::new(conn).record_error(&document.table_name, error)?;
                }
                Ok(())
            })
            .await;
        if let Err(record_error) = result {
            tracing::warn!(error = %record_error, "Failed to record document error");
        }
    }
}

fn prepare(
    conn: &Connection,
    notification: &CellNotification,
    header_row: u32,
    now: i64,
) -> Result<Prepared> {
    let registry = SchemaRegistry::new(conn);
    let document =
        registry.ensure_document_registered(&notification.document_id, &notification.sheet_name, now)?;
    if !document.enabled {
        tracing::info!(
            document = %document.document_id,
            sheet = %document.sheet_name,
            "Document disabled, skipping sheet edit"
        );
        return Ok(Prepared::Done(IngestOutcome::DocumentDisabled));
    }

    if notification.row == header_row {
        registry.register_header(&document, notification.col, &notification.value, now)?;
        return Ok(Prepared::Done(IngestOutcome::HeaderUpdated));
    }
    if notification.row < header_row {
        return Ok(Prepared::Done(IngestOutcome::OutsideDataRange));
    }

    let plan = registry.plan_column_mapping(&document, notification.col, &notification.value)?;
    if plan.deprecated {
        tracing::debug!(
            table = %document.table_name,
            column = %plan.column_name,
            "Column deprecated, skipping sheet edit"
        );
        return Ok(Prepared::Done(IngestOutcome::ColumnDeprecated));
    }

    let mappings = registry.active_mappings(&document.document_id, &document.sheet_name)?;
    let row = SqliteRowRepository::new(conn, &document.table_name)
        .get_or_create(notification.row, &mappings)?;
    let undelivered_at = SqliteChangeLogRepository::new(conn).latest_undelivered_at(
        &document.table_name,
        row.meta.internal_id,
        &plan.column_name,
    )?;
    Ok(Prepared::Row(Box::new(Target {
        document,
        plan,
        row,
        undelivered_at,
    })))
}

#[async_trait]
impl DeliveryHandler<CellNotification> for IngestHandler {
    fn partition_key(&self, item: &CellNotification) -> String {
        format!("{}:{}:{}", item.document_id, item.sheet_name, item.row)
    }

    async fn deliver(
        &self,
        item: &CellNotification,
        attempt: u32,
    ) -> std::result::Result<(), DeliveryError> {
        match self.process(item).await {
            Ok(IngestOutcome::Requeued { holder }) => Err(DeliveryError::retryable(format!(
                "row {} locked by {holder}",
                item.row
            ))),
            Ok(IngestOutcome::Superseded) => Err(DeliveryError::retryable(format!(
                "row {} changed during apply",
                item.row
            ))),
            Ok(_) => {
                self.health.record_success(Pipeline::Ingest, now_millis());
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    document = %item.document_id,
                    row = item.row,
                    attempt,
                    error = %error,
                    "Sheet edit failed"
                );
                let message = error.to_string();
                self.health.record_error(Pipeline::Ingest, &message, now_millis());
                self.note_document_error(item, &message).await;
                Err(error.into())
            }
        }
    }

    async fn on_failed(&self, item: &CellNotification, error: &DeliveryError) {
        self.events.emit(SyncEvent::DeliveryFailed {
            queue: INGEST_QUEUE.to_string(),
            key: self.partition_key(item),
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::coordination::{LockAttempt, MemoryCoordinationStore, RowLocks};
    use crate::guard::content_hash;
    use crate::models::{CellValue, DataType};

    struct Harness {
        db: Database,
        locks: RowLocks,
        handler: IngestHandler,
    }

    fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let locks = RowLocks::new(
            Arc::new(MemoryCoordinationStore::new()),
            Duration::from_secs(30),
        );
        let guard = GuardChain::new(locks.clone(), Duration::from_millis(5_000));
        let handler = IngestHandler::new(
            db.clone(),
            guard,
            EventBus::default(),
            HealthMonitor::new(),
            1,
        );
        Harness { db, locks, handler }
    }

    fn edit(row: u32, col: u32, value: serde_json::Value, timestamp: i64) -> CellNotification {
        CellNotification {
            document_id: "doc-1".to_string(),
            sheet_name: "Orders".to_string(),
            row,
            col,
            value,
            timestamp,
            editor_identity: None,
        }
    }

    async fn stored_row(db: &Database, row: u32) -> SyncedRow {
        db.call(|conn| {
            let registry = SchemaRegistry::new(conn);
            let document = registry.document("doc-1", "Orders")?.unwrap();
            let mappings = registry.active_mappings("doc-1", "Orders")?;
            SqliteRowRepository::new(conn, &document.table_name)
                .get_by_number(row, &mappings)
                .map(Option::unwrap)
        })
        .await
        .unwrap()
    }

    async fn column_types(db: &Database) -> Vec<(u32, String, DataType)> {
        db.call(|conn| SchemaRegistry::new(conn).active_mappings("doc-1", "Orders"))
            .await
            .unwrap()
            .into_iter()
            .map(|mapping| (mapping.column_index, mapping.column_name, mapping.data_type))
            .collect()
    }

    async fn table_name(db: &Database) -> String {
        db.call(|conn| Ok(SchemaRegistry::new(conn).document("doc-1", "Orders")?.unwrap().table_name))
            .await
            .unwrap()
    }

    /// A "Status" TEXT column with "pending" applied to row 2 at `applied_at`.
    async fn status_column(h: &Harness, applied_at: i64) {
        h.handler.process(&edit(1, 2, json!("Status"), applied_at)).await.unwrap();
        let outcome = h
            .handler
            .process(&edit(2, 2, json!("pending"), applied_at))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Applied);
        assert_eq!(
            column_types(&h.db).await,
            vec![(2, "status".to_string(), DataType::Text)]
        );
    }

    #[tokio::test]
    async fn first_edit_registers_schema_and_applies() {
        let h = harness();
        let now = now_millis();

        let outcome = h.handler.process(&edit(2, 3, json!("4.5"), now)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Applied);

        let row = stored_row(&h.db, 2).await;
        assert_eq!(row.value("column_3"), CellValue::Number(4.5));
        assert_eq!(row.meta.last_modified_by, Origin::External);
        assert_eq!(row.meta.last_modified_at, now);
        assert_eq!(row.meta.sync_status, SyncStatus::Synced);
        assert_eq!(
            row.meta.content_hash.as_deref(),
            Some(content_hash(&row.synced_values).as_str())
        );
    }

    #[tokio::test]
    async fn rapid_same_side_edit_is_an_echo() {
        let h = harness();
        let t = now_millis();

        h.handler.process(&edit(2, 3, json!("4.5"), t)).await.unwrap();
        let outcome = h
            .handler
            .process(&edit(2, 3, json!("9"), t + 1_000))
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::Echo));
        assert_eq!(stored_row(&h.db, 2).await.value("column_3"), CellValue::Number(4.5));
    }

    #[tokio::test]
    async fn identical_content_after_cooldown_is_unchanged() {
        let h = harness();
        let t = now_millis() - 60_000;

        h.handler.process(&edit(2, 3, json!("4.5"), t)).await.unwrap();
        let outcome = h
            .handler
            .process(&edit(2, 3, json!(4.5), t + 30_000))
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::Unchanged));
    }

    #[tokio::test]
    async fn older_sheet_edit_against_newer_store_write_conflicts() {
        let h = harness();
        let now = now_millis();
        h.handler
            .process(&edit(2, 3, json!("1.5"), now - 60_000))
            .await
            .unwrap();

        // Store-side write confirmed at now - 10s.
        let row = stored_row(&h.db, 2).await;
        let table = h
            .db
            .call(|conn| Ok(SchemaRegistry::new(conn).document("doc-1", "Orders")?.unwrap().table_name))
            .await
            .unwrap();
        let snapshot: BTreeMap<String, CellValue> =
            [("column_3".to_string(), CellValue::Number(2.0))].into_iter().collect();
        let write = RowWrite {
            internal_id: row.meta.internal_id,
            expected_modified_at: row.meta.last_modified_at,
            expected_hash: row.meta.content_hash.clone(),
            values: snapshot.clone(),
            synced_values: snapshot.clone(),
            content_hash: content_hash(&snapshot),
            modified_at: now - 10_000,
            modified_by: Origin::Store,
            status: SyncStatus::Synced,
        };
        h.db.call(|conn| SqliteRowRepository::new(conn, &table).apply(&write))
            .await
            .unwrap();

        let outcome = h
            .handler
            .process(&edit(2, 3, json!("3"), now - 20_000))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Conflict);

        let row = stored_row(&h.db, 2).await;
        assert_eq!(row.value("column_3"), CellValue::Number(2.0));
        assert_eq!(row.meta.last_modified_by, Origin::Store);
        assert_eq!(row.meta.sync_status, SyncStatus::Conflict);

        let conflicts = h
            .db
            .call(|conn| SqliteConflictRepository::new(conn).list(true, 10))
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].external_value, CellValue::Number(3.0));
        assert_eq!(conflicts[0].store_value, CellValue::Number(2.0));
        assert_eq!(conflicts[0].store_updated_at, now - 10_000);
    }

    #[tokio::test]
    async fn undelivered_newer_store_edit_wins_arbitration() {
        let h = harness();
        let now = now_millis();
        h.handler
            .process(&edit(2, 3, json!("1.5"), now - 60_000))
            .await
            .unwrap();

        let edits: BTreeMap<String, CellValue> =
            [("column_3".to_string(), CellValue::Number(8.0))].into_iter().collect();
        h.db.call(|conn| {
            let registry = SchemaRegistry::new(conn);
            let document = registry.document("doc-1", "Orders")?.unwrap();
            let mappings = registry.active_mappings("doc-1", "Orders")?;
            SqliteRowRepository::new(conn, &document.table_name)
                .write_store_edit(2, &edits, &mappings, now - 5_000)
        })
        .await
        .unwrap();

        let outcome = h
            .handler
            .process(&edit(2, 3, json!("3"), now - 20_000))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Conflict);
        assert_eq!(stored_row(&h.db, 2).await.value("column_3"), CellValue::Number(8.0));
    }

    #[tokio::test]
    async fn header_row_names_the_column() {
        let h = harness();
        let now = now_millis();

        let outcome = h
            .handler
            .process(&edit(1, 2, json!("Order #"), now))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::HeaderUpdated);

        h.handler.process(&edit(2, 2, json!("17"), now)).await.unwrap();
        let mappings = h
            .db
            .call(|conn| SchemaRegistry::new(conn).active_mappings("doc-1", "Orders"))
            .await
            .unwrap();
        assert_eq!(mappings[0].column_name, "order");
        assert_eq!(mappings[0].data_type, DataType::Number);
        assert_eq!(stored_row(&h.db, 2).await.value("order"), CellValue::Number(17.0));
    }

    #[tokio::test]
    async fn disabled_document_is_skipped() {
        let h = harness();
        let now = now_millis();
        h.db.call(|conn| {
            let registry = SchemaRegistry::new(conn);
            registry.ensure_document_registered("doc-1", "Orders", now)?;
            registry.set_document_enabled("doc-1", "Orders", false)
        })
        .await
        .unwrap();

        let outcome = h.handler.process(&edit(2, 3, json!("4"), now)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::DocumentDisabled);
    }

    #[tokio::test]
    async fn row_held_by_capture_is_retryable() {
        let h = harness();
        let lease = h.locks.acquire("doc-1", 2, Direction::ToSheet).await.unwrap();
        assert!(matches!(lease, LockAttempt::Acquired(_)));

        let result = h.handler.deliver(&edit(2, 3, json!("4"), now_millis()), 1).await;
        assert!(matches!(result, Err(DeliveryError::Retryable { .. })));
    }

    #[tokio::test]
    async fn stale_edit_leaves_column_type_alone() {
        let h = harness();
        let now = now_millis();
        status_column(&h, now - 60_000).await;

        // "yes" would upgrade the TEXT column to BOOLEAN if it were applied.
        let outcome = h
            .handler
            .process(&edit(2, 2, json!("yes"), now - 70_000))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::Stale));
        assert_eq!(
            column_types(&h.db).await,
            vec![(2, "status".to_string(), DataType::Text)]
        );
        assert_eq!(
            stored_row(&h.db, 2).await.value("status"),
            CellValue::Text("pending".into())
        );

        let outcome = h
            .handler
            .process(&edit(3, 2, json!("shipped"), now))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Applied);
        assert_eq!(
            stored_row(&h.db, 3).await.value("status"),
            CellValue::Text("shipped".into())
        );
    }

    #[tokio::test]
    async fn echo_leaves_column_type_alone() {
        let h = harness();
        let now = now_millis();
        status_column(&h, now).await;

        let outcome = h
            .handler
            .process(&edit(2, 2, json!("yes"), now + 1_000))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::Echo));
        assert_eq!(
            column_types(&h.db).await,
            vec![(2, "status".to_string(), DataType::Text)]
        );
        assert_eq!(
            stored_row(&h.db, 2).await.value("status"),
            CellValue::Text("pending".into())
        );
    }

    #[tokio::test]
    async fn unchanged_edit_registers_no_column() {
        let h = harness();
        let now = now_millis();
        status_column(&h, now - 60_000).await;

        // An empty cell in an unseen column leaves the row content as it was.
        let outcome = h
            .handler
            .process(&edit(2, 4, json!(""), now - 30_000))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::Unchanged));
        assert_eq!(
            column_types(&h.db).await,
            vec![(2, "status".to_string(), DataType::Text)]
        );

        let row = stored_row(&h.db, 2).await;
        assert_eq!(row.value("status"), CellValue::Text("pending".into()));
        assert_eq!(row.meta.last_modified_at, now - 60_000);
    }

    #[tokio::test]
    async fn conflicted_edits_leave_the_schema_alone() {
        let h = harness();
        let now = now_millis();
        status_column(&h, now - 60_000).await;

        let table = table_name(&h.db).await;
        let row = stored_row(&h.db, 2).await;
        let snapshot: BTreeMap<String, CellValue> =
            [("status".to_string(), CellValue::Text("packed".into()))].into_iter().collect();
        let write = RowWrite {
            internal_id: row.meta.internal_id,
            expected_modified_at: row.meta.last_modified_at,
            expected_hash: row.meta.content_hash.clone(),
            values: snapshot.clone(),
            synced_values: snapshot.clone(),
            content_hash: content_hash(&snapshot),
            modified_at: now - 10_000,
            modified_by: Origin::Store,
            status: SyncStatus::Synced,
        };
        h.db.call(|conn| SqliteRowRepository::new(conn, &table).apply(&write))
            .await
            .unwrap();

        // Known TEXT column that "yes" would upgrade.
        let outcome = h
            .handler
            .process(&edit(2, 2, json!("yes"), now - 20_000))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Conflict);

        // Unseen column.
        let outcome = h
            .handler
            .process(&edit(2, 5, json!("12"), now - 20_000))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Conflict);

        assert_eq!(
            column_types(&h.db).await,
            vec![(2, "status".to_string(), DataType::Text)]
        );
        let row = stored_row(&h.db, 2).await;
        assert_eq!(row.value("status"), CellValue::Text("packed".into()));
        assert_eq!(row.meta.last_modified_by, Origin::Store);
        assert_eq!(row.meta.last_modified_at, now - 10_000);
    }
}
