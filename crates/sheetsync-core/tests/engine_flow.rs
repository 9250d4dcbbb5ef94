//! End-to-end flows through a running engine with an in-memory sheet

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sheetsync_core::config::CoordinationBackend;
use sheetsync_core::db::Database;
use sheetsync_core::dispatch::{BatchConfig, RetryPolicy};
use sheetsync_core::guard::SkipReason;
use sheetsync_core::models::{Direction, Resolution};
use sheetsync_core::pipeline::SyncEvent;
use sheetsync_core::sheet::{MemorySheet, SheetError};
use sheetsync_core::util::now_millis;
use sheetsync_core::{CellNotification, CellValue, EngineConfig, SyncEngine};
use tokio::sync::broadcast::{self, error::RecvError};

const DOC: &str = "doc-1";
const SHEET: &str = "Orders";

fn config() -> EngineConfig {
    EngineConfig {
        coordination: CoordinationBackend::Memory,
        poll_interval: Duration::from_millis(50),
        batch: BatchConfig {
            max_size: 50,
            max_wait: Duration::from_millis(50),
        },
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        },
        ..EngineConfig::default()
    }
}

fn start() -> (SyncEngine, MemorySheet) {
    let sheet = MemorySheet::new();
    let engine = SyncEngine::start(
        config(),
        Database::open_in_memory().unwrap(),
        Some(Arc::new(sheet.clone())),
    );
    (engine, sheet)
}

fn cell(row: u32, col: u32, value: serde_json::Value, timestamp: i64) -> CellNotification {
    CellNotification {
        document_id: DOC.to_string(),
        sheet_name: SHEET.to_string(),
        row,
        col,
        value,
        timestamp,
        editor_identity: Some("ana@example.com".to_string()),
    }
}

fn edit(column: &str, value: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    [(column.to_string(), value)].into_iter().collect()
}

async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    matches: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Header plus one data cell, applied before the test proper starts.
async fn seed(engine: &SyncEngine, value: serde_json::Value, timestamp: i64) {
    let mut events = engine.subscribe();
    assert!(engine.submit_change(cell(1, 1, json!("Item"), timestamp)).is_accepted());
    engine.drain_ingest().await;
    assert!(engine.submit_change(cell(2, 1, value, timestamp)).is_accepted());
    wait_for(&mut events, |event| matches!(event, SyncEvent::Applied { row: 2, .. })).await;
}

#[tokio::test]
async fn store_edit_reaches_the_sheet_and_its_echo_is_dropped() {
    let (engine, sheet) = start();
    seed(&engine, json!("Widget"), now_millis() - 60_000).await;

    let mut events = engine.subscribe();
    let changed_at = now_millis();
    engine
        .record_store_edit(DOC, SHEET, 2, &edit("item", json!("Gadget")), changed_at)
        .await
        .unwrap()
        .unwrap();

    wait_for(&mut events, |event| matches!(event, SyncEvent::Delivered { .. })).await;
    assert_eq!(sheet.cell(DOC, SHEET, 2, 1).as_deref(), Some("Gadget"));

    // The sheet reports our own write back.
    assert!(engine
        .submit_change(cell(2, 1, json!("Gadget"), changed_at + 1))
        .is_accepted());
    let skipped = wait_for(&mut events, |event| {
        matches!(event, SyncEvent::Skipped { direction: Direction::ToStore, .. })
    })
    .await;
    assert!(matches!(
        skipped,
        SyncEvent::Skipped {
            reason: SkipReason::Unchanged,
            ..
        }
    ));

    let status = engine.store_status().await.unwrap();
    assert_eq!(status.pending_changes, 0);
    assert_eq!(sheet.batches().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn older_store_edit_is_recorded_as_conflict_and_resolved() {
    let (engine, sheet) = start();
    let now = now_millis();
    seed(&engine, json!("Sheet value"), now - 10_000).await;

    let mut events = engine.subscribe();
    engine
        .record_store_edit(DOC, SHEET, 2, &edit("Item", json!("Store value")), now - 20_000)
        .await
        .unwrap()
        .unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::Conflict { direction: Direction::ToSheet, .. })
    })
    .await;

    let conflicts = engine.list_conflicts(true, 10).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].external_value, CellValue::Text("Sheet value".into()));
    assert_eq!(conflicts[0].store_value, CellValue::Text("Store value".into()));
    assert!(sheet.batches().is_empty());

    let resolved = engine
        .resolve_conflict(conflicts[0].id, Resolution::StoreWins, Some("ops"))
        .await
        .unwrap();
    assert_eq!(resolved.resolution, Resolution::StoreWins);
    assert_eq!(resolved.resolved_by.as_deref(), Some("ops"));
    assert!(engine.list_conflicts(true, 10).await.unwrap().is_empty());

    let err = engine
        .resolve_conflict(conflicts[0].id, Resolution::Manual, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already resolved"));
    engine.shutdown().await;
}

#[tokio::test]
async fn rejected_sheet_write_fails_and_requeues() {
    let (engine, sheet) = start();
    seed(&engine, json!("Widget"), now_millis() - 60_000).await;
    sheet.fail_next(SheetError::Rejected("protected range".to_string()));

    let mut events = engine.subscribe();
    engine
        .record_store_edit(DOC, SHEET, 2, &edit("item", json!("Gadget")), now_millis())
        .await
        .unwrap()
        .unwrap();
    wait_for(&mut events, |event| matches!(event, SyncEvent::DeliveryFailed { .. })).await;

    let failed = engine.list_failed(false, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].queue, "sheet");
    assert_eq!(failed[0].attempts, 1);
    assert_eq!(sheet.cell(DOC, SHEET, 2, 1), None);

    let requeued = engine.requeue_failed(failed[0].id).await.unwrap();
    assert!(requeued.requeued_at.is_some());
    wait_for(&mut events, |event| matches!(event, SyncEvent::Delivered { .. })).await;
    assert_eq!(sheet.cell(DOC, SHEET, 2, 1).as_deref(), Some("Gadget"));

    assert!(engine.requeue_failed(failed[0].id).await.is_err());
    assert!(engine.list_failed(false, 10).await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn transient_sheet_errors_are_retried() {
    let (engine, sheet) = start();
    seed(&engine, json!(1), now_millis() - 60_000).await;
    sheet.fail_next(SheetError::Transient("503".to_string()));

    let mut events = engine.subscribe();
    engine
        .record_store_edit(DOC, SHEET, 2, &edit("item", json!(2)), now_millis())
        .await
        .unwrap()
        .unwrap();
    wait_for(&mut events, |event| matches!(event, SyncEvent::Delivered { .. })).await;

    assert_eq!(sheet.cell(DOC, SHEET, 2, 1).as_deref(), Some("2"));
    let health = engine.health().await;
    assert_eq!(health.dispatch.sheet_queue.retried, 1);
    assert_eq!(health.dispatch.sheet_queue.failed, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn disabled_document_ignores_sheet_edits() {
    let (engine, _sheet) = start();
    seed(&engine, json!("Widget"), now_millis() - 60_000).await;
    engine.set_document_enabled(DOC, SHEET, false).await.unwrap();

    let mut events = engine.subscribe();
    assert!(engine
        .submit_change(cell(3, 1, json!("Ignored"), now_millis()))
        .is_accepted());
    engine.drain_ingest().await;

    assert!(events.try_recv().is_err());
    let documents = engine.list_documents().await.unwrap();
    assert_eq!(documents.len(), 1);
    assert!(!documents[0].enabled);
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_accumulated_batches() {
    let sheet = MemorySheet::new();
    let engine = SyncEngine::start(
        EngineConfig {
            batch: BatchConfig {
                max_size: 50,
                max_wait: Duration::from_secs(3_600),
            },
            ..config()
        },
        Database::open_in_memory().unwrap(),
        Some(Arc::new(sheet.clone())),
    );
    seed(&engine, json!("Widget"), now_millis() - 60_000).await;

    engine
        .record_store_edit(DOC, SHEET, 2, &edit("item", json!("Gadget")), now_millis())
        .await
        .unwrap()
        .unwrap();
    // Give the poller a few cycles to pick the entry up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sheet.batches().is_empty());

    engine.shutdown().await;
    assert_eq!(sheet.cell(DOC, SHEET, 2, 1).as_deref(), Some("Gadget"));
}
