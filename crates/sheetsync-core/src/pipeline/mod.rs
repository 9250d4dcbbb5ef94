//! Directional pipelines and their completion signals

mod capture;
mod ingest;

use serde::Serialize;
use tokio::sync::broadcast;

pub use capture::{
    ChangeCapture, InFlightEntries, PendingDelivery, SheetBatch, SheetDeliveryHandler, SHEET_QUEUE,
};
pub use ingest::{IngestHandler, IngestOutcome, INGEST_QUEUE};

use crate::guard::SkipReason;
use crate::models::Direction;

/// Completion signal emitted by either pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Applied {
        direction: Direction,
        document_id: String,
        sheet_name: String,
        row: u32,
        columns: Vec<String>,
    },
    Skipped {
        direction: Direction,
        document_id: String,
        row: u32,
        reason: SkipReason,
    },
    Conflict {
        direction: Direction,
        document_id: String,
        row: u32,
        columns: Vec<String>,
    },
    /// Change log entries confirmed written to the sheet
    Delivered {
        document_id: String,
        entries: Vec<i64>,
    },
    DeliveryFailed {
        queue: String,
        key: String,
        error: String,
    },
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped when nobody listens.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}
