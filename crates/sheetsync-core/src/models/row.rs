//! Synced row model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{CellValue, Origin, SyncStatus};

/// Fixed metadata every backing-table row carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMetadata {
    /// Store-assigned row identifier (`_id`)
    pub internal_id: i64,
    /// 1-based spreadsheet row number (`_row_number`, unique)
    pub row_number: u32,
    /// Hash of the last synchronized content
    pub content_hash: Option<String>,
    /// Timestamp of the last synchronized write (unix ms)
    pub last_modified_at: i64,
    pub last_modified_by: Origin,
    pub sync_status: SyncStatus,
}

/// A backing-table row: metadata, current values and the last synchronized values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedRow {
    pub meta: RowMetadata,
    /// Current values of the active dynamic columns
    pub values: BTreeMap<String, CellValue>,
    /// Values as of the last synchronized write; `content_hash` covers these
    pub synced_values: BTreeMap<String, CellValue>,
}

impl SyncedRow {
    pub fn value(&self, column: &str) -> CellValue {
        self.values.get(column).cloned().unwrap_or_default()
    }

    pub fn synced_value(&self, column: &str) -> CellValue {
        self.synced_values.get(column).cloned().unwrap_or_default()
    }
}
