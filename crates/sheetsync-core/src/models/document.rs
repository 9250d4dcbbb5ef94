//! Synced document model

use serde::{Deserialize, Serialize};

/// A spreadsheet tab registered for synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedDocument {
    pub document_id: String,
    pub sheet_name: String,
    /// Backing table holding the tab's rows
    pub table_name: String,
    pub enabled: bool,
    /// Last successful pipeline outcome (unix ms)
    pub last_synced_at: Option<i64>,
    /// Last pipeline error, cleared on the next success
    pub last_error: Option<String>,
    /// Registration timestamp (unix ms)
    pub created_at: i64,
}
