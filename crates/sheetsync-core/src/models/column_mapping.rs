//! Column mapping model

use serde::{Deserialize, Serialize};

use super::DataType;

/// Maps a spreadsheet column to a physical column of the backing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Mapping row identifier
    pub id: i64,
    pub document_id: String,
    pub sheet_name: String,
    /// 1-based spreadsheet column index
    pub column_index: u32,
    /// Header text as last seen in the sheet
    pub header: String,
    /// Sanitized physical column name, unique within `table_name`
    pub column_name: String,
    pub data_type: DataType,
    /// Terminal: once set the column is no longer synced
    pub deprecated: bool,
    /// Backing table the column lives on
    pub table_name: String,
}

impl ColumnMapping {
    pub const fn is_active(&self) -> bool {
        !self.deprecated
    }
}
