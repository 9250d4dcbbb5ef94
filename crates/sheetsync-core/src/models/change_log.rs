//! Change log model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ValueMap;
use crate::error::{Error, Result};

/// Row mutation captured on the store side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation: {other}"))),
        }
    }
}

/// Append-only record of a store-side row change awaiting delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    /// `_id` of the changed row
    pub row_id: i64,
    pub operation: ChangeOperation,
    pub changed_columns: Vec<String>,
    pub old_values: ValueMap,
    pub new_values: ValueMap,
    /// Capture timestamp (unix ms)
    pub changed_at: i64,
    /// Set only after confirmed external delivery
    pub processed: bool,
    /// Set when the entry's delivery moved to the failed-delivery path
    pub failed_at: Option<i64>,
}
