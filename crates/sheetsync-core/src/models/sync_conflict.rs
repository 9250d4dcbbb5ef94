//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::CellValue;
use crate::error::{Error, Result};

/// How a recorded conflict was (or is to be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    ExternalWins,
    StoreWins,
    Manual,
    Pending,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExternalWins => "EXTERNAL_WINS",
            Self::StoreWins => "STORE_WINS",
            Self::Manual => "MANUAL",
            Self::Pending => "PENDING",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXTERNAL_WINS" => Ok(Self::ExternalWins),
            "STORE_WINS" => Ok(Self::StoreWins),
            "MANUAL" => Ok(Self::Manual),
            "PENDING" => Ok(Self::Pending),
            other => Err(Error::InvalidInput(format!("unknown resolution: {other}"))),
        }
    }
}

/// Audit record of a concurrent edit the LWW arbiter refused to merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub document_id: String,
    pub row_number: u32,
    pub column_name: String,
    /// Value on the spreadsheet side
    pub external_value: CellValue,
    /// Spreadsheet-side write timestamp (unix ms)
    pub external_updated_at: i64,
    /// Value on the store side
    pub store_value: CellValue,
    /// Store-side write timestamp (unix ms)
    pub store_updated_at: i64,
    pub resolution: Resolution,
    /// Detection timestamp (unix ms)
    pub created_at: i64,
    /// Set by the operator action that resolved the conflict
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
}

impl SyncConflict {
    pub const fn is_pending(&self) -> bool {
        matches!(self.resolution, Resolution::Pending)
    }
}
