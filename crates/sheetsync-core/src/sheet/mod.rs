//! External spreadsheet write capability

mod http;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpSheetWriter;
pub use memory::MemorySheet;

/// One cell to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdate {
    pub sheet_name: String,
    /// 1-based row
    pub row: u32,
    /// 1-based column
    pub col: u32,
    /// Display form of the value
    pub value: String,
}

/// Indices (into the submitted batch) of the updates the sheet confirmed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWriteReport {
    pub confirmed: Vec<usize>,
}

impl BatchWriteReport {
    /// Every update of a batch of `len` confirmed
    pub fn all(len: usize) -> Self {
        Self {
            confirmed: (0..len).collect(),
        }
    }

    pub fn is_complete(&self, len: usize) -> bool {
        (0..len).all(|index| self.confirmed.contains(&index))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SheetError {
    #[error("Sheet API rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Sheet API rejected the write: {0}")]
    Rejected(String),
    #[error("Sheet API unavailable: {0}")]
    Transient(String),
    #[error("Invalid sheet API configuration: {0}")]
    InvalidConfiguration(String),
}

impl SheetError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

/// Batched write access to an external document
#[async_trait]
pub trait SheetWriter: Send + Sync {
    /// Write `updates` to `document_id` in one call.
    async fn batch_write(
        &self,
        document_id: &str,
        updates: &[CellUpdate],
    ) -> Result<BatchWriteReport, SheetError>;
}
