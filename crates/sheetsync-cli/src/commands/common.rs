use std::path::{Path, PathBuf};

use serde_json::Value;
use sheetsync_core::db::Database;
use sheetsync_core::models::{FailedDelivery, SyncConflict, SyncedDocument};
use sheetsync_core::{EngineConfig, SyncEngine};

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>, configured: Option<PathBuf>) -> PathBuf {
    cli_db_path.or(configured).unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sheetsync")
        .join("sheetsync.db")
}

pub fn open_database(db_path: &Path) -> Result<Database, CliError> {
    Ok(Database::open(db_path)?)
}

/// Engine without a sheet writer: applies ingest and serves operator actions.
pub fn open_local_engine(config: EngineConfig, db_path: &Path) -> Result<SyncEngine, CliError> {
    Ok(SyncEngine::start(config, open_database(db_path)?, None))
}

/// Split `COLUMN=VALUE`; the value is sent as text and coerced by the store.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), CliError> {
    let (column, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::InvalidAssignment(raw.to_string()))?;
    let column = column.trim();
    if column.is_empty() {
        return Err(CliError::InvalidAssignment(raw.to_string()));
    }
    Ok((column.to_string(), Value::String(value.to_string())))
}

/// Raw notification payloads from a single object, an array, or one object per line.
pub fn split_notifications(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items.iter().map(Value::to_string).collect(),
        Ok(value) => vec![value.to_string()],
        Err(_) => trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

fn format_optional_timestamp(timestamp_ms: Option<i64>) -> String {
    timestamp_ms.map_or_else(|| "never".to_string(), format_timestamp)
}

pub fn format_document_lines(documents: &[SyncedDocument]) -> Vec<String> {
    documents
        .iter()
        .map(|document| {
            let mut line = format!(
                "{}/{}  table={}  {}  last_synced={}",
                document.document_id,
                document.sheet_name,
                document.table_name,
                if document.enabled { "enabled" } else { "disabled" },
                format_optional_timestamp(document.last_synced_at)
            );
            if let Some(error) = &document.last_error {
                line.push_str(&format!("  error={error}"));
            }
            line
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "#{:<5} {}  {:<13}  {} row={} column={}  sheet={:?}@{} store={:?}@{}",
                conflict.id,
                format_timestamp(conflict.created_at),
                conflict.resolution.as_str(),
                conflict.document_id,
                conflict.row_number,
                conflict.column_name,
                conflict.external_value.display(),
                format_timestamp(conflict.external_updated_at),
                conflict.store_value.display(),
                format_timestamp(conflict.store_updated_at)
            )
        })
        .collect()
}

pub fn format_failed_lines(failed: &[FailedDelivery]) -> Vec<String> {
    failed
        .iter()
        .map(|delivery| {
            let mut line = format!(
                "#{:<5} {}  queue={} key={} attempts={}  {}",
                delivery.id,
                format_timestamp(delivery.failed_at),
                delivery.queue,
                delivery.partition_key,
                delivery.attempts,
                delivery.error
            );
            if let Some(requeued_at) = delivery.requeued_at {
                line.push_str(&format!("  requeued={}", format_timestamp(requeued_at)));
            }
            line
        })
        .collect()
}
