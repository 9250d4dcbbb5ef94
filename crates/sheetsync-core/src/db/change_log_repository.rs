//! Change log repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, params_from_iter, Connection};

use super::optional;
use crate::error::{Error, Result};
use crate::models::{ChangeLogEntry, ChangeOperation, ValueMap};

const SELECT_COLUMNS: &str = "id, table_name, row_id, operation, changed_columns, old_values, \
                              new_values, changed_at, processed, failed_at";

/// `SQLite` access to `change_log`
pub struct SqliteChangeLogRepository<'a> {
    conn: &'a Connection,
}

struct RawEntry {
    id: i64,
    table_name: String,
    row_id: i64,
    operation: String,
    changed_columns: String,
    old_values: String,
    new_values: String,
    changed_at: i64,
    processed: bool,
    failed_at: Option<i64>,
}

impl RawEntry {
    fn into_entry(self) -> Result<ChangeLogEntry> {
        Ok(ChangeLogEntry {
            id: self.id,
            table_name: self.table_name,
            row_id: self.row_id,
            operation: self.operation.parse()?,
            changed_columns: serde_json::from_str(&self.changed_columns)?,
            old_values: ValueMap::from_json(&self.old_values)?,
            new_values: ValueMap::from_json(&self.new_values)?,
            changed_at: self.changed_at,
            processed: self.processed,
            failed_at: self.failed_at,
        })
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl<'a> SqliteChangeLogRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            id: row.get(0)?,
            table_name: row.get(1)?,
            row_id: row.get(2)?,
            operation: row.get(3)?,
            changed_columns: row.get(4)?,
            old_values: row.get(5)?,
            new_values: row.get(6)?,
            changed_at: row.get(7)?,
            processed: row.get::<_, i32>(8)? != 0,
            failed_at: row.get(9)?,
        })
    }

    /// Append a captured change.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        table_name: &str,
        row_id: i64,
        operation: ChangeOperation,
        changed_columns: &[String],
        old_values: &ValueMap,
        new_values: &ValueMap,
        changed_at: i64,
    ) -> Result<ChangeLogEntry> {
        self.conn.execute(
            "INSERT INTO change_log (table_name, row_id, operation, changed_columns, old_values,
                new_values, changed_at, processed)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
            params![
                table_name,
                row_id,
                operation.as_str(),
                serde_json::to_string(changed_columns)?,
                old_values.to_json()?,
                new_values.to_json()?,
                changed_at
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("change log entry {id}")))
    }

    pub fn get(&self, id: i64) -> Result<Option<ChangeLogEntry>> {
        let raw = optional(self.conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM change_log WHERE id = ?"),
            params![id],
            Self::parse_row,
        ))?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Unprocessed, non-failed entries in capture order
    pub fn pending(&self, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM change_log
             WHERE processed = 0 AND failed_at IS NULL
             ORDER BY changed_at, id
             LIMIT ?"
        ))?;
        let raw = stmt
            .query_map(params![limit as i64], Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }

    pub fn pending_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_log WHERE processed = 0 AND failed_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count.unsigned_abs())
    }

    /// Capture time of the newest undelivered edit touching `column` of a row.
    ///
    /// Failed entries count: their edit is still not on the sheet.
    pub fn latest_undelivered_at(&self, table_name: &str, row_id: i64, column: &str) -> Result<Option<i64>> {
        let latest: Option<i64> = self.conn.query_row(
            "SELECT MAX(changed_at) FROM change_log
             WHERE table_name = ? AND row_id = ? AND processed = 0
               AND EXISTS (SELECT 1 FROM json_each(change_log.changed_columns) WHERE value = ?)",
            params![table_name, row_id, column],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    /// Mark entries processed; returns how many changed state.
    pub fn mark_processed(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE change_log SET processed = 1 WHERE processed = 0 AND id IN ({})",
            placeholders(ids.len())
        );
        Ok(self.conn.execute(&sql, params_from_iter(ids))?)
    }

    /// Exclude entries from polling until an operator requeues them.
    pub fn mark_failed(&self, ids: &[i64], failed_at: i64) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE change_log SET failed_at = ?1 WHERE processed = 0 AND id IN ({})",
            (0..ids.len())
                .map(|offset| format!("?{}", offset + 2))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut values: Vec<i64> = Vec::with_capacity(ids.len() + 1);
        values.push(failed_at);
        values.extend_from_slice(ids);
        Ok(self.conn.execute(&sql, params_from_iter(values))?)
    }

    /// Return failed entries to the poll.
    pub fn clear_failed(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE change_log SET failed_at = NULL WHERE processed = 0 AND id IN ({})",
            placeholders(ids.len())
        );
        Ok(self.conn.execute(&sql, params_from_iter(ids))?)
    }
}
