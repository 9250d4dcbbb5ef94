//! Sync conflict repository
//!
//! Conflict records are append-only; the only mutation is an operator
//! setting the resolution of a pending record.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection};

use super::optional;
use crate::error::{Error, Result};
use crate::models::{CellValue, Resolution, SyncConflict};

const SELECT_COLUMNS: &str = "id, document_id, row_number, column_name, external_value, \
                              external_updated_at, store_value, store_updated_at, resolution, \
                              created_at, resolved_at, resolved_by";

/// Fields of a conflict detected by the LWW arbiter
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub document_id: String,
    pub row_number: u32,
    pub column_name: String,
    pub external_value: CellValue,
    pub external_updated_at: i64,
    pub store_value: CellValue,
    pub store_updated_at: i64,
}

/// `SQLite` access to `sync_conflicts`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

struct RawConflict {
    conflict: SyncConflict,
    external_value: String,
    store_value: String,
    resolution: String,
}

impl RawConflict {
    fn into_conflict(self) -> Result<SyncConflict> {
        let mut conflict = self.conflict;
        conflict.external_value = serde_json::from_str(&self.external_value)?;
        conflict.store_value = serde_json::from_str(&self.store_value)?;
        conflict.resolution = self.resolution.parse()?;
        Ok(conflict)
    }
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConflict> {
        Ok(RawConflict {
            conflict: SyncConflict {
                id: row.get(0)?,
                document_id: row.get(1)?,
                row_number: row.get(2)?,
                column_name: row.get(3)?,
                external_value: CellValue::Null,
                external_updated_at: row.get(5)?,
                store_value: CellValue::Null,
                store_updated_at: row.get(7)?,
                resolution: Resolution::Pending,
                created_at: row.get(9)?,
                resolved_at: row.get(10)?,
                resolved_by: row.get(11)?,
            },
            external_value: row.get(4)?,
            store_value: row.get(6)?,
            resolution: row.get(8)?,
        })
    }

    pub fn insert(&self, new: &NewConflict, created_at: i64) -> Result<SyncConflict> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (document_id, row_number, column_name, external_value,
                external_updated_at, store_value, store_updated_at, resolution, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'PENDING', ?)",
            params![
                new.document_id,
                new.row_number,
                new.column_name,
                serde_json::to_string(&new.external_value)?,
                new.external_updated_at,
                serde_json::to_string(&new.store_value)?,
                new.store_updated_at,
                created_at
            ],
        )?;
        self.get(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<SyncConflict> {
        let raw = optional(self.conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
            params![id],
            Self::parse_row,
        ))?;
        raw.map(RawConflict::into_conflict)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))
    }

    /// Newest first
    pub fn list(&self, pending_only: bool, limit: usize) -> Result<Vec<SyncConflict>> {
        let filter = if pending_only {
            "WHERE resolution = 'PENDING'"
        } else {
            ""
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_conflicts {filter} ORDER BY created_at DESC, id DESC LIMIT ?"
        ))?;
        let raw = stmt
            .query_map(params![limit as i64], Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawConflict::into_conflict).collect()
    }

    pub fn pending_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE resolution = 'PENDING'",
            [],
            |row| row.get(0),
        )?;
        Ok(count.unsigned_abs())
    }

    /// Record an operator's decision on a pending conflict.
    pub fn resolve(
        &self,
        id: i64,
        resolution: Resolution,
        resolved_by: Option<&str>,
        resolved_at: i64,
    ) -> Result<SyncConflict> {
        if resolution == Resolution::Pending {
            return Err(Error::InvalidInput(
                "a conflict cannot be resolved as PENDING".to_string(),
            ));
        }

        let rows = self.conn.execute(
            "UPDATE sync_conflicts SET resolution = ?, resolved_at = ?, resolved_by = ?
             WHERE id = ? AND resolution = 'PENDING'",
            params![resolution.as_str(), resolved_at, resolved_by, id],
        )?;
        if rows == 0 {
            let existing = self.get(id)?;
            return Err(Error::InvalidInput(format!(
                "conflict {id} is already resolved as {}",
                existing.resolution
            )));
        }
        self.get(id)
    }
}
