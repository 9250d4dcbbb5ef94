//! Failed delivery repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection};

use super::optional;
use crate::error::{Error, Result};
use crate::models::FailedDelivery;
use crate::util::compact_text;

const SELECT_COLUMNS: &str =
    "id, queue, partition_key, payload, error, attempts, failed_at, requeued_at";

/// `SQLite` access to `failed_deliveries`
pub struct SqliteFailedDeliveryRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteFailedDeliveryRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedDelivery> {
        Ok(FailedDelivery {
            id: row.get(0)?,
            queue: row.get(1)?,
            partition_key: row.get(2)?,
            payload: row.get(3)?,
            error: row.get(4)?,
            attempts: row.get(5)?,
            failed_at: row.get(6)?,
            requeued_at: row.get(7)?,
        })
    }

    pub fn insert(
        &self,
        queue: &str,
        partition_key: &str,
        payload: &str,
        error: &str,
        attempts: u32,
        failed_at: i64,
    ) -> Result<FailedDelivery> {
        self.conn.execute(
            "INSERT INTO failed_deliveries (queue, partition_key, payload, error, attempts, failed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                queue,
                partition_key,
                payload,
                compact_text(error),
                attempts,
                failed_at
            ],
        )?;
        self.get(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<FailedDelivery> {
        optional(self.conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM failed_deliveries WHERE id = ?"),
            params![id],
            Self::parse_row,
        ))?
        .ok_or_else(|| Error::NotFound(format!("failed delivery {id}")))
    }

    /// Newest first; requeued records only when `include_requeued` is set
    pub fn list(&self, include_requeued: bool, limit: usize) -> Result<Vec<FailedDelivery>> {
        let filter = if include_requeued {
            ""
        } else {
            "WHERE requeued_at IS NULL"
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM failed_deliveries {filter} ORDER BY failed_at DESC, id DESC LIMIT ?"
        ))?;
        let deliveries = stmt
            .query_map(params![limit as i64], Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deliveries)
    }

    pub fn open_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM failed_deliveries WHERE requeued_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count.unsigned_abs())
    }

    /// Stamp a record as requeued; fails if it already was.
    pub fn mark_requeued(&self, id: i64, requeued_at: i64) -> Result<FailedDelivery> {
        let rows = self.conn.execute(
            "UPDATE failed_deliveries SET requeued_at = ? WHERE id = ? AND requeued_at IS NULL",
            params![requeued_at, id],
        )?;
        if rows == 0 {
            // Distinguish "missing" from "already requeued".
            self.get(id)?;
            return Err(Error::InvalidInput(format!(
                "failed delivery {id} was already requeued"
            )));
        }
        self.get(id)
    }
}
