//! Coordination store kept in the shared `SQLite` database
//!
//! Every process that opens the same database file sees the same locks and
//! counters. Expiry uses wall-clock milliseconds.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::params;

use super::{CoordinationStore, WindowCount};
use crate::db::{optional, Database};
use crate::error::Result;
use crate::util::now_millis;

fn millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// Coordination store over the `coordination_*` tables
#[derive(Clone)]
pub struct SqliteCoordinationStore {
    db: Database,
}

impl SqliteCoordinationStore {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CoordinationStore for SqliteCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        self.db
            .call(|conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM coordination_locks WHERE key = ? AND expires_at <= ?",
                    params![key, now],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO coordination_locks (key, value, expires_at) VALUES (?, ?, ?)",
                    params![key, value, now + millis(ttl)],
                )?;
                tx.commit()?;
                Ok(inserted > 0)
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = now_millis();
        self.db
            .call(|conn| {
                optional(conn.query_row(
                    "SELECT value FROM coordination_locks WHERE key = ? AND expires_at > ?",
                    params![key, now],
                    |row| row.get(0),
                ))
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db
            .call(|conn| {
                conn.execute("DELETE FROM coordination_locks WHERE key = ?", params![key])?;
                Ok(())
            })
            .await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let now = now_millis();
        self.db
            .call(|conn| {
                let deleted = conn.execute(
                    "DELETE FROM coordination_locks WHERE key = ? AND value = ? AND expires_at > ?",
                    params![key, value, now],
                )?;
                Ok(deleted > 0)
            })
            .await
    }

    async fn extend_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = now_millis();
        self.db
            .call(|conn| {
                let updated = conn.execute(
                    "UPDATE coordination_locks SET expires_at = ?
                     WHERE key = ? AND value = ? AND expires_at > ?",
                    params![now + millis(ttl), key, value, now],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now = now_millis();
        let expires = now + millis(window);
        let (count, expires_at): (i64, i64) = self
            .db
            .call(|conn| {
                Ok(conn.query_row(
                    "INSERT INTO coordination_counters (key, count, expires_at) VALUES (?1, 1, ?2)
                     ON CONFLICT(key) DO UPDATE SET
                        count = CASE WHEN expires_at <= ?3 THEN 1 ELSE count + 1 END,
                        expires_at = CASE WHEN expires_at <= ?3 THEN ?2 ELSE expires_at END
                     RETURNING count, expires_at",
                    params![key, expires, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await?;

        Ok(WindowCount {
            count: count.unsigned_abs(),
            resets_in: Duration::from_millis((expires_at - now).max(0).unsigned_abs()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn locks_are_shared_between_handles() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("coordination.db");
        let first = SqliteCoordinationStore::new(Database::open(&path).unwrap());
        let second = SqliteCoordinationStore::new(Database::open(&path).unwrap());

        assert!(first
            .set_if_absent("doc:2", "to_store:a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!second
            .set_if_absent("doc:2", "to_sheet:b", Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(
            second.get("doc:2").await.unwrap().as_deref(),
            Some("to_store:a")
        );

        assert!(!second.delete_if_equals("doc:2", "to_sheet:b").await.unwrap());
        assert!(first.delete_if_equals("doc:2", "to_store:a").await.unwrap());
        assert!(second
            .set_if_absent("doc:2", "to_sheet:b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let store = SqliteCoordinationStore::new(Database::open_in_memory().unwrap());
        assert!(store
            .set_if_absent("doc:3", "a", Duration::from_millis(0))
            .await
            .unwrap());
        assert_eq!(store.get("doc:3").await.unwrap(), None);
        assert!(store
            .set_if_absent("doc:3", "b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn extend_only_touches_the_matching_live_value() {
        let store = SqliteCoordinationStore::new(Database::open_in_memory().unwrap());
        assert!(store
            .set_if_absent("doc:4", "a", Duration::from_secs(30))
            .await
            .unwrap());

        assert!(!store
            .extend_if_equals("doc:4", "b", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store
            .extend_if_equals("doc:4", "a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .extend_if_equals("doc:5", "a", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("doc:4").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn counters_accumulate_within_window() {
        let store = SqliteCoordinationStore::new(Database::open_in_memory().unwrap());
        let window = Duration::from_secs(60);

        assert_eq!(store.incr_window("sheet", window).await.unwrap().count, 1);
        let second = store.incr_window("sheet", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert!(second.resets_in <= window);

        assert_eq!(
            store
                .incr_window("expired", Duration::from_millis(0))
                .await
                .unwrap()
                .count,
            1
        );
        assert_eq!(
            store
                .incr_window("expired", Duration::from_millis(0))
                .await
                .unwrap()
                .count,
            1
        );
    }
}
