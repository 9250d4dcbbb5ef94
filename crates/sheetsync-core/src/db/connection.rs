//! Database connection management

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;

use super::migrations;
use crate::error::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the SQLite store
///
/// Cloning is cheap; every clone serializes access through the same
/// connection. Repositories borrow the connection inside [`Database::call`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&path)?;
        Self::configure(&conn)?;
        migrations::run(&mut conn)?;
        tracing::debug!(path = %path.display(), "Opened sheetsync database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Configure `SQLite` for concurrent readers and a shared file
    fn configure(conn: &Connection) -> Result<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// Keep `f` to one statement or one short transaction; other callers
    /// queue on the connection meanwhile.
    pub async fn call<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().await;
        // SQLite blocks; hand the worker's other tasks off while it runs.
        // block_in_place is unavailable on the current-thread runtime.
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| f(&mut conn)),
            _ => f(&mut conn),
        }
    }

    /// Filesystem path, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());

        let value = db
            .call(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_open_file_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("sheetsync.db");

        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(path.exists());

        // A second handle on the same file sees the migrated schema.
        let other = Database::open(&path).unwrap();
        let tables = other
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'change_log'",
                    [],
                    |row| row.get::<_, i64>(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn calls_run_on_the_multi_thread_runtime() {
        let db = Database::open_in_memory().unwrap();
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let db = db.clone();
                tokio::spawn(async move {
                    db.call(|conn| {
                        conn.execute(
                            "INSERT INTO coordination_locks (key, value, expires_at) VALUES (?1, 'v', 0)",
                            [format!("k{i}")],
                        )?;
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let count = db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM coordination_locks", [], |row| {
                    row.get::<_, i64>(0)
                })?)
            })
            .await
            .unwrap();
        assert_eq!(count, 4);
    }
}
