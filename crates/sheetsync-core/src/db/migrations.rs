//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &mut Connection, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;
    Ok(())
}

/// Migration to version 1: sync metadata
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Registered spreadsheet tabs
        "CREATE TABLE IF NOT EXISTS synced_documents (
            document_id TEXT NOT NULL,
            sheet_name TEXT NOT NULL,
            table_name TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_synced_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (document_id, sheet_name)
        )",
        // Spreadsheet column -> physical column
        "CREATE TABLE IF NOT EXISTS column_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            sheet_name TEXT NOT NULL,
            column_index INTEGER NOT NULL,
            header TEXT NOT NULL,
            column_name TEXT NOT NULL,
            data_type TEXT NOT NULL DEFAULT 'TEXT',
            deprecated INTEGER NOT NULL DEFAULT 0,
            table_name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (document_id, sheet_name, column_index),
            UNIQUE (table_name, column_name)
        )",
        // Type upgrades are one-way and deprecation is terminal
        "CREATE TRIGGER IF NOT EXISTS column_mappings_one_way BEFORE UPDATE ON column_mappings
         FOR EACH ROW
         WHEN (OLD.data_type <> 'TEXT' AND NEW.data_type <> OLD.data_type)
           OR (OLD.deprecated = 1 AND NEW.deprecated = 0)
         BEGIN
             SELECT RAISE(ABORT, 'column mapping transitions are one-way');
         END",
        // Store-side changes awaiting delivery
        "CREATE TABLE IF NOT EXISTS change_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            row_id INTEGER NOT NULL,
            operation TEXT NOT NULL,
            changed_columns TEXT NOT NULL,
            old_values TEXT NOT NULL,
            new_values TEXT NOT NULL,
            changed_at INTEGER NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            failed_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_change_log_pending ON change_log(processed, changed_at)",
        // Conflict audit trail
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            row_number INTEGER NOT NULL,
            column_name TEXT NOT NULL,
            external_value TEXT NOT NULL,
            external_updated_at INTEGER NOT NULL,
            store_value TEXT NOT NULL,
            store_updated_at INTEGER NOT NULL,
            resolution TEXT NOT NULL DEFAULT 'PENDING',
            created_at INTEGER NOT NULL,
            resolved_at INTEGER,
            resolved_by TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_row ON sync_conflicts(document_id, row_number)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolution ON sync_conflicts(resolution)",
        "CREATE TRIGGER IF NOT EXISTS sync_conflicts_immutable BEFORE UPDATE OF
            document_id, row_number, column_name, external_value, external_updated_at,
            store_value, store_updated_at, created_at
         ON sync_conflicts
         BEGIN
             SELECT RAISE(ABORT, 'sync conflicts are immutable');
         END",
        // Dead letters of both dispatch queues
        "CREATE TABLE IF NOT EXISTS failed_deliveries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            error TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            failed_at INTEGER NOT NULL,
            requeued_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_failed_deliveries_open ON failed_deliveries(requeued_at, failed_at DESC)",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: shared coordination store
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS coordination_locks (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS coordination_counters (
            key TEXT PRIMARY KEY,
            count INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
