//! Database layer for sheetsync
//!
//! Metadata tables are managed through versioned migrations; the per-document
//! row tables are created and widened at runtime by the schema registry.

mod change_log_repository;
mod connection;
mod conflict_repository;
mod document_repository;
mod failed_repository;
mod mapping_repository;
mod migrations;
mod row_repository;

pub use change_log_repository::SqliteChangeLogRepository;
pub use connection::Database;
pub use conflict_repository::{NewConflict, SqliteConflictRepository};
pub use document_repository::SqliteDocumentRepository;
pub use failed_repository::SqliteFailedDeliveryRepository;
pub use mapping_repository::{NewColumnMapping, SqliteMappingRepository};
pub(crate) use migrations::run as run_migrations;
pub use row_repository::{
    add_row_table_column, create_row_table, row_table_columns, RowWrite, SqliteRowRepository,
    WriteOutcome,
};

/// Map `QueryReturnedNoRows` to `None`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> crate::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
