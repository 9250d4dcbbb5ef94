//! Synced document repository

use rusqlite::{params, Connection};

use super::optional;
use crate::error::{Error, Result};
use crate::models::SyncedDocument;
use crate::util::compact_text;

const SELECT_COLUMNS: &str =
    "document_id, sheet_name, table_name, enabled, last_synced_at, last_error, created_at";

/// `SQLite` access to `synced_documents`
pub struct SqliteDocumentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDocumentRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncedDocument> {
        Ok(SyncedDocument {
            document_id: row.get(0)?,
            sheet_name: row.get(1)?,
            table_name: row.get(2)?,
            enabled: row.get::<_, i32>(3)? != 0,
            last_synced_at: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    pub fn get(&self, document_id: &str, sheet_name: &str) -> Result<Option<SyncedDocument>> {
        optional(self.conn.query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM synced_documents WHERE document_id = ? AND sheet_name = ?"
            ),
            params![document_id, sheet_name],
            Self::parse_document,
        ))
    }

    pub fn get_by_table(&self, table_name: &str) -> Result<Option<SyncedDocument>> {
        optional(self.conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM synced_documents WHERE table_name = ?"),
            params![table_name],
            Self::parse_document,
        ))
    }

    pub fn table_name_taken(&self, table_name: &str) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM synced_documents WHERE table_name = ?)",
            params![table_name],
            |row| row.get(0),
        )?)
    }

    /// Insert unless the (document, sheet) pair is already registered.
    ///
    /// Returns the stored registration either way.
    pub fn insert_if_absent(
        &self,
        document_id: &str,
        sheet_name: &str,
        table_name: &str,
        created_at: i64,
    ) -> Result<SyncedDocument> {
        self.conn.execute(
            "INSERT OR IGNORE INTO synced_documents (document_id, sheet_name, table_name, enabled, created_at)
             VALUES (?, ?, ?, 1, ?)",
            params![document_id, sheet_name, table_name, created_at],
        )?;
        self.get(document_id, sheet_name)?
            .ok_or_else(|| Error::NotFound(format!("document {document_id}/{sheet_name}")))
    }

    /// All registered documents, oldest first
    pub fn list(&self) -> Result<Vec<SyncedDocument>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM synced_documents ORDER BY created_at, document_id, sheet_name"
        ))?;
        let documents = stmt
            .query_map([], Self::parse_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(documents)
    }

    pub fn set_enabled(&self, document_id: &str, sheet_name: &str, enabled: bool) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE synced_documents SET enabled = ? WHERE document_id = ? AND sheet_name = ?",
            params![i32::from(enabled), document_id, sheet_name],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("document {document_id}/{sheet_name}")));
        }
        Ok(())
    }

    /// Stamp a successful pipeline outcome and clear the last error.
    pub fn record_success(&self, table_name: &str, at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE synced_documents SET last_synced_at = ?, last_error = NULL WHERE table_name = ?",
            params![at, table_name],
        )?;
        Ok(())
    }

    pub fn record_error(&self, table_name: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE synced_documents SET last_error = ? WHERE table_name = ?",
            params![compact_text(error), table_name],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrations::run(&mut conn).unwrap();
        conn
    }

    #[test]
    fn insert_if_absent_is_idempotent() {
        let conn = setup();
        let repo = SqliteDocumentRepository::new(&conn);

        let first = repo.insert_if_absent("doc", "Orders", "sheet_doc_orders", 10).unwrap();
        let second = repo.insert_if_absent("doc", "Orders", "ignored", 20).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.table_name, "sheet_doc_orders");
        assert!(second.enabled);
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn record_outcomes_update_status() {
        let conn = setup();
        let repo = SqliteDocumentRepository::new(&conn);
        repo.insert_if_absent("doc", "Orders", "sheet_doc_orders", 10).unwrap();

        repo.record_error("sheet_doc_orders", "quota exceeded").unwrap();
        let doc = repo.get_by_table("sheet_doc_orders").unwrap().unwrap();
        assert_eq!(doc.last_error.as_deref(), Some("quota exceeded"));

        repo.record_success("sheet_doc_orders", 99).unwrap();
        let doc = repo.get("doc", "Orders").unwrap().unwrap();
        assert_eq!(doc.last_synced_at, Some(99));
        assert_eq!(doc.last_error, None);
    }

    #[test]
    fn set_enabled_unknown_document_is_not_found() {
        let conn = setup();
        let repo = SqliteDocumentRepository::new(&conn);
        assert!(matches!(
            repo.set_enabled("missing", "Sheet1", false),
            Err(Error::NotFound(_))
        ));
    }
}
