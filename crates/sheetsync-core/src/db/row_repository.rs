//! Dynamic row tables
//!
//! Every registered tab owns one table with fixed `_`-prefixed metadata
//! columns and one nullable column per active mapping. Dynamic column names
//! come from the sanitizer and are always quoted.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use rusqlite::types::ToSql;
use rusqlite::{params, Connection};

use super::{optional, SqliteChangeLogRepository};
use crate::error::{Error, Result};
use crate::models::{
    CellValue, ChangeLogEntry, ChangeOperation, ColumnMapping, Origin, RowMetadata, SyncStatus,
    SyncedRow, ValueMap,
};
use crate::schema::quote_identifier;

const METADATA_SELECT: &str = "_id, _row_number, _content_hash, _last_modified_at, \
                               _last_modified_by, _sync_status, _synced_values";
const METADATA_WIDTH: usize = 7;

/// Create a row table with only the metadata columns (idempotent).
pub fn create_row_table(conn: &Connection, table_name: &str) -> Result<()> {
    let table = quote_identifier(table_name);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            _row_number INTEGER NOT NULL UNIQUE,
            _content_hash TEXT,
            _synced_values TEXT NOT NULL DEFAULT '{{\"version\":1,\"values\":{{}}}}',
            _last_modified_at INTEGER NOT NULL DEFAULT 0,
            _last_modified_by TEXT NOT NULL DEFAULT 'SYSTEM',
            _sync_status TEXT NOT NULL DEFAULT 'PENDING'
        );"
    ))?;
    Ok(())
}

/// Physical column names of a row table, in declaration order
pub fn row_table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "PRAGMA table_info({})",
        quote_identifier(table_name)
    ))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Add a nullable column; a concurrent add of the same column counts as success.
///
/// Returns `true` when this call created the column.
pub fn add_row_table_column(
    conn: &Connection,
    table_name: &str,
    column_name: &str,
    sql_type: &str,
) -> Result<bool> {
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {sql_type}",
        quote_identifier(table_name),
        quote_identifier(column_name)
    );
    match conn.execute(&sql, []) {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(_, Some(message)))
            if message.contains("duplicate column name") =>
        {
            Ok(false)
        }
        Err(e) => Err(Error::Schema(format!(
            "adding column {column_name} to {table_name}: {e}"
        ))),
    }
}

/// A compare-and-set write of row values and sync metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub internal_id: i64,
    /// `_last_modified_at` as read during evaluation
    pub expected_modified_at: i64,
    /// `_content_hash` as read during evaluation
    pub expected_hash: Option<String>,
    /// Physical column values to write (may be empty)
    pub values: BTreeMap<String, CellValue>,
    /// Full synchronized snapshot covered by `content_hash`
    pub synced_values: BTreeMap<String, CellValue>,
    pub content_hash: String,
    pub modified_at: i64,
    pub modified_by: Origin,
    pub status: SyncStatus,
}

/// Result of a compare-and-set row write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Another writer changed the row's metadata after it was read
    Superseded,
}

struct RawRow {
    internal_id: i64,
    row_number: u32,
    content_hash: Option<String>,
    last_modified_at: i64,
    last_modified_by: String,
    sync_status: String,
    synced_values: String,
    values: BTreeMap<String, CellValue>,
}

impl RawRow {
    fn into_row(self) -> Result<SyncedRow> {
        Ok(SyncedRow {
            meta: RowMetadata {
                internal_id: self.internal_id,
                row_number: self.row_number,
                content_hash: self.content_hash,
                last_modified_at: self.last_modified_at,
                last_modified_by: self.last_modified_by.parse()?,
                sync_status: self.sync_status.parse()?,
            },
            values: self.values,
            synced_values: ValueMap::from_json(&self.synced_values)?.values,
        })
    }
}

/// `SQLite` access to one dynamic row table
pub struct SqliteRowRepository<'a> {
    conn: &'a Connection,
    table_name: &'a str,
}

impl<'a> SqliteRowRepository<'a> {
    pub const fn new(conn: &'a Connection, table_name: &'a str) -> Self {
        Self { conn, table_name }
    }

    fn select_one(
        &self,
        filter: &str,
        key: i64,
        mappings: &[ColumnMapping],
    ) -> Result<Option<SyncedRow>> {
        // Mapped columns missing on the table (mapping written, ALTER not yet
        // applied) read as null.
        let physical = row_table_columns(self.conn, self.table_name)?;
        let present: Vec<&ColumnMapping> = mappings
            .iter()
            .filter(|mapping| physical.contains(&mapping.column_name))
            .collect();

        let mut sql = format!("SELECT {METADATA_SELECT}");
        for mapping in &present {
            let _ = write!(sql, ", {}", quote_identifier(&mapping.column_name));
        }
        let _ = write!(
            sql,
            " FROM {} WHERE {filter} = ?",
            quote_identifier(self.table_name)
        );

        let raw = optional(self.conn.query_row(&sql, params![key], |row| {
            let mut values = BTreeMap::new();
            for (offset, mapping) in present.iter().enumerate() {
                let value = CellValue::from_sql(row.get_ref(METADATA_WIDTH + offset)?, mapping.data_type);
                values.insert(mapping.column_name.clone(), value);
            }
            Ok(RawRow {
                internal_id: row.get(0)?,
                row_number: row.get(1)?,
                content_hash: row.get(2)?,
                last_modified_at: row.get(3)?,
                last_modified_by: row.get(4)?,
                sync_status: row.get(5)?,
                synced_values: row.get(6)?,
                values,
            })
        }))?;
        raw.map(RawRow::into_row).transpose()
    }

    pub fn get_by_number(
        &self,
        row_number: u32,
        mappings: &[ColumnMapping],
    ) -> Result<Option<SyncedRow>> {
        self.select_one("_row_number", i64::from(row_number), mappings)
    }

    pub fn get_by_id(&self, internal_id: i64, mappings: &[ColumnMapping]) -> Result<Option<SyncedRow>> {
        self.select_one("_id", internal_id, mappings)
    }

    /// Fetch a row, creating it with SYSTEM origin on first sight.
    pub fn get_or_create(&self, row_number: u32, mappings: &[ColumnMapping]) -> Result<SyncedRow> {
        self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (_row_number, _last_modified_at, _last_modified_by, _sync_status)
                 VALUES (?, 0, ?, ?)",
                quote_identifier(self.table_name)
            ),
            params![
                row_number,
                Origin::System.as_str(),
                SyncStatus::Pending.as_str()
            ],
        )?;
        self.get_by_number(row_number, mappings)?
            .ok_or_else(|| Error::NotFound(format!("row {row_number} in {}", self.table_name)))
    }

    /// Write values and metadata if the row still carries the expected metadata.
    pub fn apply(&self, write: &RowWrite) -> Result<WriteOutcome> {
        let synced_json = ValueMap::new(write.synced_values.clone()).to_json()?;

        let mut sql = format!("UPDATE {} SET ", quote_identifier(self.table_name));
        let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(write.values.len() + 8);
        for (column, value) in &write.values {
            let _ = write!(sql, "{} = ?, ", quote_identifier(column));
            bound.push(value);
        }
        sql.push_str(
            "_content_hash = ?, _synced_values = ?, _last_modified_at = ?, \
             _last_modified_by = ?, _sync_status = ? \
             WHERE _id = ? AND _last_modified_at = ? AND _content_hash IS ?",
        );
        let modified_by = write.modified_by.as_str();
        let status = write.status.as_str();
        bound.push(&write.content_hash);
        bound.push(&synced_json);
        bound.push(&write.modified_at);
        bound.push(&modified_by);
        bound.push(&status);
        bound.push(&write.internal_id);
        bound.push(&write.expected_modified_at);
        bound.push(&write.expected_hash);

        let rows = self.conn.execute(&sql, bound.as_slice())?;
        Ok(if rows == 0 {
            WriteOutcome::Superseded
        } else {
            WriteOutcome::Written
        })
    }

    /// Flag a row without touching values, hash or timestamps.
    pub fn set_status(&self, internal_id: i64, status: SyncStatus) -> Result<()> {
        self.conn.execute(
            &format!(
                "UPDATE {} SET _sync_status = ? WHERE _id = ?",
                quote_identifier(self.table_name)
            ),
            params![status.as_str(), internal_id],
        )?;
        Ok(())
    }

    /// Write a store-side edit and append its change log entry atomically.
    ///
    /// Sync metadata is left alone: it describes the last synchronized write
    /// and only moves once the edit is delivered. Returns `None` when no
    /// edited value differs from the stored one.
    pub fn write_store_edit(
        &self,
        row_number: u32,
        edits: &BTreeMap<String, CellValue>,
        mappings: &[ColumnMapping],
        changed_at: i64,
    ) -> Result<Option<ChangeLogEntry>> {
        if let Some(unknown) = edits
            .keys()
            .find(|column| !mappings.iter().any(|m| &m.column_name == *column))
        {
            return Err(Error::InvalidInput(format!(
                "column {unknown} is not an active column of {}",
                self.table_name
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        let existing = self.get_by_number(row_number, mappings)?;
        let operation = if existing.is_some() {
            ChangeOperation::Update
        } else {
            ChangeOperation::Insert
        };
        let row = match existing {
            Some(row) => row,
            None => self.get_or_create(row_number, mappings)?,
        };

        let changed: BTreeMap<String, CellValue> = edits
            .iter()
            .filter(|(column, value)| {
                operation == ChangeOperation::Insert || row.value(column) != **value
            })
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        if changed.is_empty() {
            return Ok(None);
        }

        let mut sql = format!("UPDATE {} SET ", quote_identifier(self.table_name));
        let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(changed.len() + 2);
        for (column, value) in &changed {
            let _ = write!(sql, "{} = ?, ", quote_identifier(column));
            bound.push(value);
        }
        sql.push_str("_sync_status = ? WHERE _id = ?");
        let status = SyncStatus::Pending.as_str();
        bound.push(&status);
        bound.push(&row.meta.internal_id);
        tx.execute(&sql, bound.as_slice())?;

        let old_values: BTreeMap<String, CellValue> = changed
            .keys()
            .map(|column| (column.clone(), row.value(column)))
            .collect();
        let changed_columns: Vec<String> = changed.keys().cloned().collect();
        let entry = SqliteChangeLogRepository::new(self.conn).append(
            self.table_name,
            row.meta.internal_id,
            operation,
            &changed_columns,
            &ValueMap::new(old_values),
            &ValueMap::new(changed),
            changed_at,
        )?;

        tx.commit()?;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;
    use crate::models::DataType;
    use pretty_assertions::assert_eq;

    const TABLE: &str = "sheet_doc_orders";

    fn mapping(index: u32, column_name: &str, data_type: DataType) -> ColumnMapping {
        ColumnMapping {
            id: i64::from(index),
            document_id: "doc".to_string(),
            sheet_name: "Orders".to_string(),
            column_index: index,
            header: column_name.to_string(),
            column_name: column_name.to_string(),
            data_type,
            deprecated: false,
            table_name: TABLE.to_string(),
        }
    }

    fn setup() -> (Connection, Vec<ColumnMapping>) {
        let mut conn = Connection::open_in_memory().unwrap();
        migrations::run(&mut conn).unwrap();
        create_row_table(&conn, TABLE).unwrap();
        add_row_table_column(&conn, TABLE, "item", "TEXT").unwrap();
        add_row_table_column(&conn, TABLE, "price", "REAL").unwrap();
        let mappings = vec![
            mapping(1, "item", DataType::Text),
            mapping(2, "price", DataType::Number),
        ];
        (conn, mappings)
    }

    #[test]
    fn create_and_widen_table() {
        let (conn, _) = setup();
        create_row_table(&conn, TABLE).unwrap();

        assert!(!add_row_table_column(&conn, TABLE, "price", "REAL").unwrap());
        let columns = row_table_columns(&conn, TABLE).unwrap();
        assert!(columns.contains(&"_row_number".to_string()));
        assert!(columns.contains(&"price".to_string()));
    }

    #[test]
    fn get_or_create_stamps_system_origin() {
        let (conn, mappings) = setup();
        let repo = SqliteRowRepository::new(&conn, TABLE);

        let row = repo.get_or_create(3, &mappings).unwrap();
        assert_eq!(row.meta.row_number, 3);
        assert_eq!(row.meta.last_modified_by, Origin::System);
        assert_eq!(row.meta.last_modified_at, 0);
        assert_eq!(row.meta.content_hash, None);
        assert_eq!(row.value("price"), CellValue::Null);

        let again = repo.get_or_create(3, &mappings).unwrap();
        assert_eq!(again.meta.internal_id, row.meta.internal_id);
    }

    #[test]
    fn unmapped_physical_column_reads_as_null() {
        let (conn, mut mappings) = setup();
        mappings.push(mapping(3, "qty", DataType::Number));
        let repo = SqliteRowRepository::new(&conn, TABLE);

        let row = repo.get_or_create(2, &mappings).unwrap();
        assert_eq!(row.value("qty"), CellValue::Null);
    }

    #[test]
    fn apply_is_compare_and_set() {
        let (conn, mappings) = setup();
        let repo = SqliteRowRepository::new(&conn, TABLE);
        let row = repo.get_or_create(2, &mappings).unwrap();

        let mut values = BTreeMap::new();
        values.insert("price".to_string(), CellValue::Number(4.5));
        let write = RowWrite {
            internal_id: row.meta.internal_id,
            expected_modified_at: row.meta.last_modified_at,
            expected_hash: row.meta.content_hash.clone(),
            values: values.clone(),
            synced_values: values,
            content_hash: "abc".to_string(),
            modified_at: 1_000,
            modified_by: Origin::External,
            status: SyncStatus::Synced,
        };

        assert_eq!(repo.apply(&write).unwrap(), WriteOutcome::Written);
        // Same expectations again: metadata has moved on.
        assert_eq!(repo.apply(&write).unwrap(), WriteOutcome::Superseded);

        let stored = repo.get_by_number(2, &mappings).unwrap().unwrap();
        assert_eq!(stored.value("price"), CellValue::Number(4.5));
        assert_eq!(stored.synced_value("price"), CellValue::Number(4.5));
        assert_eq!(stored.meta.content_hash.as_deref(), Some("abc"));
        assert_eq!(stored.meta.last_modified_by, Origin::External);
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn store_edit_logs_change_and_keeps_sync_metadata() {
        let (conn, mappings) = setup();
        let repo = SqliteRowRepository::new(&conn, TABLE);

        let mut edits = BTreeMap::new();
        edits.insert("price".to_string(), CellValue::Number(7.0));
        let entry = repo
            .write_store_edit(5, &edits, &mappings, 2_000)
            .unwrap()
            .unwrap();
        assert_eq!(entry.operation, ChangeOperation::Insert);
        assert_eq!(entry.changed_columns, vec!["price".to_string()]);
        assert_eq!(entry.old_values.values.get("price"), Some(&CellValue::Null));

        let row = repo.get_by_number(5, &mappings).unwrap().unwrap();
        assert_eq!(row.value("price"), CellValue::Number(7.0));
        assert_eq!(row.meta.last_modified_at, 0);
        assert_eq!(row.meta.sync_status, SyncStatus::Pending);
        assert!(row.synced_values.is_empty());

        // Writing the same value again is not a change.
        assert!(repo.write_store_edit(5, &edits, &mappings, 3_000).unwrap().is_none());

        edits.insert("price".to_string(), CellValue::Number(8.0));
        let entry = repo
            .write_store_edit(5, &edits, &mappings, 4_000)
            .unwrap()
            .unwrap();
        assert_eq!(entry.operation, ChangeOperation::Update);
        assert_eq!(
            entry.old_values.values.get("price"),
            Some(&CellValue::Number(7.0))
        );
    }

    #[test]
    fn store_edit_rejects_unknown_columns() {
        let (conn, mappings) = setup();
        let repo = SqliteRowRepository::new(&conn, TABLE);

        let mut edits = BTreeMap::new();
        edits.insert("missing".to_string(), CellValue::Text("x".into()));
        assert!(matches!(
            repo.write_store_edit(5, &edits, &mappings, 2_000),
            Err(Error::InvalidInput(_))
        ));
    }
}
