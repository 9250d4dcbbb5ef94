//! Column mapping repository

use rusqlite::{params, Connection};

use super::optional;
use crate::error::{Error, Result};
use crate::models::{ColumnMapping, DataType};

const SELECT_COLUMNS: &str = "id, document_id, sheet_name, column_index, header, column_name, \
                              data_type, deprecated, table_name";

/// Fields of a mapping about to be created
#[derive(Debug, Clone)]
pub struct NewColumnMapping<'a> {
    pub document_id: &'a str,
    pub sheet_name: &'a str,
    pub column_index: u32,
    pub header: &'a str,
    pub column_name: &'a str,
    pub data_type: DataType,
    pub table_name: &'a str,
}

/// `SQLite` access to `column_mappings`
pub struct SqliteMappingRepository<'a> {
    conn: &'a Connection,
}

struct RawMapping {
    mapping: ColumnMapping,
    data_type: String,
}

impl<'a> SqliteMappingRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMapping> {
        Ok(RawMapping {
            mapping: ColumnMapping {
                id: row.get(0)?,
                document_id: row.get(1)?,
                sheet_name: row.get(2)?,
                column_index: row.get(3)?,
                header: row.get(4)?,
                column_name: row.get(5)?,
                data_type: DataType::Text,
                deprecated: row.get::<_, i32>(7)? != 0,
                table_name: row.get(8)?,
            },
            data_type: row.get(6)?,
        })
    }

    fn finish(raw: RawMapping) -> Result<ColumnMapping> {
        let mut mapping = raw.mapping;
        mapping.data_type = raw.data_type.parse()?;
        Ok(mapping)
    }

    fn query(&self, filter: &str, params: impl rusqlite::Params) -> Result<Vec<ColumnMapping>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM column_mappings WHERE {filter} ORDER BY column_index"
        ))?;
        let raw = stmt
            .query_map(params, Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(Self::finish).collect()
    }

    pub fn get(
        &self,
        document_id: &str,
        sheet_name: &str,
        column_index: u32,
    ) -> Result<Option<ColumnMapping>> {
        let raw = optional(self.conn.query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM column_mappings
                 WHERE document_id = ? AND sheet_name = ? AND column_index = ?"
            ),
            params![document_id, sheet_name, column_index],
            Self::parse_row,
        ))?;
        raw.map(Self::finish).transpose()
    }

    pub fn get_by_id(&self, id: i64) -> Result<ColumnMapping> {
        let raw = optional(self.conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM column_mappings WHERE id = ?"),
            params![id],
            Self::parse_row,
        ))?;
        raw.map(Self::finish)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("column mapping {id}")))
    }

    /// Every mapping of a tab, deprecated ones included, by column index
    pub fn list(&self, document_id: &str, sheet_name: &str) -> Result<Vec<ColumnMapping>> {
        self.query(
            "document_id = ? AND sheet_name = ?",
            params![document_id, sheet_name],
        )
    }

    pub fn list_active(&self, document_id: &str, sheet_name: &str) -> Result<Vec<ColumnMapping>> {
        self.query(
            "document_id = ? AND sheet_name = ? AND deprecated = 0",
            params![document_id, sheet_name],
        )
    }

    pub fn column_name_taken(&self, table_name: &str, column_name: &str) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM column_mappings WHERE table_name = ? AND column_name = ?)",
            params![table_name, column_name],
            |row| row.get(0),
        )?)
    }

    pub fn insert(&self, new: &NewColumnMapping<'_>, now: i64) -> Result<ColumnMapping> {
        self.conn.execute(
            "INSERT INTO column_mappings (document_id, sheet_name, column_index, header, column_name,
                data_type, deprecated, table_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
            params![
                new.document_id,
                new.sheet_name,
                new.column_index,
                new.header,
                new.column_name,
                new.data_type.as_str(),
                new.table_name,
                now,
                now
            ],
        )?;
        self.get_by_id(self.conn.last_insert_rowid())
    }

    /// Move a TEXT column to a specific type.
    ///
    /// Returns `false` when the column already left TEXT; the first upgrade wins.
    pub fn upgrade_type(&self, id: i64, data_type: DataType, now: i64) -> Result<bool> {
        if data_type.is_text() {
            return Ok(false);
        }
        let rows = self.conn.execute(
            "UPDATE column_mappings SET data_type = ?, updated_at = ?
             WHERE id = ? AND data_type = 'TEXT'",
            params![data_type.as_str(), now, id],
        )?;
        Ok(rows > 0)
    }

    pub fn update_header(&self, id: i64, header: &str, now: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE column_mappings SET header = ?, updated_at = ? WHERE id = ? AND header <> ?",
            params![header, now, id, header],
        )?;
        Ok(())
    }

    /// Returns `false` when the mapping was already deprecated.
    pub fn deprecate(&self, id: i64, now: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE column_mappings SET deprecated = 1, updated_at = ? WHERE id = ? AND deprecated = 0",
            params![now, id],
        )?;
        Ok(rows > 0)
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

    fn price_mapping(index: u32, column_name: &str) -> NewColumnMapping<'_> {
        NewColumnMapping {
            document_id: "doc",
            sheet_name: "Orders",
            column_index: index,
            header: "Price",
            column_name,
            data_type: DataType::Text,
            table_name: "sheet_doc_orders",
        }
    }

    #[test]
    fn insert_and_lookup() {
        let conn = setup();
        let repo = SqliteMappingRepository::new(&conn);

        let created = repo.insert(&price_mapping(2, "price"), 1).unwrap();
        let found = repo.get("doc", "Orders", 2).unwrap().unwrap();
        assert_eq!(created, found);
        assert!(repo.column_name_taken("sheet_doc_orders", "price").unwrap());
        assert!(!repo.column_name_taken("sheet_other", "price").unwrap());
        assert!(repo.get("doc", "Orders", 3).unwrap().is_none());
    }

    #[test]
    fn upgrade_type_is_one_way() {
        let conn = setup();
        let repo = SqliteMappingRepository::new(&conn);
        let mapping = repo.insert(&price_mapping(2, "price"), 1).unwrap();

        assert!(repo.upgrade_type(mapping.id, DataType::Number, 2).unwrap());
        assert!(!repo.upgrade_type(mapping.id, DataType::Date, 3).unwrap());
        assert!(!repo.upgrade_type(mapping.id, DataType::Text, 4).unwrap());
        assert_eq!(repo.get_by_id(mapping.id).unwrap().data_type, DataType::Number);
    }

    #[test]
    fn deprecated_mappings_leave_the_active_set() {
        let conn = setup();
        let repo = SqliteMappingRepository::new(&conn);
        let price = repo.insert(&price_mapping(2, "price"), 1).unwrap();
        repo.insert(&price_mapping(3, "price_1"), 1).unwrap();

        assert!(repo.deprecate(price.id, 5).unwrap());
        assert!(!repo.deprecate(price.id, 6).unwrap());

        let active = repo.list_active("doc", "Orders").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].column_name, "price_1");
        assert_eq!(repo.list("doc", "Orders").unwrap().len(), 2);
    }
}
