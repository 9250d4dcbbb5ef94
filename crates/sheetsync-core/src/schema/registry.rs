//! Schema registry and dynamic table manager
//!
//! Maps spreadsheet columns to physical columns and evolves the backing
//! tables as the column set changes. Columns only ever gain a type (TEXT to
//! something specific) or become deprecated; nothing is dropped.

use rusqlite::Connection;
use serde_json::Value;

use super::sanitize::{sanitize, unique_identifier};
use super::types::{infer_type, value_text};
use crate::db::{
    add_row_table_column, create_row_table, row_table_columns, NewColumnMapping,
    SqliteDocumentRepository, SqliteMappingRepository,
};
use crate::error::{Error, Result};
use crate::models::{ColumnMapping, DataType, SyncedDocument};

/// Longest sanitized document id kept in a derived table name
const DOCUMENT_PART_LEN: usize = 24;

/// The mapping a data edit resolves to, before anything is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    pub column_index: u32,
    pub column_name: String,
    pub header: String,
    /// Stored type, or the type the sample would upgrade a TEXT column to
    pub data_type: DataType,
    pub deprecated: bool,
    /// The stored mapping, if the column is already known
    pub registered: Option<ColumnMapping>,
}

/// Deterministic table name for a tab, before collision handling
pub fn derive_table_name(document_id: &str, sheet_name: &str) -> String {
    let mut document_part = sanitize(document_id);
    document_part.truncate(DOCUMENT_PART_LEN);
    sanitize(&format!(
        "sheet_{}_{}",
        document_part.trim_end_matches('_'),
        sanitize(sheet_name)
    ))
}

/// Schema operations over a borrowed connection
pub struct SchemaRegistry<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaRegistry<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn documents(&self) -> SqliteDocumentRepository<'a> {
        SqliteDocumentRepository::new(self.conn)
    }

    fn mappings(&self) -> SqliteMappingRepository<'a> {
        SqliteMappingRepository::new(self.conn)
    }

    /// Register a tab and create its backing table; idempotent.
    pub fn ensure_document_registered(
        &self,
        document_id: &str,
        sheet_name: &str,
        now: i64,
    ) -> Result<SyncedDocument> {
        let documents = self.documents();
        if let Some(existing) = documents.get(document_id, sheet_name)? {
            create_row_table(self.conn, &existing.table_name)?;
            return Ok(existing);
        }

        let tx = self.conn.unchecked_transaction()?;
        let base = derive_table_name(document_id, sheet_name);
        let table_name = unique_identifier(&base, |candidate| documents.table_name_taken(candidate))?;
        let document = documents.insert_if_absent(document_id, sheet_name, &table_name, now)?;
        create_row_table(self.conn, &document.table_name)?;
        tx.commit()?;

        tracing::info!(
            document = %document_id,
            sheet = %sheet_name,
            table = %document.table_name,
            "Registered document"
        );
        Ok(document)
    }

    /// Look up or create the mapping for a column, upgrading TEXT in place.
    ///
    /// A mapping that already left TEXT is returned unchanged whatever the
    /// sample says.
    pub fn ensure_column_mapping(
        &self,
        document: &SyncedDocument,
        column_index: u32,
        sample: &Value,
        now: i64,
    ) -> Result<ColumnMapping> {
        let plan = self.plan_column_mapping(document, column_index, sample)?;
        if let Some(existing) = plan.registered.as_ref().filter(|mapping| mapping.deprecated) {
            return Ok(existing.clone());
        }
        self.commit_column_plan(document, &plan, now)?.ok_or_else(|| {
            Error::Schema(format!(
                "column {column_index} of {} changed while it was registered",
                document.table_name
            ))
        })
    }

    /// Work out the mapping a data edit would use without writing anything.
    ///
    /// The plan carries the type the sample would give the column; nothing
    /// is persisted until [`Self::commit_column_plan`] runs.
    pub fn plan_column_mapping(
        &self,
        document: &SyncedDocument,
        column_index: u32,
        sample: &Value,
    ) -> Result<ColumnPlan> {
        let mappings = self.mappings();
        let has_sample = value_text(sample).is_some_and(|text| !text.trim().is_empty());

        if let Some(existing) = mappings.get(&document.document_id, &document.sheet_name, column_index)? {
            let data_type = if !existing.deprecated && existing.data_type.is_text() && has_sample {
                infer_type(sample)
            } else {
                existing.data_type
            };
            return Ok(ColumnPlan {
                column_index,
                column_name: existing.column_name.clone(),
                header: existing.header.clone(),
                data_type,
                deprecated: existing.deprecated,
                registered: Some(existing),
            });
        }

        let header = format!("column_{column_index}");
        let column_name = unique_identifier(&sanitize(&header), |candidate| {
            mappings.column_name_taken(&document.table_name, candidate)
        })?;
        Ok(ColumnPlan {
            column_index,
            column_name,
            header,
            data_type: if has_sample {
                infer_type(sample)
            } else {
                DataType::Text
            },
            deprecated: false,
            registered: None,
        })
    }

    /// Persist a plan: create the mapping or apply its TEXT upgrade.
    ///
    /// Returns `None` when the registry moved since the plan was made (the
    /// column was created under another name, typed differently or
    /// deprecated); the caller re-plans.
    pub fn commit_column_plan(
        &self,
        document: &SyncedDocument,
        plan: &ColumnPlan,
        now: i64,
    ) -> Result<Option<ColumnMapping>> {
        let mappings = self.mappings();
        let current = mappings.get(&document.document_id, &document.sheet_name, plan.column_index)?;

        let Some(existing) = current else {
            if mappings.column_name_taken(&document.table_name, &plan.column_name)? {
                return Ok(None);
            }
            return self
                .insert_mapping(
                    document,
                    plan.column_index,
                    &plan.header,
                    &plan.column_name,
                    plan.data_type,
                    now,
                )
                .map(Some);
        };

        if existing.deprecated || existing.column_name != plan.column_name {
            return Ok(None);
        }
        if existing.data_type == plan.data_type {
            return Ok(Some(existing));
        }
        if !mappings.upgrade_type(existing.id, plan.data_type, now)? {
            return Ok(None);
        }
        tracing::info!(
            table = %document.table_name,
            column = %existing.column_name,
            data_type = %plan.data_type,
            "Upgraded column type"
        );
        mappings.get_by_id(existing.id).map(Some)
    }

    fn create_mapping(
        &self,
        document: &SyncedDocument,
        column_index: u32,
        header: &str,
        data_type: DataType,
        now: i64,
    ) -> Result<ColumnMapping> {
        let column_name = unique_identifier(&sanitize(header), |candidate| {
            self.mappings().column_name_taken(&document.table_name, candidate)
        })?;
        self.insert_mapping(document, column_index, header, &column_name, data_type, now)
    }

    fn insert_mapping(
        &self,
        document: &SyncedDocument,
        column_index: u32,
        header: &str,
        column_name: &str,
        data_type: DataType,
        now: i64,
    ) -> Result<ColumnMapping> {
        let mapping = self.mappings().insert(
            &NewColumnMapping {
                document_id: &document.document_id,
                sheet_name: &document.sheet_name,
                column_index,
                header,
                column_name,
                data_type,
                table_name: &document.table_name,
            },
            now,
        )?;
        tracing::info!(
            table = %document.table_name,
            column = %mapping.column_name,
            index = column_index,
            data_type = %mapping.data_type,
            "Created column mapping"
        );
        Ok(mapping)
    }

    /// Add a nullable column unless the table already has it.
    ///
    /// Safe against concurrent callers; returns `true` when this call added it.
    pub fn ensure_column_exists_on_table(
        &self,
        table_name: &str,
        column_name: &str,
        data_type: DataType,
    ) -> Result<bool> {
        if row_table_columns(self.conn, table_name)?.iter().any(|c| c == column_name) {
            return Ok(false);
        }
        // Re-check right before the ALTER; another process may have won.
        if row_table_columns(self.conn, table_name)?.iter().any(|c| c == column_name) {
            return Ok(false);
        }
        let added = add_row_table_column(self.conn, table_name, column_name, data_type.sql_type())?;
        if added {
            tracing::info!(table = %table_name, column = %column_name, "Added column");
        }
        Ok(added)
    }

    /// Apply a header-row edit.
    ///
    /// A non-empty header creates the mapping (TEXT until data arrives) or
    /// refreshes the stored header text; the physical name never changes. An
    /// empty header deprecates the column.
    pub fn register_header(
        &self,
        document: &SyncedDocument,
        column_index: u32,
        header: &Value,
        now: i64,
    ) -> Result<Option<ColumnMapping>> {
        let header = value_text(header).map(|text| text.trim().to_string()).unwrap_or_default();
        if header.is_empty() {
            return self.deprecate_column(document, column_index, now);
        }

        let mappings = self.mappings();
        match mappings.get(&document.document_id, &document.sheet_name, column_index)? {
            Some(existing) if existing.deprecated => {
                tracing::warn!(
                    table = %document.table_name,
                    column = %existing.column_name,
                    "Header set on a deprecated column, ignoring"
                );
                Ok(Some(existing))
            }
            Some(existing) => {
                mappings.update_header(existing.id, &header, now)?;
                mappings.get_by_id(existing.id).map(Some)
            }
            None => self
                .create_mapping(document, column_index, &header, DataType::Text, now)
                .map(Some),
        }
    }

    /// Stop syncing a column; the physical column and its data stay.
    pub fn deprecate_column(
        &self,
        document: &SyncedDocument,
        column_index: u32,
        now: i64,
    ) -> Result<Option<ColumnMapping>> {
        let mappings = self.mappings();
        let Some(existing) = mappings.get(&document.document_id, &document.sheet_name, column_index)? else {
            return Ok(None);
        };
        if mappings.deprecate(existing.id, now)? {
            tracing::info!(
                table = %document.table_name,
                column = %existing.column_name,
                "Deprecated column"
            );
        }
        mappings.get_by_id(existing.id).map(Some)
    }

    /// Deprecate every active mapping whose index is not in `present`.
    pub fn deprecate_missing_columns(
        &self,
        document: &SyncedDocument,
        present: &[u32],
        now: i64,
    ) -> Result<Vec<ColumnMapping>> {
        let missing: Vec<ColumnMapping> = self
            .active_mappings(&document.document_id, &document.sheet_name)?
            .into_iter()
            .filter(|mapping| !present.contains(&mapping.column_index))
            .collect();

        let mut deprecated = Vec::with_capacity(missing.len());
        for mapping in missing {
            if let Some(updated) = self.deprecate_column(document, mapping.column_index, now)? {
                deprecated.push(updated);
            }
        }
        Ok(deprecated)
    }

    pub fn active_mappings(&self, document_id: &str, sheet_name: &str) -> Result<Vec<ColumnMapping>> {
        self.mappings().list_active(document_id, sheet_name)
    }

    pub fn document(&self, document_id: &str, sheet_name: &str) -> Result<Option<SyncedDocument>> {
        self.documents().get(document_id, sheet_name)
    }

    pub fn document_by_table(&self, table_name: &str) -> Result<Option<SyncedDocument>> {
        self.documents().get_by_table(table_name)
    }

    pub fn list_documents(&self) -> Result<Vec<SyncedDocument>> {
        self.documents().list()
    }

    pub fn set_document_enabled(&self, document_id: &str, sheet_name: &str, enabled: bool) -> Result<()> {
        self.documents().set_enabled(document_id, sheet_name, enabled)?;
        tracing::info!(document = %document_id, sheet = %sheet_name, enabled, "Document sync toggled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{row_table_columns, run_migrations};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn with_conn<T>(f: impl FnOnce(&Connection) -> T) -> T {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        f(&conn)
    }

    #[test]
    fn derive_table_name_is_deterministic() {
        assert_eq!(derive_table_name("AbC-xyz", "Order Lines"), "sheet_abc_xyz_order_lines");
        let long = derive_table_name(&"d".repeat(80), &"s".repeat(80));
        assert!(long.len() <= 64);
        assert!(long.starts_with(&format!("sheet_{}_", "d".repeat(24))));
    }

    #[test]
    fn ensure_document_registered_is_idempotent() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let first = registry.ensure_document_registered("doc-1", "Orders", 10).unwrap();
            let second = registry.ensure_document_registered("doc-1", "Orders", 20).unwrap();

            assert_eq!(first, second);
            assert_eq!(first.table_name, "sheet_doc_1_orders");
            let columns = row_table_columns(conn, &first.table_name).unwrap();
            assert_eq!(
                columns,
                vec![
                    "_id",
                    "_row_number",
                    "_content_hash",
                    "_synced_values",
                    "_last_modified_at",
                    "_last_modified_by",
                    "_sync_status"
                ]
            );
        });
    }

    #[test]
    fn colliding_table_names_get_suffixes() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let first = registry.ensure_document_registered("Doc A", "Orders", 10).unwrap();
            let second = registry.ensure_document_registered("doc-a", "Orders", 10).unwrap();

            assert_eq!(first.table_name, "sheet_doc_a_orders");
            assert_eq!(second.table_name, "sheet_doc_a_orders_1");
        });
    }

    #[test]
    fn header_names_are_sanitized_and_deduplicated() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let doc = registry.ensure_document_registered("doc", "Orders", 10).unwrap();

            let order = registry.register_header(&doc, 1, &json!("Order #"), 10).unwrap().unwrap();
            let price = registry.register_header(&doc, 2, &json!("Price"), 10).unwrap().unwrap();
            let price_again = registry.register_header(&doc, 3, &json!("Price"), 10).unwrap().unwrap();

            assert_eq!(order.column_name, "order");
            assert_eq!(price.column_name, "price");
            assert_eq!(price_again.column_name, "price_1");
            assert_eq!(price_again.data_type, DataType::Text);
        });
    }

    #[test]
    fn header_rename_keeps_canonical_name() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let doc = registry.ensure_document_registered("doc", "Orders", 10).unwrap();
            registry.register_header(&doc, 2, &json!("Price"), 10).unwrap();

            let renamed = registry.register_header(&doc, 2, &json!("Unit Price"), 20).unwrap().unwrap();
            assert_eq!(renamed.header, "Unit Price");
            assert_eq!(renamed.column_name, "price");
        });
    }

    #[test]
    fn data_edit_infers_type_once() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let doc = registry.ensure_document_registered("doc", "Orders", 10).unwrap();

            let created = registry.ensure_column_mapping(&doc, 4, &json!("12.5"), 10).unwrap();
            assert_eq!(created.column_name, "column_4");
            assert_eq!(created.data_type, DataType::Number);

            let again = registry.ensure_column_mapping(&doc, 4, &json!("hello"), 20).unwrap();
            assert_eq!(again.data_type, DataType::Number);
        });
    }

    #[test]
    fn text_column_upgrades_once_and_never_reverts() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let doc = registry.ensure_document_registered("doc", "Orders", 10).unwrap();
            registry.register_header(&doc, 2, &json!("Shipped"), 10).unwrap();

            let blank = registry.ensure_column_mapping(&doc, 2, &json!(""), 11).unwrap();
            assert_eq!(blank.data_type, DataType::Text);

            let upgraded = registry.ensure_column_mapping(&doc, 2, &json!("yes"), 12).unwrap();
            assert_eq!(upgraded.data_type, DataType::Boolean);

            let kept = registry.ensure_column_mapping(&doc, 2, &json!("2024-01-01"), 13).unwrap();
            assert_eq!(kept.data_type, DataType::Boolean);
        });
    }

    #[test]
    fn ensure_column_exists_tolerates_repeats() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let doc = registry.ensure_document_registered("doc", "Orders", 10).unwrap();

            assert!(registry
                .ensure_column_exists_on_table(&doc.table_name, "price", DataType::Number)
                .unwrap());
            assert!(!registry
                .ensure_column_exists_on_table(&doc.table_name, "price", DataType::Number)
                .unwrap());
        });
    }

    #[test]
    fn removed_columns_are_deprecated_not_dropped() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            let doc = registry.ensure_document_registered("doc", "Orders", 10).unwrap();
            for (index, header) in [(1, "Item"), (2, "Price"), (3, "Qty")] {
                let mapping = registry.register_header(&doc, index, &json!(header), 10).unwrap().unwrap();
                registry
                    .ensure_column_exists_on_table(&doc.table_name, &mapping.column_name, mapping.data_type)
                    .unwrap();
            }

            let cleared = registry.register_header(&doc, 3, &json!(""), 20).unwrap().unwrap();
            assert!(cleared.deprecated);

            let gone = registry.deprecate_missing_columns(&doc, &[1], 30).unwrap();
            assert_eq!(gone.len(), 1);
            assert_eq!(gone[0].column_name, "price");

            let active = registry.active_mappings("doc", "Orders").unwrap();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].column_name, "item");

            // Physical columns survive deprecation.
            let columns = row_table_columns(conn, &doc.table_name).unwrap();
            assert!(columns.contains(&"price".to_string()));
            assert!(columns.contains(&"qty".to_string()));

            // Deprecation is terminal.
            let revived = registry.register_header(&doc, 3, &json!("Qty"), 40).unwrap().unwrap();
            assert!(revived.deprecated);
        });
    }

    #[test]
    fn disabled_documents_are_listed() {
        with_conn(|conn| {
            let registry = SchemaRegistry::new(conn);
            registry.ensure_document_registered("doc", "Orders", 10).unwrap();
            registry.set_document_enabled("doc", "Orders", false).unwrap();

            let documents = registry.list_documents().unwrap();
            assert_eq!(documents.len(), 1);
            assert!(!documents[0].enabled);
        });
    }
}
