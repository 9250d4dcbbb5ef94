use std::path::Path;

use sheetsync_core::engine::{store_status, StoreStatus};

use crate::commands::common::open_database;
use crate::error::CliError;

pub async fn run_status(db_path: &Path, as_json: bool) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let status = store_status(&db).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("database: {}", db_path.display());
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn format_status_lines(status: &StoreStatus) -> Vec<String> {
    vec![
        format!(
            "documents: {} ({} enabled)",
            status.documents, status.enabled_documents
        ),
        format!("pending store edits: {}", status.pending_changes),
        format!("pending conflicts: {}", status.pending_conflicts),
        format!("failed deliveries: {}", status.failed_deliveries),
    ]
}
