use std::path::Path;

use sheetsync_core::EngineConfig;

use crate::commands::common::{format_document_lines, open_local_engine};
use crate::error::CliError;

pub async fn run_documents(
    config: EngineConfig,
    db_path: &Path,
    as_json: bool,
) -> Result<(), CliError> {
    let engine = open_local_engine(config, db_path)?;
    let documents = engine.list_documents().await;
    engine.shutdown().await;
    let documents = documents?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&documents)?);
        return Ok(());
    }

    if documents.is_empty() {
        println!("No documents registered.");
        return Ok(());
    }

    for line in format_document_lines(&documents) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_set_document_enabled(
    config: EngineConfig,
    db_path: &Path,
    document_id: &str,
    sheet_name: &str,
    enabled: bool,
) -> Result<(), CliError> {
    let engine = open_local_engine(config, db_path)?;
    let result = engine
        .set_document_enabled(document_id, sheet_name, enabled)
        .await;
    engine.shutdown().await;
    result?;

    println!(
        "{document_id}/{sheet_name} {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
