use std::path::Path;

use sheetsync_core::EngineConfig;

use crate::commands::common::{format_failed_lines, open_local_engine};
use crate::error::CliError;

pub async fn run_failed_list(
    config: EngineConfig,
    db_path: &Path,
    include_requeued: bool,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let engine = open_local_engine(config, db_path)?;
    let failed = engine.list_failed(include_requeued, limit).await;
    engine.shutdown().await;
    let failed = failed?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&failed)?);
        return Ok(());
    }

    if failed.is_empty() {
        println!("No failed deliveries.");
        return Ok(());
    }

    for line in format_failed_lines(&failed) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_failed_requeue(
    config: EngineConfig,
    db_path: &Path,
    id: i64,
) -> Result<(), CliError> {
    let engine = open_local_engine(config, db_path)?;
    let requeued = engine.requeue_failed(id).await;
    // Requeued ingest payloads are applied before exiting.
    engine.shutdown().await;
    let requeued = requeued?;

    println!("Requeued #{} on queue {}", requeued.id, requeued.queue);
    Ok(())
}
