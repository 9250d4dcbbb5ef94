use std::path::Path;

use sheetsync_core::models::Resolution;
use sheetsync_core::EngineConfig;

use crate::commands::common::{format_conflict_lines, open_local_engine};
use crate::error::CliError;

pub async fn run_conflicts_list(
    config: EngineConfig,
    db_path: &Path,
    pending_only: bool,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let engine = open_local_engine(config, db_path)?;
    let conflicts = engine.list_conflicts(pending_only, limit).await;
    engine.shutdown().await;
    let conflicts = conflicts?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_resolve(
    config: EngineConfig,
    db_path: &Path,
    id: i64,
    resolution: Resolution,
    resolved_by: Option<&str>,
) -> Result<(), CliError> {
    let engine = open_local_engine(config, db_path)?;
    let resolved = engine.resolve_conflict(id, resolution, resolved_by).await;
    engine.shutdown().await;
    let resolved = resolved?;

    println!("Conflict #{} resolved as {}", resolved.id, resolved.resolution);
    Ok(())
}
