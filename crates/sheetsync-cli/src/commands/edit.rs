use std::collections::BTreeMap;
use std::path::Path;

use sheetsync_core::util::now_millis;
use sheetsync_core::EngineConfig;

use crate::commands::common::{open_local_engine, parse_assignment};
use crate::error::CliError;

pub async fn run_edit(
    config: EngineConfig,
    db_path: &Path,
    document_id: &str,
    sheet_name: &str,
    row: u32,
    assignments: &[String],
) -> Result<(), CliError> {
    let values = assignments
        .iter()
        .map(|raw| parse_assignment(raw))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let engine = open_local_engine(config, db_path)?;
    let entry = engine
        .record_store_edit(document_id, sheet_name, row, &values, now_millis())
        .await;
    engine.shutdown().await;

    match entry? {
        Some(entry) => println!(
            "Recorded change #{} ({})",
            entry.id,
            entry.changed_columns.join(", ")
        ),
        None => println!("No changes: row {row} already holds these values"),
    }
    Ok(())
}
