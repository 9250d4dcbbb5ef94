use std::path::Path;
use std::sync::Arc;

use sheetsync_core::models::SubmitOutcome;
use sheetsync_core::sheet::{HttpSheetWriter, SheetWriter};
use sheetsync_core::{EngineConfig, SyncEngine};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::common::open_database;
use crate::error::CliError;

pub async fn run_engine(config: EngineConfig, db_path: &Path, read_stdin: bool) -> Result<(), CliError> {
    let writer = HttpSheetWriter::new(
        config.require_sheet_api_url()?,
        config.sheet_api_token.clone(),
    )?;
    let writer: Arc<dyn SheetWriter> = Arc::new(writer);

    let db = open_database(db_path)?;
    tracing::info!(database = %db_path.display(), "Starting sync engine");
    let engine = SyncEngine::start(config, db, Some(writer));

    let result = if read_stdin {
        pump_stdin(&engine).await
    } else {
        tokio::signal::ctrl_c().await.map_err(CliError::from)
    };

    tracing::info!("Shutting down");
    engine.shutdown().await;
    result
}

/// Feed stdin lines to the engine until interrupted.
async fn pump_stdin(engine: &SyncEngine) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut open = true;

    while open {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => return signal.map_err(CliError::from),
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let SubmitOutcome::Rejected(reason) = engine.submit_json(&line) {
                        eprintln!("rejected: {reason}");
                    }
                }
                None => open = false,
            },
        }
    }

    // Input closed; outbound capture keeps running.
    tokio::signal::ctrl_c().await.map_err(CliError::from)
}
