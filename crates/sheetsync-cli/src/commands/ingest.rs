use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sheetsync_core::models::SubmitOutcome;
use sheetsync_core::pipeline::SyncEvent;
use sheetsync_core::EngineConfig;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;

use crate::commands::common::{open_local_engine, split_notifications};
use crate::error::CliError;

/// Outcome counts of one ingest run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub submitted: usize,
    pub rejected: usize,
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
}

impl IngestSummary {
    pub fn record(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::Applied { .. } => self.applied += 1,
            SyncEvent::Skipped { .. } => self.skipped += 1,
            SyncEvent::Conflict { .. } => self.conflicts += 1,
            SyncEvent::DeliveryFailed { .. } => self.failed += 1,
            SyncEvent::Delivered { .. } => {}
        }
    }

    fn collect(&mut self, events: &mut Receiver<SyncEvent>) {
        loop {
            match events.try_recv() {
                Ok(event) => self.record(&event),
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event summary lagged behind the engine");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }
}

pub async fn run_ingest(config: EngineConfig, db_path: &Path, input: &str) -> Result<(), CliError> {
    let text = read_input(input)?;
    let payloads = split_notifications(&text);
    if payloads.is_empty() {
        return Err(CliError::NoNotifications(input.to_string()));
    }

    let engine = open_local_engine(config, db_path)?;
    let mut events = engine.subscribe();
    let mut summary = IngestSummary::default();

    for (index, payload) in payloads.iter().enumerate() {
        match engine.submit_json(payload) {
            SubmitOutcome::Accepted => summary.submitted += 1,
            SubmitOutcome::Rejected(reason) => {
                summary.rejected += 1;
                eprintln!("notification {}: {reason}", index + 1);
            }
        }
        summary.collect(&mut events);
    }

    engine.drain_ingest().await;
    summary.collect(&mut events);
    engine.shutdown().await;

    println!(
        "submitted={} rejected={} applied={} skipped={} conflicts={} failed={}",
        summary.submitted,
        summary.rejected,
        summary.applied,
        summary.skipped,
        summary.conflicts,
        summary.failed
    );
    Ok(())
}

fn read_input(input: &str) -> Result<String, CliError> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    Ok(std::fs::read_to_string(input)?)
}
