//! sheetsync CLI - run the sync engine and operate on its database

mod cli;
mod commands;
mod error;

use clap::Parser;
use sheetsync_core::EngineConfig;

use crate::cli::{Cli, Commands, ConflictCommands, DocumentCommands, FailedCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::documents::{run_documents, run_set_document_enabled};
use crate::commands::edit::run_edit;
use crate::commands::failed::{run_failed_list, run_failed_requeue};
use crate::commands::ingest::run_ingest;
use crate::commands::run::run_engine;
use crate::commands::status::run_status;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "sheetsync=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let config = EngineConfig::from_env()?;
    let db_path = resolve_db_path(cli.db_path, config.database_path.clone());

    match cli.command {
        Commands::Run { stdin } => run_engine(config, &db_path, stdin).await?,
        Commands::Ingest { input } => run_ingest(config, &db_path, &input).await?,
        Commands::Edit {
            document,
            sheet,
            row,
            assignments,
        } => run_edit(config, &db_path, &document, &sheet, row, &assignments).await?,
        Commands::Documents { command, json } => match command {
            None => run_documents(config, &db_path, json).await?,
            Some(DocumentCommands::Enable { document, sheet }) => {
                run_set_document_enabled(config, &db_path, &document, &sheet, true).await?;
            }
            Some(DocumentCommands::Disable { document, sheet }) => {
                run_set_document_enabled(config, &db_path, &document, &sheet, false).await?;
            }
        },
        Commands::Status { json } => run_status(&db_path, json).await?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List {
                pending,
                limit,
                json,
            } => run_conflicts_list(config, &db_path, pending, limit, json).await?,
            ConflictCommands::Resolve { id, resolution, by } => {
                run_conflicts_resolve(config, &db_path, id, resolution.into(), by.as_deref())
                    .await?;
            }
        },
        Commands::Failed { command } => match command {
            FailedCommands::List { all, limit, json } => {
                run_failed_list(config, &db_path, all, limit, json).await?;
            }
            FailedCommands::Requeue { id } => run_failed_requeue(config, &db_path, id).await?,
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}
