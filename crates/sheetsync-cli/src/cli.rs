use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use sheetsync_core::models::Resolution;

#[derive(Parser)]
#[command(name = "sheetsync")]
#[command(about = "Keep spreadsheet tabs and SQLite tables in sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the sync database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync engine until interrupted
    Run {
        /// Read newline-delimited JSON cell notifications from stdin
        #[arg(long)]
        stdin: bool,
    },
    /// Apply cell notifications from a JSON file ("-" for stdin)
    Ingest {
        /// File holding one notification, an array of them, or one per line
        #[arg(value_name = "FILE")]
        input: String,
    },
    /// Record a store-side edit of one row
    Edit {
        /// Spreadsheet document id
        #[arg(long, value_name = "ID")]
        document: String,
        /// Sheet (tab) name
        #[arg(long, value_name = "NAME")]
        sheet: String,
        /// 1-based row number
        #[arg(long)]
        row: u32,
        /// Column assignment, repeatable: --set qty=4
        #[arg(long = "set", value_name = "COLUMN=VALUE", required = true)]
        assignments: Vec<String>,
    },
    /// List registered documents
    Documents {
        #[command(subcommand)]
        command: Option<DocumentCommands>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show pending work recorded in the database
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Inspect and requeue failed deliveries
    Failed {
        #[command(subcommand)]
        command: FailedCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum DocumentCommands {
    /// Resume syncing a document
    Enable {
        #[arg(long, value_name = "ID")]
        document: String,
        #[arg(long, value_name = "NAME")]
        sheet: String,
    },
    /// Stop syncing a document in both directions
    Disable {
        #[arg(long, value_name = "ID")]
        document: String,
        #[arg(long, value_name = "NAME")]
        sheet: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List recorded conflicts
    List {
        /// Only conflicts still awaiting a decision
        #[arg(long)]
        pending: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a decision on a pending conflict
    Resolve {
        /// Conflict id
        id: i64,
        /// Which side wins
        #[arg(value_enum)]
        resolution: ResolutionArg,
        /// Operator name stored with the decision
        #[arg(long, value_name = "NAME")]
        by: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum FailedCommands {
    /// List failed deliveries
    List {
        /// Include deliveries that were already requeued
        #[arg(long)]
        all: bool,
        /// Number of deliveries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Give a failed delivery another run
    Requeue {
        /// Failed delivery id
        id: i64,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionArg {
    ExternalWins,
    StoreWins,
    Manual,
}

impl From<ResolutionArg> for Resolution {
    fn from(value: ResolutionArg) -> Self {
        match value {
            ResolutionArg::ExternalWins => Self::ExternalWins,
            ResolutionArg::StoreWins => Self::StoreWins,
            ResolutionArg::Manual => Self::Manual,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
