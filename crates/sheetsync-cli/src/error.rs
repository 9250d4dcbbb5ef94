use std::io;

use sheetsync_core::config::ConfigError;
use sheetsync_core::sheet::SheetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] sheetsync_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sheet(#[from] SheetError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid assignment '{0}', expected COLUMN=VALUE")]
    InvalidAssignment(String),
    #[error("No notifications found in {0}")]
    NoNotifications(String),
}
