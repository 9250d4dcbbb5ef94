//! Origin, sync status and direction enums
//!
//! Stored as text in SQLite; converted only at the persistence edge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which side last wrote a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    /// The external spreadsheet
    External,
    /// The relational store
    Store,
    /// Engine-internal reconciliation (row creation)
    System,
}

impl Origin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::External => "EXTERNAL",
            Self::Store => "STORE",
            Self::System => "SYSTEM",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXTERNAL" => Ok(Self::External),
            "STORE" => Ok(Self::Store),
            "SYSTEM" => Ok(Self::System),
            other => Err(Error::InvalidInput(format!("unknown origin: {other}"))),
        }
    }
}

/// Per-row synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Synced,
    #[default]
    Pending,
    Conflict,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::Pending => "PENDING",
            Self::Conflict => "CONFLICT",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SYNCED" => Ok(Self::Synced),
            "PENDING" => Ok(Self::Pending),
            "CONFLICT" => Ok(Self::Conflict),
            "ERROR" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// Direction a change travels through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sheet → store (ingest pipeline)
    ToStore,
    /// Store → sheet (change-capture pipeline)
    ToSheet,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToStore => "to_store",
            Self::ToSheet => "to_sheet",
        }
    }

    /// Origin stamped on rows written by this direction
    pub const fn origin(self) -> Origin {
        match self {
            Self::ToStore => Origin::External,
            Self::ToSheet => Origin::Store,
        }
    }

    pub const fn opposite(self) -> Self {
        match self {
            Self::ToStore => Self::ToSheet,
            Self::ToSheet => Self::ToStore,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "to_store" => Ok(Self::ToStore),
            "to_sheet" => Ok(Self::ToSheet),
            other => Err(Error::InvalidInput(format!("unknown direction: {other}"))),
        }
    }
}
