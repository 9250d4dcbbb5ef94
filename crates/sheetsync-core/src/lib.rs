//! sheetsync-core - Core library for sheetsync
//!
//! Keeps an externally edited spreadsheet and a SQLite store consistent under
//! concurrent, bidirectional edits. The crate contains the schema registry
//! for the ever-changing column set, the guard chain that suppresses update
//! loops and arbitrates conflicts, the two directional pipelines and the
//! rate-limited dispatch queues that front them.

pub mod config;
pub mod coordination;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod guard;
pub mod health;
pub mod models;
pub mod pipeline;
pub mod schema;
pub mod sheet;
pub mod util;

pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use models::{CellNotification, CellValue, DataType, Origin, SyncConflict};
