//! Data models for sheetsync

mod change_log;
mod column_mapping;
mod document;
mod failed_delivery;
mod notification;
mod origin;
mod row;
mod sync_conflict;
mod value;

pub use change_log::{ChangeLogEntry, ChangeOperation};
pub use column_mapping::ColumnMapping;
pub use document::SyncedDocument;
pub use failed_delivery::FailedDelivery;
pub use notification::{CellNotification, RejectReason, SubmitOutcome};
pub use origin::{Direction, Origin, SyncStatus};
pub use row::{RowMetadata, SyncedRow};
pub use sync_conflict::{Resolution, SyncConflict};
pub use value::{CellValue, DataType, ValueMap, VALUE_MAP_VERSION};
