//! Schema management: identifier sanitizing, type inference and the
//! per-document column registry

pub mod registry;
pub mod sanitize;
pub mod types;

pub use registry::{ColumnPlan, SchemaRegistry};
pub use sanitize::{quote_identifier, sanitize, unique_identifier, MAX_IDENTIFIER_LEN};
pub use types::{coerce, infer_type, parse_date};
