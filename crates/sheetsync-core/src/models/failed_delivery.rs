//! Failed delivery model

use serde::{Deserialize, Serialize};

/// An item whose delivery exhausted its retry budget
///
/// Nothing retries these automatically; an operator requeues them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub id: i64,
    /// Queue the item was dispatched on
    pub queue: String,
    pub partition_key: String,
    /// Serialized queue item
    pub payload: String,
    pub error: String,
    pub attempts: u32,
    /// Failure timestamp (unix ms)
    pub failed_at: i64,
    /// Set once an operator has requeued the item
    pub requeued_at: Option<i64>,
}
