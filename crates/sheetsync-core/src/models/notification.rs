//! Inbound single-cell edit notification

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};

/// A single-cell edit reported by the spreadsheet side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellNotification {
    pub document_id: String,
    pub sheet_name: String,
    /// 1-based row
    pub row: u32,
    /// 1-based column
    pub col: u32,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Edit timestamp in unix ms; RFC 3339 strings are accepted on input
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_identity: Option<String>,
}

/// Why a notification was refused at submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MalformedPayload(String),
    /// The engine is shutting down and no longer queues work
    Unavailable,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPayload(detail) => write!(f, "malformed payload: {detail}"),
            Self::Unavailable => f.write_str("engine unavailable"),
        }
    }
}

/// Result of `submit_change`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl CellNotification {
    /// Structural validation performed before the notification is queued.
    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.document_id.trim().is_empty() {
            return Err(RejectReason::MalformedPayload(
                "documentId must not be empty".to_string(),
            ));
        }
        if self.sheet_name.trim().is_empty() {
            return Err(RejectReason::MalformedPayload(
                "sheetName must not be empty".to_string(),
            ));
        }
        if self.row == 0 || self.col == 0 {
            return Err(RejectReason::MalformedPayload(
                "row and col are 1-based".to_string(),
            ));
        }
        if self.timestamp <= 0 {
            return Err(RejectReason::MalformedPayload(
                "timestamp must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a raw JSON payload.
    pub fn parse(raw: &str) -> Result<Self, RejectReason> {
        let notification: Self = serde_json::from_str(raw)
            .map_err(|error| RejectReason::MalformedPayload(error.to_string()))?;
        notification.validate()?;
        Ok(notification)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Millis(millis) => Ok(millis),
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|instant| instant.timestamp_millis())
            .map_err(serde::de::Error::custom),
    }
}
