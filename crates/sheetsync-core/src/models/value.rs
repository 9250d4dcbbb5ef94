//! Typed cell values and the versioned value maps stored in the change log

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::types::parse_date;

/// Column data types a spreadsheet column can be inferred as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    /// Free text (the initial type of every column)
    #[default]
    Text,
    /// Floating point number
    Number,
    /// Instant, stored as RFC 3339 UTC
    Date,
    /// Boolean, stored as 1/0
    Boolean,
}

impl DataType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Number => "NUMBER",
            Self::Date => "DATE",
            Self::Boolean => "BOOLEAN",
        }
    }

    /// Declared SQLite column type for a physical column of this type
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Date => "TEXT",
            Self::Number => "REAL",
            Self::Boolean => "INTEGER",
        }
    }

    pub const fn is_text(self) -> bool {
        matches!(self, Self::Text)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TEXT" => Ok(Self::Text),
            "NUMBER" => Ok(Self::Number),
            "DATE" => Ok(Self::Date),
            "BOOLEAN" => Ok(Self::Boolean),
            other => Err(Error::InvalidInput(format!("unknown data type: {other}"))),
        }
    }
}

/// A coerced cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CellValue {
    #[default]
    Null,
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
    Boolean(bool),
}

impl CellValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical JSON form used for content hashing.
    pub fn to_canonical_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Text(text) => serde_json::Value::String(text.clone()),
            Self::Number(number) => serde_json::Number::from_f64(*number)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Date(date) => {
                serde_json::Value::String(date.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Self::Boolean(flag) => serde_json::Value::from(i64::from(*flag)),
        }
    }

    /// String written to the external document for this value.
    pub fn display(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Text(text) => text.clone(),
            Self::Number(number) => {
                if number.fract() == 0.0 && number.abs() < 1e15 {
                    format!("{}", *number as i64)
                } else {
                    number.to_string()
                }
            }
            Self::Date(date) => {
                if date.num_seconds_from_midnight() == 0 && date.nanosecond() == 0 {
                    date.format("%Y-%m-%d").to_string()
                } else {
                    date.to_rfc3339_opts(SecondsFormat::Secs, true)
                }
            }
            Self::Boolean(true) => "TRUE".to_string(),
            Self::Boolean(false) => "FALSE".to_string(),
        }
    }

    /// Read a stored value, interpreting it according to the column's type.
    ///
    /// Values that do not fit the current type (e.g. text written before the
    /// column was upgraded from TEXT) are surfaced as text instead of being
    /// reinterpreted.
    pub fn from_sql(value: ValueRef<'_>, data_type: DataType) -> Self {
        let text = match value {
            ValueRef::Null => return Self::Null,
            ValueRef::Integer(int) => match data_type {
                DataType::Number => return Self::Number(int as f64),
                DataType::Boolean => return Self::Boolean(int != 0),
                DataType::Text | DataType::Date => int.to_string(),
            },
            ValueRef::Real(real) => match data_type {
                DataType::Number => return Self::Number(real),
                DataType::Boolean => return Self::Boolean(real != 0.0),
                DataType::Text | DataType::Date => real.to_string(),
            },
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                String::from_utf8_lossy(bytes).into_owned()
            }
        };

        match data_type {
            DataType::Text => Self::Text(text),
            DataType::Number => text
                .trim()
                .parse::<f64>()
                .map_or(Self::Text(text), Self::Number),
            DataType::Date => parse_date(&text).map_or(Self::Text(text), Self::Date),
            DataType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Self::Boolean(true),
                "0" | "false" | "no" => Self::Boolean(false),
                _ => Self::Text(text),
            },
        }
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::from(rusqlite::types::Null),
            Self::Text(text) => ToSqlOutput::from(text.as_str()),
            Self::Number(number) => ToSqlOutput::from(*number),
            Self::Date(date) => {
                ToSqlOutput::from(date.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Self::Boolean(flag) => ToSqlOutput::from(i64::from(*flag)),
        })
    }
}

/// Current layout version of [`ValueMap`]
pub const VALUE_MAP_VERSION: u32 = 1;

/// Column name → value mapping persisted as JSON (change log, row snapshots)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMap {
    pub version: u32,
    pub values: BTreeMap<String, CellValue>,
}

impl ValueMap {
    pub const fn new(values: BTreeMap<String, CellValue>) -> Self {
        Self {
            version: VALUE_MAP_VERSION,
            values,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a stored value map.
    pub fn from_json(raw: &str) -> Result<Self> {
        let map: Self = serde_json::from_str(raw)?;
        if map.version != VALUE_MAP_VERSION {
            return Err(Error::InvalidInput(format!(
                "unsupported value map version {} (expected {VALUE_MAP_VERSION})",
                map.version
            )));
        }
        Ok(map)
    }
}

impl Default for ValueMap {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn data_type_round_trips_through_storage_string() {
        for data_type in [
            DataType::Text,
            DataType::Number,
            DataType::Date,
            DataType::Boolean,
        ] {
            assert_eq!(data_type.as_str().parse::<DataType>().unwrap(), data_type);
        }
        assert!("FLOAT".parse::<DataType>().is_err());
    }

    #[test]
    fn display_formats_values_for_the_sheet() {
        assert_eq!(CellValue::Number(42.0).display(), "42");
        assert_eq!(CellValue::Number(4.25).display(), "4.25");
        assert_eq!(CellValue::Boolean(true).display(), "TRUE");
        assert_eq!(CellValue::Null.display(), "");
        let day = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(CellValue::Date(day).display(), "2024-03-09");
    }

    #[test]
    fn from_sql_keeps_legacy_text_in_upgraded_columns() {
        let value = CellValue::from_sql(ValueRef::Text(b"12.5"), DataType::Number);
        assert_eq!(value, CellValue::Number(12.5));

        let value = CellValue::from_sql(ValueRef::Text(b"n/a"), DataType::Number);
        assert_eq!(value, CellValue::Text("n/a".to_string()));

        let value = CellValue::from_sql(ValueRef::Integer(1), DataType::Boolean);
        assert_eq!(value, CellValue::Boolean(true));
    }

    #[test]
    fn value_map_rejects_unknown_version() {
        let raw = r#"{"version":9,"values":{}}"#;
        assert!(ValueMap::from_json(raw).is_err());

        let mut values = BTreeMap::new();
        values.insert("price".to_string(), CellValue::Number(3.5));
        let map = ValueMap::new(values);
        let parsed = ValueMap::from_json(&map.to_json().unwrap()).unwrap();
        assert_eq!(parsed, map);
    }
}
