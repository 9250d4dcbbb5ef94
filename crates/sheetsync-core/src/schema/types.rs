//! Type inference and coercion for raw cell values
//!
//! Neither function fails: inference falls back to TEXT and coercion degrades
//! to a documented default.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;

use crate::models::{CellValue, DataType};
use crate::util::compact_text;

const BOOLEAN_LITERALS: [&str; 6] = ["true", "false", "yes", "no", "1", "0"];
const TRUTHY_LITERALS: [&str; 3] = ["true", "1", "yes"];

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

fn numeric_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)$").expect("Invalid regex"))
}

fn iso_date_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("Invalid regex"))
}

/// Textual form of a raw cell value; `None` for JSON null.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Classify a sample cell value.
///
/// Order matters: boolean literals win over numbers, so `"1"` infers BOOLEAN.
pub fn infer_type(sample: &Value) -> DataType {
    let Some(text) = value_text(sample) else {
        return DataType::Text;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DataType::Text;
    }

    let lowered = trimmed.to_ascii_lowercase();
    if BOOLEAN_LITERALS.contains(&lowered.as_str()) {
        return DataType::Boolean;
    }

    if numeric_pattern().is_match(&trimmed.replace(',', "")) {
        return DataType::Number;
    }

    if iso_date_prefix().is_match(trimmed) && parse_date(trimmed).is_some() {
        return DataType::Date;
    }

    DataType::Text
}

/// Coerce a raw cell value into `target`; never fails.
///
/// Empty input is `Null` for every type. Unparsable numbers become `0` and
/// unparsable dates become `Null`; both degradations are logged.
pub fn coerce(value: &Value, target: DataType) -> CellValue {
    let Some(text) = value_text(value) else {
        return CellValue::Null;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return CellValue::Null;
    }

    match target {
        DataType::Text => CellValue::Text(trimmed.to_string()),
        DataType::Number => {
            if let Some(number) = value.as_f64() {
                return CellValue::Number(number);
            }
            let digits: String = trimmed
                .chars()
                .filter(|ch| ch.is_ascii_digit() || *ch == '.' || *ch == '-')
                .collect();
            digits.parse::<f64>().map_or_else(
                |_| {
                    tracing::debug!(
                        target_type = %target,
                        input = %compact_text(trimmed),
                        "Unparsable number coerced to 0"
                    );
                    CellValue::Number(0.0)
                },
                CellValue::Number,
            )
        }
        DataType::Date => parse_date(trimmed).map_or_else(
            || {
                tracing::debug!(
                    target_type = %target,
                    input = %compact_text(trimmed),
                    "Unparsable date coerced to null"
                );
                CellValue::Null
            },
            CellValue::Date,
        ),
        DataType::Boolean => {
            let lowered = trimmed.to_ascii_lowercase();
            CellValue::Boolean(TRUTHY_LITERALS.contains(&lowered.as_str()))
        }
    }
}

/// Parse the date/time forms a spreadsheet commonly produces.
///
/// Naive values are interpreted as UTC.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}
