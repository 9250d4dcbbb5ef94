//! Canonical content hash of a row's synchronized values

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::models::CellValue;

/// SHA-256 (hex) over the compact JSON of the non-null fields sorted by name.
///
/// Independent of the order fields are supplied in; a field set to null hashes
/// the same as an absent field.
pub fn content_hash<'a>(fields: impl IntoIterator<Item = (&'a String, &'a CellValue)>) -> String {
    let sorted: BTreeMap<&str, serde_json::Value> = fields
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name.as_str(), value.to_canonical_json()))
        .collect();

    let mut canonical = String::from("{");
    for (position, (name, value)) in sorted.iter().enumerate() {
        if position > 0 {
            canonical.push(',');
        }
        canonical.push_str(&serde_json::Value::String((*name).to_string()).to_string());
        canonical.push(':');
        canonical.push_str(&value.to_string());
    }
    canonical.push('}');

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
