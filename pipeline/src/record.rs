//! Dynamic record model shared by every stage
//!
//! Raw records stay fully dynamic: an insertion-ordered map of field name to
//! JSON value. Only the cleaned stage pins a canonical shape (see
//! [`crate::stages::CleanedRecord`]).

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::{PipelineError, Result, Stage};

/// One structured unit of data flowing through the pipeline
pub type Record = Map<String, Value>;

/// Records moved or transformed together
pub type Batch = Vec<Record>;

/// Current UTC time formatted for metadata fields
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Stamp `stage`'s metadata object onto a record.
///
/// `fields` are the stage-specific policy flags; `stage` is always added.
/// Existing fields written by earlier stages are left untouched.
pub fn stamp_metadata(record: &mut Record, stage: Stage, timestamp_key: &str, fields: Record) {
    let mut metadata = Map::new();
    metadata.insert(timestamp_key.to_string(), Value::String(now_timestamp()));
    metadata.insert("stage".to_string(), Value::String(stage.name().to_string()));
    metadata.extend(fields);
    record.insert(stage.metadata_key().to_string(), Value::Object(metadata));
}

/// Whether a field name is a stage metadata field
pub fn is_metadata_key(key: &str) -> bool {
    key.starts_with('_') && key.ends_with("_metadata")
}

/// Copy every stage metadata field of `from` into `into`
pub fn carry_metadata(from: &Record, into: &mut Record) {
    for (key, value) in from.iter().filter(|(key, _)| is_metadata_key(key)) {
        into.insert(key.clone(), value.clone());
    }
}

/// First non-null value among a list of field aliases
pub fn first_present<'a>(record: &'a Record, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|alias| record.get(*alias))
        .find(|value| !value.is_null())
}

/// Coerce a JSON number, decimal string or `0x` hex string into a `u64`
pub fn coerce_u64(field: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .ok_or_else(|| invalid(field, value, "expected a non-negative integer")),
        Value::String(s) => parse_integer_str(s)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| invalid(field, value, "expected a non-negative integer")),
        _ => Err(invalid(field, value, "expected a number or numeric string")),
    }
}

/// Coerce a JSON number, decimal string or `0x` hex string into an `i64`
pub fn coerce_i64(field: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| invalid(field, value, "expected an integer")),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(rest) = trimmed.strip_prefix('-') {
                parse_integer_str(rest)
                    .and_then(|v| i64::try_from(v).ok())
                    .map(|v| -v)
                    .ok_or_else(|| invalid(field, value, "expected an integer"))
            } else {
                parse_integer_str(trimmed)
                    .and_then(|v| i64::try_from(v).ok())
                    .ok_or_else(|| invalid(field, value, "expected an integer"))
            }
        }
        _ => Err(invalid(field, value, "expected a number or numeric string")),
    }
}

/// Coerce a JSON number or numeric string (decimal or `0x` hex) into an `f64`
pub fn coerce_f64(field: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| invalid(field, value, "expected a finite number")),
        Value::String(s) => {
            let trimmed = s.trim();
            if is_hex(trimmed) {
                parse_integer_str(trimmed)
                    .map(|v| v as f64)
                    .ok_or_else(|| invalid(field, value, "malformed hex quantity"))
            } else {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .ok_or_else(|| invalid(field, value, "expected a numeric string"))
            }
        }
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => {
            Err(invalid(field, value, "expected a number or numeric string"))
        }
    }
}

/// Normalize a quantity into a plain decimal string; hex quantities are converted
pub fn normalize_decimal(field: &str, value: &Value) -> Result<String> {
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => {
            let trimmed = s.trim();
            if is_hex(trimmed) {
                parse_integer_str(trimmed)
                    .map(|v| v.to_string())
                    .ok_or_else(|| invalid(field, value, "malformed hex quantity"))
            } else if trimmed.parse::<f64>().map(|f| f.is_finite()).unwrap_or(false) {
                Ok(trimmed.to_string())
            } else {
                Err(invalid(field, value, "expected a decimal quantity"))
            }
        }
        _ => Err(invalid(field, value, "expected a number or numeric string")),
    }
}

/// Coerce a string-like value into a `String`
pub fn coerce_string(field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(invalid(field, value, "expected a string")),
    }
}

/// Stable fingerprint of a batch's serialized content
pub fn fingerprint(batch: &[Record]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for record in batch {
        // Serializing a map of JSON values cannot fail.
        serde_json::to_string(record).unwrap_or_default().hash(&mut hasher);
    }
    batch.len().hash(&mut hasher);
    hasher.finish()
}

fn is_hex(s: &str) -> bool {
    s.starts_with("0x") || s.starts_with("0X")
}

fn parse_integer_str(s: &str) -> Option<u128> {
    let s = s.trim();
    if is_hex(s) {
        let digits = &s[2..];
        if digits.is_empty() {
            return None;
        }
        u128::from_str_radix(digits, 16).ok()
    } else {
        s.parse::<u128>().ok()
    }
}

fn invalid(field: &str, value: &Value, reason: &str) -> PipelineError {
    PipelineError::decode(format!("field {} has invalid value {}: {}", field, value, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_coerce_u64_accepts_hex_and_decimal() {
        assert_eq!(coerce_u64("blockNumber", &json!(100)).unwrap(), 100);
        assert_eq!(coerce_u64("blockNumber", &json!("0x64")).unwrap(), 100);
        assert_eq!(coerce_u64("blockNumber", &json!(" 100 ")).unwrap(), 100);
        assert!(coerce_u64("blockNumber", &json!(-1)).is_err());
        assert!(coerce_u64("blockNumber", &json!("0x")).is_err());
        assert!(coerce_u64("blockNumber", &json!(true)).is_err());
    }

    #[test]
    fn test_coerce_i64_handles_negative_strings() {
        assert_eq!(coerce_i64("timestamp", &json!("-5")).unwrap(), -5);
        assert_eq!(coerce_i64("timestamp", &json!("0x6553f100")).unwrap(), 1_700_000_000);
        assert!(coerce_i64("timestamp", &json!("yesterday")).is_err());
    }

    #[test]
    fn test_normalize_decimal() {
        assert_eq!(normalize_decimal("value", &json!("2.5")).unwrap(), "2.5");
        assert_eq!(normalize_decimal("value", &json!("0xde0b6b3a7640000")).unwrap(), "1000000000000000000");
        assert_eq!(normalize_decimal("value", &json!(7)).unwrap(), "7");
        assert!(normalize_decimal("value", &json!("lots")).is_err());
    }

    #[test]
    fn test_coerce_f64() {
        assert_eq!(coerce_f64("value", &json!("2.5")).unwrap(), 2.5);
        assert_eq!(coerce_f64("gasUsed", &json!(21000)).unwrap(), 21000.0);
        assert_eq!(coerce_f64("gasPrice", &json!("0x32")).unwrap(), 50.0);
        assert!(coerce_f64("value", &json!("NaN")).is_err());
        assert!(coerce_f64("value", &json!(null)).is_err());
    }

    #[test]
    fn test_first_present_skips_nulls() {
        let r = record(json!({"block_number": null, "number": "0x1"}));
        assert_eq!(first_present(&r, &["blockNumber", "block_number", "number"]), Some(&json!("0x1")));
        assert_eq!(first_present(&r, &["hash"]), None);
    }

    #[test]
    fn test_stamp_and_carry_metadata() {
        let mut raw = record(json!({"blockNumber": 1}));
        stamp_metadata(&mut raw, Stage::Raw, "ingestedAt", record(json!({"retentionDays": 30})));

        let meta = raw["_raw_metadata"].as_object().unwrap();
        assert_eq!(meta["stage"], json!("raw"));
        assert_eq!(meta["retentionDays"], json!(30));
        assert!(meta.contains_key("ingestedAt"));

        let mut cleaned = Record::new();
        carry_metadata(&raw, &mut cleaned);
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned.contains_key("_raw_metadata"));
        assert!(!is_metadata_key("blockNumber"));
    }

    #[test]
    fn test_fingerprint_distinguishes_batches() {
        let a = vec![record(json!({"blockNumber": 1}))];
        let b = vec![record(json!({"blockNumber": 2}))];
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&[]), fingerprint(&a));
    }
}
