//! Cleaned stage: normalizes raw records into a canonical transaction shape

use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info_span, warn, Instrument, Span};

use super::buffer::StageBuffer;
use super::StageStatus;
use crate::config::CleanedStageConfig;
use crate::record::{
    carry_metadata, coerce_i64, coerce_string, coerce_u64, first_present, normalize_decimal, stamp_metadata, Batch,
    Record,
};
use crate::storage::StoragePort;
use crate::{PipelineError, Result, Stage, ValidationMode};

const BLOCK_NUMBER: &[&str] = &["blockNumber", "block_number", "number"];
const TRANSACTION_HASH: &[&str] = &["transactionHash", "transaction_hash", "hash"];
const TIMESTAMP: &[&str] = &["timestamp"];
const FROM_ADDRESS: &[&str] = &["fromAddress", "from_address", "from"];
const TO_ADDRESS: &[&str] = &["toAddress", "to_address", "to"];
const VALUE: &[&str] = &["value"];
const GAS_USED: &[&str] = &["gasUsed", "gas_used", "gas"];
const GAS_PRICE: &[&str] = &["gasPrice", "gas_price"];

/// Canonical cleaned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanedRecord {
    pub block_number: u64,
    pub transaction_hash: String,
    pub timestamp: i64,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    /// Decimal string, never hex
    pub value: Option<String>,
    pub gas_used: Option<u64>,
    pub gas_price: Option<u64>,
}

impl CleanedRecord {
    /// Decode and normalize a raw record. Missing required fields and
    /// malformed values are decode errors.
    pub fn decode(raw: &Record) -> Result<Self> {
        let block_number = coerce_u64("blockNumber", required(raw, BLOCK_NUMBER, "blockNumber")?)?;
        let transaction_hash = normalize_hex(coerce_string(
            "transactionHash",
            required(raw, TRANSACTION_HASH, "transactionHash")?,
        )?);
        let timestamp = coerce_i64("timestamp", required(raw, TIMESTAMP, "timestamp")?)?;

        Ok(Self {
            block_number,
            transaction_hash,
            timestamp,
            from_address: optional(raw, FROM_ADDRESS, "fromAddress", coerce_string)?.map(normalize_hex),
            to_address: optional(raw, TO_ADDRESS, "toAddress", coerce_string)?.map(normalize_hex),
            value: optional(raw, VALUE, "value", normalize_decimal)?,
            gas_used: optional(raw, GAS_USED, "gasUsed", coerce_u64)?,
            gas_price: optional(raw, GAS_PRICE, "gasPrice", coerce_u64)?,
        })
    }

    /// Convert into a record carrying every canonical field, absent ones as null
    pub fn into_record(self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }
}

fn required<'a>(raw: &'a Record, aliases: &[&str], field: &str) -> Result<&'a Value> {
    first_present(raw, aliases).ok_or_else(|| PipelineError::decode(format!("missing required field {}", field)))
}

fn optional<T>(
    raw: &Record,
    aliases: &[&str],
    field: &str,
    coerce: fn(&str, &Value) -> Result<T>,
) -> Result<Option<T>> {
    first_present(raw, aliases).map(|value| coerce(field, value)).transpose()
}

fn normalize_hex(s: String) -> String {
    if s.starts_with("0x") || s.starts_with("0X") {
        s.to_lowercase()
    } else {
        s
    }
}

/// Normalizes raw batches and buffers the cleaned output
pub struct CleanedStage {
    buffer: StageBuffer,
    validation_mode: ValidationMode,
    span: Span,
}

impl CleanedStage {
    pub fn new(config: &CleanedStageConfig, capacity: usize, storage: Arc<dyn StoragePort>) -> Self {
        Self {
            buffer: StageBuffer::new(Stage::Cleaned, capacity, storage),
            validation_mode: config.validation,
            span: info_span!("stage", stage = "cleaned"),
        }
    }

    pub fn validation_mode(&self) -> ValidationMode {
        self.validation_mode
    }

    /// Clean a raw batch.
    ///
    /// Strict mode fails the whole batch on the first bad record; lenient mode
    /// drops bad records with a warning. Processing the same input again yields
    /// the same output apart from `_cleaned_metadata.processedAt`.
    pub fn process(&self, batch: &[Record]) -> Result<Batch> {
        let _entered = self.span.enter();
        let mut cleaned = Vec::with_capacity(batch.len());

        for (index, raw) in batch.iter().enumerate() {
            match CleanedRecord::decode(raw) {
                Ok(decoded) => {
                    let mut record = decoded.into_record();
                    carry_metadata(raw, &mut record);
                    let mut policy = Record::new();
                    policy.insert("validationMode".to_string(), json!(self.validation_mode.name()));
                    stamp_metadata(&mut record, Stage::Cleaned, "processedAt", policy);
                    cleaned.push(record);
                }
                Err(e) => match self.validation_mode {
                    ValidationMode::Strict => {
                        warn!(index, error = %e, "Rejecting batch in strict mode");
                        return Err(e);
                    }
                    ValidationMode::Lenient => {
                        increment_counter!("stratum_records_dropped_total", "stage" => "cleaned");
                        warn!(index, error = %e, "Dropping record that failed cleaning");
                    }
                },
            }
        }

        Ok(cleaned)
    }

    /// Buffer cleaned records
    pub async fn store(&self, records: Batch) -> Result<()> {
        self.buffer.extend(records).instrument(self.span.clone()).await
    }

    pub async fn get_next_batch(&self, limit: usize) -> Result<Option<Batch>> {
        self.buffer.get_next_batch(limit).await
    }

    pub async fn flush(&self) -> Result<usize> {
        self.buffer.flush().await
    }

    pub fn status(&self) -> StageStatus {
        StageStatus {
            validation_mode: Some(self.validation_mode),
            ..StageStatus::of(&self.buffer)
        }
    }
}
