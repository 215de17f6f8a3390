//! Feature stage: derives temporal, financial and behavioral features

use chrono::{Datelike, TimeZone, Timelike, Utc};
use metrics::increment_counter;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info_span, warn, Instrument, Span};

use super::behavioral::{aggregator_for, BehavioralAggregator, SlidingWindow};
use super::buffer::StageBuffer;
use super::StageStatus;
use crate::config::FeatureStageConfig;
use crate::record::{carry_metadata, coerce_f64, coerce_i64, stamp_metadata, Batch, Record};
use crate::storage::StoragePort;
use crate::{PipelineError, Result, Stage};

const IDENTITY_FIELDS: &[&str] = &["blockNumber", "transactionHash"];

pub struct FeatureStage {
    buffer: StageBuffer,
    feature_store: String,
    window: Mutex<SlidingWindow>,
    aggregator: Box<dyn BehavioralAggregator>,
    span: Span,
}

impl FeatureStage {
    pub fn new(config: &FeatureStageConfig, capacity: usize, storage: Arc<dyn StoragePort>) -> Self {
        Self {
            buffer: StageBuffer::new(Stage::Feature, capacity, storage),
            feature_store: config.feature_store.clone(),
            window: Mutex::new(SlidingWindow::new(config.window_size)),
            aggregator: aggregator_for(config.behavioral),
            span: info_span!("stage", stage = "feature"),
        }
    }

    /// Replace the behavioral aggregator
    pub fn with_aggregator(mut self, aggregator: Box<dyn BehavioralAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn feature_store(&self) -> &str {
        &self.feature_store
    }

    /// Derive one feature record per cleaned record.
    ///
    /// Records whose numeric fields cannot be interpreted are dropped with a
    /// warning; the rest of the batch is unaffected.
    pub fn process(&self, batch: &[Record]) -> Result<Batch> {
        let _entered = self.span.enter();
        let mut window = self.window.lock();
        let mut features = Vec::with_capacity(batch.len());

        for (index, record) in batch.iter().enumerate() {
            match self.extract(record, &mut window) {
                Ok(feature) => features.push(feature),
                Err(e) => {
                    increment_counter!("stratum_records_dropped_total", "stage" => "feature");
                    warn!(index, error = %e, "Dropping record that failed feature extraction");
                }
            }
        }

        Ok(features)
    }

    fn extract(&self, record: &Record, window: &mut SlidingWindow) -> Result<Record> {
        // Validate before touching the window so rejected records leave no trace
        let temporal = temporal_features(record)?;
        let financial = financial_features(record)?;

        window.push(record.clone());
        let gas_price_avg = window_gas_price_avg(window);
        let behavioral = self.aggregator.aggregate(window, record);

        let mut feature = Record::new();
        for field in IDENTITY_FIELDS {
            if let Some(value) = record.get(*field).filter(|v| !v.is_null()) {
                feature.insert(field.to_string(), value.clone());
            }
        }
        carry_metadata(record, &mut feature);

        feature.extend(temporal);
        feature.insert("gasPriceAvg".to_string(), gas_price_avg);
        feature.extend(financial);
        feature.extend(behavioral);

        let mut policy = Record::new();
        policy.insert("featureStore".to_string(), json!(self.feature_store));
        stamp_metadata(&mut feature, Stage::Feature, "processedAt", policy);

        Ok(feature)
    }

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
            feature_store: Some(self.feature_store.clone()),
            ..StageStatus::of(&self.buffer)
        }
    }
}

/// Hour of day and day of week (Monday = 0) in UTC; both null without a timestamp
fn temporal_features(record: &Record) -> Result<Record> {
    let mut features = Record::new();

    let (hour, day) = match record.get("timestamp").filter(|v| !v.is_null()) {
        Some(value) => {
            let seconds = coerce_i64("timestamp", value)?;
            let at = Utc
                .timestamp_opt(seconds, 0)
                .single()
                .ok_or_else(|| PipelineError::decode(format!("timestamp {} is out of range", seconds)))?;
            (json!(at.hour()), json!(at.weekday().num_days_from_monday()))
        }
        None => (Value::Null, Value::Null),
    };

    features.insert("hourOfDay".to_string(), hour);
    features.insert("dayOfWeek".to_string(), day);
    Ok(features)
}

/// Transaction value and gas cost; absent inputs count as zero
fn financial_features(record: &Record) -> Result<Record> {
    let value = numeric_or_zero(record, "value")?;
    let gas_used = numeric_or_zero(record, "gasUsed")?;
    let gas_price = numeric_or_zero(record, "gasPrice")?;

    let mut features = Record::new();
    features.insert("transactionValue".to_string(), json!(value));
    features.insert("gasCost".to_string(), json!(gas_used * gas_price));
    Ok(features)
}

fn numeric_or_zero(record: &Record, field: &str) -> Result<f64> {
    match record.get(field) {
        None | Some(Value::Null) => Ok(0.0),
        Some(value) => coerce_f64(field, value),
    }
}

fn window_gas_price_avg(window: &SlidingWindow) -> Value {
    let prices: Vec<f64> = window
        .iter()
        .filter_map(|r| r.get("gasPrice"))
        .filter(|v| !v.is_null())
        .filter_map(|v| coerce_f64("gasPrice", v).ok())
        .collect();

    if prices.is_empty() {
        Value::Null
    } else {
        json!(prices.iter().sum::<f64>() / prices.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BehavioralKind;
    use crate::storage::MemoryStorage;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn stage(behavioral: BehavioralKind, window_size: usize) -> FeatureStage {
        let config = FeatureStageConfig {
            feature_store: "feast".to_string(),
            window_size,
            behavioral,
        };
        FeatureStage::new(&config, 100, Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_feature_values() {
        let input = record(json!({
            "timestamp": 1_700_000_000,
            "value": "2.5",
            "gasUsed": 21000,
            "gasPrice": 50,
        }));

        let out = stage(BehavioralKind::None, 10).process(&[input]).unwrap();
        assert_eq!(out.len(), 1);
        let feature = &out[0];

        // 2023-11-14T22:13:20Z, a Tuesday
        assert_eq!(feature["hourOfDay"], json!(22));
        assert_eq!(feature["dayOfWeek"], json!(1));
        assert_eq!(feature["transactionValue"].as_f64(), Some(2.5));
        assert_eq!(feature["gasCost"].as_f64(), Some(1_050_000.0));
        assert_eq!(feature["gasPriceAvg"].as_f64(), Some(50.0));
        assert_eq!(feature["_feature_metadata"]["featureStore"], json!("feast"));
        assert_eq!(feature["_feature_metadata"]["stage"], json!("feature"));
    }

    #[test]
    fn test_missing_inputs() {
        let out = stage(BehavioralKind::None, 10).process(&[Record::new()]).unwrap();
        assert!(out[0]["hourOfDay"].is_null());
        assert!(out[0]["dayOfWeek"].is_null());
        assert!(out[0]["gasPriceAvg"].is_null());
        assert_eq!(out[0]["transactionValue"].as_f64(), Some(0.0));
        assert_eq!(out[0]["gasCost"].as_f64(), Some(0.0));
    }

    #[test]
    fn test_unparseable_record_is_dropped() {
        let good = record(json!({"blockNumber": 1, "value": "1"}));
        let bad = record(json!({"blockNumber": 2, "value": "a lot"}));

        let out = stage(BehavioralKind::None, 10).process(&[good, bad]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["blockNumber"], json!(1));
    }

    #[test]
    fn test_output_field_order() {
        let input = record(json!({
            "blockNumber": 5,
            "transactionHash": "0xaa",
            "timestamp": 0,
            "fromAddress": "0xa",
            "_raw_metadata": {"stage": "raw"},
            "_cleaned_metadata": {"stage": "cleaned"},
        }));

        let out = stage(BehavioralKind::SenderActivity, 10).process(&[input]).unwrap();
        let keys: Vec<&str> = out[0].keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "blockNumber",
                "transactionHash",
                "_raw_metadata",
                "_cleaned_metadata",
                "hourOfDay",
                "dayOfWeek",
                "gasPriceAvg",
                "transactionValue",
                "gasCost",
                "senderWindowTxCount",
                "senderWindowShare",
                "_feature_metadata",
            ]
        );
    }

    struct Overriding;

    impl BehavioralAggregator for Overriding {
        fn name(&self) -> &'static str {
            "overriding"
        }

        fn aggregate(&self, _window: &SlidingWindow, _record: &Record) -> Record {
            record(json!({"gasCost": -1.0, "riskScore": 0.5}))
        }
    }

    #[test]
    fn test_later_groups_win_on_collision() {
        let input = record(json!({"gasUsed": 2, "gasPrice": 3}));
        let out = stage(BehavioralKind::None, 10)
            .with_aggregator(Box::new(Overriding))
            .process(&[input])
            .unwrap();
        assert_eq!(out[0]["gasCost"].as_f64(), Some(-1.0));
        assert_eq!(out[0]["riskScore"].as_f64(), Some(0.5));
    }

    #[test]
    fn test_window_spans_batches() {
        let features = stage(BehavioralKind::SenderActivity, 3);
        let tx = |from: &str, price: u64| record(json!({"fromAddress": from, "gasPrice": price}));

        features.process(&[tx("0xa", 10), tx("0xb", 20)]).unwrap();
        let out = features.process(&[tx("0xa", 30), tx("0xa", 40)]).unwrap();

        // Window now holds 0xb/20, 0xa/30, 0xa/40
        let last = &out[1];
        assert_eq!(last["senderWindowTxCount"], json!(2));
        assert_eq!(last["gasPriceAvg"].as_f64(), Some(30.0));
    }
}
