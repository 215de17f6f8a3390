//! Behavioral feature extension point
//!
//! Aggregators see a bounded window of recently processed cleaned records and
//! return extra feature fields for the current record.

use serde_json::{json, Value};
use std::collections::VecDeque;

use crate::config::BehavioralKind;
use crate::record::Record;

/// Bounded FIFO of recent cleaned records
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    records: VecDeque<Record>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a record, evicting the oldest when full
    pub fn push(&mut self, record: Record) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Derives behavioral features for a record.
///
/// `window` already holds `record` as its newest entry.
pub trait BehavioralAggregator: Send + Sync {
    fn name(&self) -> &'static str;

    fn aggregate(&self, window: &SlidingWindow, record: &Record) -> Record;
}

/// Emits no behavioral features
pub struct NoopAggregator;

impl BehavioralAggregator for NoopAggregator {
    fn name(&self) -> &'static str {
        "none"
    }

    fn aggregate(&self, _window: &SlidingWindow, _record: &Record) -> Record {
        Record::new()
    }
}

/// How active the record's sender is within the window
pub struct SenderActivityAggregator;

impl BehavioralAggregator for SenderActivityAggregator {
    fn name(&self) -> &'static str {
        "sender_activity"
    }

    fn aggregate(&self, window: &SlidingWindow, record: &Record) -> Record {
        let mut features = Record::new();

        let sender = record.get("fromAddress").and_then(Value::as_str);
        let (count, share) = match sender {
            Some(sender) if !window.is_empty() => {
                let count = window
                    .iter()
                    .filter(|r| r.get("fromAddress").and_then(Value::as_str) == Some(sender))
                    .count();
                (json!(count), json!(count as f64 / window.len() as f64))
            }
            _ => (Value::Null, Value::Null),
        };

        features.insert("senderWindowTxCount".to_string(), count);
        features.insert("senderWindowShare".to_string(), share);
        features
    }
}

/// Aggregator for a configured kind
pub fn aggregator_for(kind: BehavioralKind) -> Box<dyn BehavioralAggregator> {
    match kind {
        BehavioralKind::None => Box::new(NoopAggregator),
        BehavioralKind::SenderActivity => Box::new(SenderActivityAggregator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(from: &str) -> Record {
        json!({ "fromAddress": from }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = SlidingWindow::new(2);
        window.push(tx("0xa"));
        window.push(tx("0xb"));
        window.push(tx("0xc"));
        assert_eq!(window.len(), 2);
        let senders: Vec<_> = window.iter().map(|r| r["fromAddress"].clone()).collect();
        assert_eq!(senders, vec![json!("0xb"), json!("0xc")]);
    }

    #[test]
    fn test_sender_activity() {
        let mut window = SlidingWindow::new(10);
        for from in ["0xa", "0xb", "0xa", "0xa"] {
            window.push(tx(from));
        }

        let features = SenderActivityAggregator.aggregate(&window, &tx("0xa"));
        assert_eq!(features["senderWindowTxCount"], json!(3));
        assert_eq!(features["senderWindowShare"], json!(0.75));
    }

    #[test]
    fn test_sender_activity_without_sender() {
        let mut window = SlidingWindow::new(10);
        let record = Record::new();
        window.push(record.clone());

        let features = SenderActivityAggregator.aggregate(&window, &record);
        assert!(features["senderWindowTxCount"].is_null());
        assert!(features["senderWindowShare"].is_null());
    }

    #[test]
    fn test_noop_aggregator() {
        let window = SlidingWindow::new(1);
        assert!(aggregator_for(BehavioralKind::None).aggregate(&window, &tx("0xa")).is_empty());
        assert_eq!(aggregator_for(BehavioralKind::SenderActivity).name(), "sender_activity");
    }
}
