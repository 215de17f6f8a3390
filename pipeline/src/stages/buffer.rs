//! Bounded per-stage accumulator that flushes to storage

use metrics::{counter, gauge, increment_counter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::record::{Batch, Record};
use crate::storage::StoragePort;
use crate::{Result, Stage};

/// Accumulates records for one stage and writes them as a single batch once
/// `capacity` is reached or on explicit flush.
///
/// A failed flush keeps the buffered records, so they are written again on
/// the next flush.
pub struct StageBuffer {
    stage: Stage,
    capacity: usize,
    storage: Arc<dyn StoragePort>,
    records: Mutex<Vec<Record>>,
    buffered: AtomicUsize,
}

impl StageBuffer {
    pub fn new(stage: Stage, capacity: usize, storage: Arc<dyn StoragePort>) -> Self {
        let capacity = capacity.max(1);
        Self {
            stage,
            capacity,
            storage,
            records: Mutex::new(Vec::with_capacity(capacity)),
            buffered: AtomicUsize::new(0),
        }
    }

    /// Append one record, flushing when the buffer is full
    pub async fn append(&self, record: Record) -> Result<()> {
        let mut records = self.records.lock().await;
        records.push(record);
        self.after_append(&mut records).await
    }

    /// Append many records, flushing once when the buffer is full
    pub async fn extend(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut records = self.records.lock().await;
        records.extend(batch);
        self.after_append(&mut records).await
    }

    /// Write every buffered record as one batch. Returns the number written.
    pub async fn flush(&self) -> Result<usize> {
        let mut records = self.records.lock().await;
        self.flush_locked(&mut records).await
    }

    /// Most recent durable batch for this stage
    pub async fn get_next_batch(&self, limit: usize) -> Result<Option<Batch>> {
        Ok(self.storage.read(self.stage, limit).await?)
    }

    /// Number of records waiting for a flush
    pub fn len(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    async fn after_append(&self, records: &mut Vec<Record>) -> Result<()> {
        self.record_len(records.len());
        if records.len() >= self.capacity {
            self.flush_locked(records).await?;
        }
        Ok(())
    }

    async fn flush_locked(&self, records: &mut Vec<Record>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        match self.storage.write(self.stage, records.as_slice()).await {
            Ok(()) => {
                records.clear();
                self.record_len(0);
                counter!("stratum_records_flushed_total", count as u64, "stage" => self.stage.name());
                debug!(stage = %self.stage, records = count, backend = self.storage.backend(), "Flushed stage buffer");
                Ok(count)
            }
            Err(e) => {
                increment_counter!("stratum_flush_failures_total", "stage" => self.stage.name());
                warn!(stage = %self.stage, records = count, error = %e, "Flush failed, keeping buffered records");
                Err(e.into())
            }
        }
    }

    fn record_len(&self, len: usize) {
        self.buffered.store(len, Ordering::Relaxed);
        gauge!("stratum_buffered_records", len as f64, "stage" => self.stage.name());
    }
}
