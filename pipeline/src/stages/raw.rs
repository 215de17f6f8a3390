use serde_json::json;
use std::sync::Arc;
use tracing::{info_span, Instrument, Span};

use super::buffer::StageBuffer;
use super::StageStatus;
use crate::config::RawStageConfig;
use crate::record::{stamp_metadata, Batch, Record};
use crate::storage::StoragePort;
use crate::{Result, Stage};

/// Landing stage for ingested records, unmodified apart from metadata
pub struct RawStage {
    buffer: StageBuffer,
    retention_days: u32,
    span: Span,
}

impl RawStage {
    pub fn new(config: &RawStageConfig, capacity: usize, storage: Arc<dyn StoragePort>) -> Self {
        Self {
            buffer: StageBuffer::new(Stage::Raw, capacity, storage),
            retention_days: config.retention_days,
            span: info_span!("stage", stage = "raw"),
        }
    }

    /// Stamp raw metadata on a record and buffer it
    pub async fn store(&self, mut record: Record) -> Result<()> {
        let mut policy = Record::new();
        policy.insert("retentionDays".to_string(), json!(self.retention_days));
        stamp_metadata(&mut record, Stage::Raw, "ingestedAt", policy);

        self.buffer.append(record).instrument(self.span.clone()).await
    }

    pub async fn get_next_batch(&self, limit: usize) -> Result<Option<Batch>> {
        self.buffer.get_next_batch(limit).await
    }

    pub async fn flush(&self) -> Result<usize> {
        self.buffer.flush().await
    }

    pub fn status(&self) -> StageStatus {
        StageStatus {
            retention_days: Some(self.retention_days),
            ..StageStatus::of(&self.buffer)
        }
    }
}
