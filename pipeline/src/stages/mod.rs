//! Processing stages
//!
//! Each stage owns a [`StageBuffer`] over the shared storage port. The raw
//! stage only stamps metadata; the cleaned and feature stages transform the
//! batches handed to them by the orchestrator's advance loops.

pub mod behavioral;
pub mod buffer;
pub mod cleaned;
pub mod feature;
pub mod raw;

pub use behavioral::{BehavioralAggregator, NoopAggregator, SenderActivityAggregator, SlidingWindow};
pub use buffer::StageBuffer;
pub use cleaned::{CleanedRecord, CleanedStage};
pub use feature::FeatureStage;
pub use raw::RawStage;

use serde::Serialize;

use crate::{Stage, ValidationMode};

/// Point-in-time view of a stage
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    pub stage: Stage,
    pub buffered_count: usize,
    pub capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_mode: Option<ValidationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_store: Option<String>,
}

impl StageStatus {
    pub(crate) fn of(buffer: &StageBuffer) -> Self {
        Self {
            stage: buffer.stage(),
            buffered_count: buffer.len(),
            capacity: buffer.capacity(),
            retention_days: None,
            validation_mode: None,
            feature_store: None,
        }
    }
}
