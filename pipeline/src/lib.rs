//! # Stratum Pipeline
//!
//! Staged ingestion pipeline for blockchain event streams. Sources land raw
//! records in the raw stage; background advance loops pull flushed batches
//! from durable storage, clean them, derive features, and land each stage's
//! output on a pluggable storage backend.

pub mod config;
pub mod error;
pub mod record;
pub mod storage;
pub mod stages;
pub mod ingestion;
pub mod pipeline;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{PipelineError, Result, StorageError};
pub use pipeline::{Pipeline, PipelineStatus};
pub use record::{Batch, Record};
pub use storage::StoragePort;

/// Current version of the pipeline
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pipeline identifier
pub const SYSTEM_NAME: &str = "stratum-pipeline";

/// Processing stages, ordered raw < cleaned < feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Cleaned,
    Feature,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 3] = [Stage::Raw, Stage::Cleaned, Stage::Feature];

    /// Get the stage name as used in storage paths and keys
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Cleaned => "cleaned",
            Stage::Feature => "feature",
        }
    }

    /// Name of the metadata field this stage stamps on its records
    pub fn metadata_key(&self) -> &'static str {
        match self {
            Stage::Raw => "_raw_metadata",
            Stage::Cleaned => "_cleaned_metadata",
            Stage::Feature => "_feature_metadata",
        }
    }

    /// The stage data advances to from this one, if any
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Raw => Some(Stage::Cleaned),
            Stage::Cleaned => Some(Stage::Feature),
            Stage::Feature => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "raw" | "bronze" => Ok(Stage::Raw),
            "cleaned" | "silver" => Ok(Stage::Cleaned),
            "feature" | "features" | "gold" => Ok(Stage::Feature),
            _ => Err(PipelineError::configuration(format!("unknown stage: {}", s))),
        }
    }
}

/// Cleaned-stage validation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Any record failure aborts the whole batch
    #[default]
    Strict,

    /// Failing records are dropped and logged
    Lenient,
}

impl ValidationMode {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationMode::Strict => "strict",
            ValidationMode::Lenient => "lenient",
        }
    }
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(ValidationMode::Strict),
            "lenient" => Ok(ValidationMode::Lenient),
            _ => Err(PipelineError::configuration(format!("unknown validation mode: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert!(Stage::Raw < Stage::Cleaned);
        assert!(Stage::Cleaned < Stage::Feature);
        assert_eq!(Stage::Raw.next(), Some(Stage::Cleaned));
        assert_eq!(Stage::Feature.next(), None);
    }

    #[test]
    fn test_stage_parsing() {
        assert_eq!("RAW".parse::<Stage>().unwrap(), Stage::Raw);
        assert_eq!("silver".parse::<Stage>().unwrap(), Stage::Cleaned);
        assert!("platinum".parse::<Stage>().is_err());
    }

    #[test]
    fn test_validation_mode_parsing() {
        assert_eq!("Lenient".parse::<ValidationMode>().unwrap(), ValidationMode::Lenient);
        assert_eq!(ValidationMode::default(), ValidationMode::Strict);
        assert!("sloppy".parse::<ValidationMode>().is_err());
    }
}
