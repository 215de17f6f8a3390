//! Configuration management for the pipeline

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::storage::StorageBackendKind;
use crate::ValidationMode;

/// Main configuration structure for the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ingestion sources and shared ingestion settings
    pub ingestion: IngestionConfig,

    /// Storage backend selection and connection parameters
    pub storage: StorageConfig,

    /// Per-stage processing options
    pub processing: ProcessingConfig,

    /// Monitoring and observability
    pub monitoring: MonitoringConfig,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Configured sources, in start order
    pub sources: Vec<SourceConfig>,

    /// Capacity of every stage buffer
    pub batch_size: usize,

    /// Retry attempts per fetch inside the HTTP fetchers
    pub max_retries: u32,

    /// What the replay sources do with their cursor on start
    pub cursor_policy: CursorPolicy,
}

/// Replay cursor behavior across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPolicy {
    /// Start from the configured start cursor every time
    #[default]
    Restart,

    /// Continue after the highest block number found in the latest durable raw batch
    Resume,
}

/// One ingestion source entry.
///
/// `type` stays a plain string so that unknown types survive deserialization
/// and can be skipped by the ingestion manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source type (streaming, replay, polling)
    #[serde(rename = "type")]
    pub source_type: String,

    /// Source name used in logs and status
    pub name: Option<String>,

    /// WebSocket URL, JSON-RPC URL or HTTP URL depending on the type
    pub endpoint: Option<String>,

    /// First block number fetched by a replay source
    pub start_cursor: Option<u64>,

    /// Provider label attached to polled snapshots
    pub provider: Option<String>,

    /// Raw text message sent after a streaming connection opens
    pub subscribe: Option<String>,

    /// Wait before reopening a streaming connection
    pub reconnect_backoff_ms: Option<u64>,

    /// Wait when a replay source finds no new data
    pub idle_backoff_ms: Option<u64>,

    /// Wait after a fetch or store failure
    pub error_backoff_ms: Option<u64>,

    /// Interval between polls
    pub poll_interval_ms: Option<u64>,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selector (file, memory, postgres, redis, s3)
    pub backend: String,

    /// Object store bucket
    pub bucket: Option<String>,

    /// Object store region
    pub region: Option<String>,

    /// Custom object store endpoint (MinIO, LocalStack)
    pub endpoint: Option<String>,

    /// Base directory for the file backend, database or redis URL otherwise
    pub connection_string: Option<String>,

    /// Key prefix for object store and redis keys
    pub prefix: Option<String>,

    /// Object store access key
    pub access_key: Option<String>,

    /// Object store secret key
    pub secret_key: Option<String>,

    /// Use path-style object store addressing
    pub path_style: bool,

    /// Relational connection pool size
    pub max_connections: u32,

    /// Batches retained per stage by the redis backend
    pub retained_batches: usize,
}

/// Per-stage processing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub raw: RawStageConfig,
    pub cleaned: CleanedStageConfig,
    pub feature: FeatureStageConfig,
    pub advance: AdvanceConfig,
}

/// Raw stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStageConfig {
    /// Retention window stamped on raw records
    pub retention_days: u32,
}

/// Cleaned stage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanedStageConfig {
    /// Validation mode applied to each batch
    pub validation: ValidationMode,
}

/// Feature stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureStageConfig {
    /// Feature store label stamped on feature records
    pub feature_store: String,

    /// Number of cleaned records kept for behavioral aggregation
    pub window_size: usize,

    /// Behavioral aggregator to run
    pub behavioral: BehavioralKind,
}

/// Built-in behavioral aggregators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehavioralKind {
    /// No behavioral features
    None,

    /// Per-sender activity within the sliding window
    #[default]
    SenderActivity,
}

/// Advance loop and flush timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvanceConfig {
    /// Maximum records read per advance step; at least `ingestion.batch_size`
    pub read_limit: usize,

    /// Pause after a failed advance step
    pub error_backoff_ms: u64,

    /// Pause when no new batch is available
    pub idle_backoff_ms: u64,

    /// Interval of the periodic buffer flush
    pub flush_interval_ms: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Prometheus exporter listen address
    pub metrics_addr: Option<String>,

    /// Interval between status log lines in the binary
    pub status_interval_secs: u64,
}

impl PipelineConfig {
    /// Load configuration from an optional file layered under environment variables.
    ///
    /// Environment variables use the `STRATUM` prefix with `__` between nested
    /// keys.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(Environment::with_prefix("STRATUM").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingestion.batch_size == 0 {
            return Err(ConfigError::Message("ingestion.batch_size must be greater than 0".into()));
        }

        // Advance loops read only the latest batch, so it must fit in one read
        if self.processing.advance.read_limit < self.ingestion.batch_size {
            return Err(ConfigError::Message(format!(
                "processing.advance.read_limit ({}) must be at least ingestion.batch_size ({})",
                self.processing.advance.read_limit, self.ingestion.batch_size
            )));
        }

        let advance = &self.processing.advance;
        for (key, value) in [
            ("flush_interval_ms", advance.flush_interval_ms),
            ("idle_backoff_ms", advance.idle_backoff_ms),
            ("error_backoff_ms", advance.error_backoff_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Message(format!(
                    "processing.advance.{} must be greater than 0",
                    key
                )));
            }
        }

        if self.processing.feature.window_size == 0 {
            return Err(ConfigError::Message("processing.feature.window_size must be greater than 0".into()));
        }

        let backend: StorageBackendKind = self
            .storage
            .backend
            .parse()
            .map_err(|_| ConfigError::Message(format!("Unknown storage backend: {}", self.storage.backend)))?;

        match backend {
            StorageBackendKind::ObjectStore if self.storage.bucket.is_none() => {
                return Err(ConfigError::Message("storage.bucket is required for the s3 backend".into()));
            }
            StorageBackendKind::Relational | StorageBackendKind::Document
                if self.storage.connection_string.is_none() =>
            {
                return Err(ConfigError::Message(format!(
                    "storage.connection_string is required for the {} backend",
                    backend
                )));
            }
            _ => {}
        }

        if let Some(ref endpoint) = self.storage.endpoint {
            if Url::parse(endpoint).is_err() {
                return Err(ConfigError::Message(format!("Invalid storage endpoint: {}", endpoint)));
            }
        }

        for source in &self.ingestion.sources {
            if let Some(ref endpoint) = source.endpoint {
                if Url::parse(endpoint).is_err() {
                    return Err(ConfigError::Message(format!(
                        "Invalid endpoint for {} source: {}",
                        source.source_type, endpoint
                    )));
                }
            }
        }

        Ok(())
    }
}

impl SourceConfig {
    pub(crate) fn duration_or(value: Option<u64>, default_ms: u64) -> Duration {
        Duration::from_millis(value.unwrap_or(default_ms))
    }
}

impl AdvanceConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            batch_size: 1000,
            max_retries: 3,
            cursor_policy: CursorPolicy::Restart,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            bucket: None,
            region: None,
            endpoint: None,
            connection_string: Some("./data".to_string()),
            prefix: None,
            access_key: None,
            secret_key: None,
            path_style: false,
            max_connections: 5,
            retained_batches: 1000,
        }
    }
}

impl Default for RawStageConfig {
    fn default() -> Self {
        Self { retention_days: 365 }
    }
}

impl Default for FeatureStageConfig {
    fn default() -> Self {
        Self {
            feature_store: "feast".to_string(),
            window_size: 100,
            behavioral: BehavioralKind::SenderActivity,
        }
    }
}

impl Default for AdvanceConfig {
    fn default() -> Self {
        Self {
            read_limit: 2000,
            error_backoff_ms: 1000,
            idle_backoff_ms: 1000,
            flush_interval_ms: 5000,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_addr: None,
            status_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingestion.batch_size, 1000);
        assert_eq!(config.processing.raw.retention_days, 365);
        assert_eq!(config.processing.cleaned.validation, ValidationMode::Strict);
        assert_eq!(config.processing.advance.read_limit, 2000);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let mut config = PipelineConfig::default();
        config.storage.backend = "tape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_requirements() {
        let mut config = PipelineConfig::default();
        config.storage.backend = "s3".to_string();
        assert!(config.validate().is_err());
        config.storage.bucket = Some("events".to_string());
        assert!(config.validate().is_ok());

        config.storage.backend = "postgres".to_string();
        config.storage.connection_string = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_limit_must_cover_batch_size() {
        let mut config = PipelineConfig::default();
        config.ingestion.batch_size = 5;
        config.processing.advance.read_limit = 2;
        assert!(config.validate().is_err());

        config.processing.advance.read_limit = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_advance_backoffs_are_rejected() {
        let mut config = PipelineConfig::default();
        config.processing.advance.idle_backoff_ms = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.processing.advance.error_backoff_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let mut config = PipelineConfig::default();
        config.ingestion.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
ingestion:
  batch_size: 50
  cursor_policy: resume
  sources:
    - type: replay
      endpoint: "http://localhost:8545"
      start_cursor: 100
    - type: carrier-pigeon
storage:
  backend: memory
processing:
  cleaned:
    validation: lenient
"#
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.ingestion.batch_size, 50);
        assert_eq!(config.ingestion.cursor_policy, CursorPolicy::Resume);
        assert_eq!(config.ingestion.sources.len(), 2);
        assert_eq!(config.ingestion.sources[0].start_cursor, Some(100));
        assert_eq!(config.ingestion.sources[1].source_type, "carrier-pigeon");
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.processing.cleaned.validation, ValidationMode::Lenient);
        assert_eq!(config.processing.feature.feature_store, "feast");
        assert!(config.validate().is_ok());
    }
}
