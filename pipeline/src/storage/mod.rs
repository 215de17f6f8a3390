//! Storage port and backend implementations
//!
//! Every stage persists flushed batches through a [`StoragePort`]. The backend
//! is chosen once at construction from [`StorageConfig::backend`]; an unknown
//! selector is a fatal configuration error.

pub mod file;
pub mod memory;
pub mod postgres;
pub mod redis;
pub mod s3;
pub mod traits;

pub use file::LocalFileStorage;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use self::redis::RedisStorage;
pub use s3::S3Storage;
pub use traits::{StoragePort, StorageResult};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use crate::{PipelineError, Result};

/// Storage backend selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    /// One JSON file per batch on the local filesystem
    LocalFile,
    /// Process-local, non-durable
    Memory,
    /// PostgreSQL, one JSONB row per record
    Relational,
    /// Redis, one JSON document per batch
    Document,
    /// S3-compatible object store
    ObjectStore,
}

impl StorageBackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            StorageBackendKind::LocalFile => "file",
            StorageBackendKind::Memory => "memory",
            StorageBackendKind::Relational => "postgres",
            StorageBackendKind::Document => "redis",
            StorageBackendKind::ObjectStore => "s3",
        }
    }
}

impl std::fmt::Display for StorageBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for StorageBackendKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "file" | "local" => Ok(StorageBackendKind::LocalFile),
            "memory" => Ok(StorageBackendKind::Memory),
            "postgres" | "postgresql" => Ok(StorageBackendKind::Relational),
            "redis" => Ok(StorageBackendKind::Document),
            "s3" => Ok(StorageBackendKind::ObjectStore),
            _ => Err(PipelineError::configuration(format!("Unknown storage backend: {}", s))),
        }
    }
}

/// Build the configured storage backend, connecting eagerly.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn StoragePort>> {
    let kind: StorageBackendKind = config.backend.parse()?;
    info!(backend = %kind, "Connecting storage backend");

    let storage: Arc<dyn StoragePort> = match kind {
        StorageBackendKind::LocalFile => {
            let base = config.connection_string.as_deref().unwrap_or("./data");
            Arc::new(LocalFileStorage::new(base).await?)
        }
        StorageBackendKind::Memory => Arc::new(MemoryStorage::new()),
        StorageBackendKind::Relational => {
            let url = required(config.connection_string.as_deref(), kind, "connection_string")?;
            Arc::new(PostgresStorage::connect(url, config.max_connections).await?)
        }
        StorageBackendKind::Document => {
            let url = required(config.connection_string.as_deref(), kind, "connection_string")?;
            let prefix = config.prefix.as_deref().unwrap_or("stratum");
            Arc::new(RedisStorage::connect(url, prefix, config.retained_batches).await?)
        }
        StorageBackendKind::ObjectStore => Arc::new(S3Storage::connect(config).await?),
    };

    Ok(storage)
}

fn required<'a>(value: Option<&'a str>, kind: StorageBackendKind, field: &str) -> Result<&'a str> {
    value.ok_or_else(|| PipelineError::configuration(format!("storage.{} is required for the {} backend", field, kind)))
}

/// Strictly increasing batch identifiers derived from wall-clock time.
///
/// Formatted as ISO 8601 basic format with nanoseconds so that lexicographic
/// order equals write order.
#[derive(Debug, Default)]
pub struct BatchClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl BatchClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier, never equal to or earlier than the previous one
    pub fn next_stamp(&self) -> String {
        let mut last = self.last.lock();
        let mut now = Utc::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + Duration::nanoseconds(1);
            }
        }
        *last = Some(now);
        now.format("%Y%m%dT%H%M%S%.9fZ").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selectors() {
        assert_eq!("file".parse::<StorageBackendKind>().unwrap(), StorageBackendKind::LocalFile);
        assert_eq!("PostgreSQL".parse::<StorageBackendKind>().unwrap(), StorageBackendKind::Relational);
        assert_eq!("redis".parse::<StorageBackendKind>().unwrap(), StorageBackendKind::Document);
        assert_eq!("s3".parse::<StorageBackendKind>().unwrap(), StorageBackendKind::ObjectStore);
        assert!("tape".parse::<StorageBackendKind>().is_err());
    }

    #[test]
    fn test_batch_clock_is_strictly_increasing() {
        let clock = BatchClock::new();
        let stamps: Vec<String> = (0..1000).map(|_| clock.next_stamp()).collect();
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(stamps[0].ends_with('Z'));
        assert_eq!(stamps[0].len(), "20240101T000000.000000000Z".len());
    }

    #[tokio::test]
    async fn test_connect_unknown_backend_fails() {
        let config = StorageConfig {
            backend: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        let err = connect(&config).await.err().unwrap();
        assert_eq!(err.category(), "config");
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = StorageConfig {
            backend: "memory".to_string(),
            ..Default::default()
        };
        let storage = connect(&config).await.unwrap();
        assert_eq!(storage.backend(), "memory");
    }
}
