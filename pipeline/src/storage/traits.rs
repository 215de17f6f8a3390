use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{Batch, Record};
use crate::Stage;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Uniform write/read contract over every storage backend.
///
/// `write` durably persists one batch under a stage as a single unit. `read`
/// returns up to `limit` records from the most recently written batch of that
/// stage in original order, or `None` when the stage holds nothing yet.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Backend name for logs and status
    fn backend(&self) -> &'static str;

    /// Persist a batch for a stage
    async fn write(&self, stage: Stage, batch: &[Record]) -> StorageResult<()>;

    /// Read the latest batch for a stage, truncated to `limit`
    async fn read(&self, stage: Stage, limit: usize) -> StorageResult<Option<Batch>>;
}
