use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::traits::{StoragePort, StorageResult};
use crate::record::{Batch, Record};
use crate::Stage;

/// Process-local backend. Keeps every written batch; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    batches: RwLock<HashMap<Stage, Vec<Batch>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches written for a stage, oldest first
    pub fn batches(&self, stage: Stage) -> Vec<Batch> {
        self.batches.read().get(&stage).cloned().unwrap_or_default()
    }

    /// All records written for a stage across batches, in write order
    pub fn records(&self, stage: Stage) -> Vec<Record> {
        self.batches(stage).into_iter().flatten().collect()
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, stage: Stage, batch: &[Record]) -> StorageResult<()> {
        self.batches.write().entry(stage).or_default().push(batch.to_vec());
        Ok(())
    }

    async fn read(&self, stage: Stage, limit: usize) -> StorageResult<Option<Batch>> {
        let batches = self.batches.read();
        Ok(batches
            .get(&stage)
            .and_then(|written| written.last())
            .map(|latest| latest.iter().take(limit).cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_storage_latest_batch() {
        let storage = MemoryStorage::new();
        assert!(storage.read(Stage::Raw, 10).await.unwrap().is_none());

        let a = json!({"n": 1}).as_object().cloned().unwrap();
        let b = json!({"n": 2}).as_object().cloned().unwrap();
        storage.write(Stage::Raw, &[a.clone()]).await.unwrap();
        storage.write(Stage::Raw, &[b.clone(), a.clone()]).await.unwrap();

        assert_eq!(storage.read(Stage::Raw, 1).await.unwrap(), Some(vec![b.clone()]));
        assert_eq!(storage.records(Stage::Raw), vec![a.clone(), b, a]);
        assert_eq!(storage.batches(Stage::Raw).len(), 2);
    }
}
