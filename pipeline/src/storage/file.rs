//! Local filesystem backend
//!
//! Layout: `<base>/<stage>/<stamp>.json`, one file per batch. Files are
//! written under a temporary name and renamed into place so a reader never
//! observes a partial batch.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::traits::{StoragePort, StorageResult};
use super::BatchClock;
use crate::record::{Batch, Record};
use crate::Stage;

pub struct LocalFileStorage {
    base_path: PathBuf,
    clock: BatchClock,
}

impl LocalFileStorage {
    /// Create the backend rooted at `base_path`, creating the directory if needed
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path,
            clock: BatchClock::new(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.base_path.join(stage.name())
    }

    async fn latest_file(dir: &Path) -> StorageResult<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if latest.as_ref().map_or(true, |current| path.file_name() > current.file_name()) {
                latest = Some(path);
            }
        }

        Ok(latest)
    }
}

#[async_trait]
impl StoragePort for LocalFileStorage {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn write(&self, stage: Stage, batch: &[Record]) -> StorageResult<()> {
        let dir = self.stage_dir(stage);
        tokio::fs::create_dir_all(&dir).await?;

        let stamp = self.clock.next_stamp();
        let path = dir.join(format!("{}.json", stamp));
        let tmp_path = dir.join(format!("{}.json.tmp", stamp));

        let payload = serde_json::to_vec_pretty(batch)?;
        tokio::fs::write(&tmp_path, payload).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(stage = %stage, records = batch.len(), path = %path.display(), "Wrote batch file");
        Ok(())
    }

    async fn read(&self, stage: Stage, limit: usize) -> StorageResult<Option<Batch>> {
        let Some(path) = Self::latest_file(&self.stage_dir(stage)).await? else {
            return Ok(None);
        };

        let bytes = tokio::fs::read(&path).await?;
        let mut batch: Batch = serde_json::from_slice(&bytes)?;
        batch.truncate(limit);
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(dir.path()).await.unwrap();

        let r = record(json!({"blockNumber": 100, "hash": "0xabc", "nested": {"a": [1, 2]}}));
        storage.write(Stage::Raw, &[r.clone()]).await.unwrap();

        let batch = storage.read(Stage::Raw, 1).await.unwrap().unwrap();
        assert_eq!(batch, vec![r]);
    }

    #[tokio::test]
    async fn test_read_missing_stage_returns_none() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(dir.path().join("fresh")).await.unwrap();
        assert!(storage.read(Stage::Feature, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_returns_latest_batch_truncated() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(dir.path()).await.unwrap();

        let first: Vec<Record> = (0..3).map(|i| record(json!({"n": i}))).collect();
        let second: Vec<Record> = (10..15).map(|i| record(json!({"n": i}))).collect();
        storage.write(Stage::Cleaned, &first).await.unwrap();
        storage.write(Stage::Cleaned, &second).await.unwrap();

        let batch = storage.read(Stage::Cleaned, 2).await.unwrap().unwrap();
        assert_eq!(batch, second[..2].to_vec());

        // Stages are isolated
        assert!(storage.read(Stage::Raw, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_temporary_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(dir.path()).await.unwrap();
        storage.write(Stage::Raw, &[record(json!({"n": 1}))]).await.unwrap();

        std::fs::write(dir.path().join("raw").join("99991231T235959.000000000Z.json.tmp"), b"[{").unwrap();

        let batch = storage.read(Stage::Raw, 10).await.unwrap().unwrap();
        assert_eq!(batch[0]["n"], json!(1));
    }

    #[tokio::test]
    async fn test_many_writes_produce_distinct_files() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(dir.path()).await.unwrap();
        for i in 0..50 {
            storage.write(Stage::Raw, &[record(json!({"n": i}))]).await.unwrap();
        }

        let files = std::fs::read_dir(dir.path().join("raw")).unwrap().count();
        assert_eq!(files, 50);

        let batch = storage.read(Stage::Raw, 10).await.unwrap().unwrap();
        assert_eq!(batch[0]["n"], json!(49));
    }
}
