//! Redis document backend
//!
//! Each stage is a list at `<prefix>:<stage>`; every batch is one JSON
//! document pushed to the head. The list is trimmed to the configured number
//! of retained batches.

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use tracing::{debug, info};

use super::traits::{StoragePort, StorageResult};
use crate::record::{Batch, Record};
use crate::Stage;

pub struct RedisStorage {
    connection: ConnectionManager,
    prefix: String,
    retained_batches: usize,
}

impl RedisStorage {
    pub async fn connect(url: &str, prefix: &str, retained_batches: usize) -> StorageResult<Self> {
        let client = ::redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(prefix, retained_batches, "Connected to Redis storage");

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            retained_batches: retained_batches.max(1),
        })
    }

    fn key(&self, stage: Stage) -> String {
        format!("{}:{}", self.prefix, stage.name())
    }
}

#[async_trait]
impl StoragePort for RedisStorage {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn write(&self, stage: Stage, batch: &[Record]) -> StorageResult<()> {
        let key = self.key(stage);
        let document = serde_json::to_string(batch)?;
        let keep = isize::try_from(self.retained_batches).unwrap_or(isize::MAX);

        let mut connection = self.connection.clone();
        ::redis::pipe()
            .atomic()
            .lpush(&key, document)
            .ignore()
            .ltrim(&key, 0, keep - 1)
            .ignore()
            .query_async::<_, ()>(&mut connection)
            .await?;

        debug!(stage = %stage, records = batch.len(), key = %key, "Pushed batch document");
        Ok(())
    }

    async fn read(&self, stage: Stage, limit: usize) -> StorageResult<Option<Batch>> {
        let mut connection = self.connection.clone();
        let document: Option<String> = connection.lindex(self.key(stage), 0).await?;

        match document {
            Some(document) => {
                let mut batch: Batch = serde_json::from_str(&document)?;
                batch.truncate(limit);
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }
}
