//! PostgreSQL backend
//!
//! Each record is one JSONB row tagged with its stage, a batch id and its
//! position inside the batch. A batch is inserted inside one transaction.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{StoragePort, StorageResult};
use crate::record::{Batch, Record};
use crate::Stage;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stage_records (
    id BIGSERIAL PRIMARY KEY,
    stage TEXT NOT NULL,
    batch_id UUID NOT NULL,
    position INTEGER NOT NULL,
    record JSONB NOT NULL,
    written_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS stage_records_stage_id_idx ON stage_records (stage, id DESC)";

const INSERT_RECORD: &str = "INSERT INTO stage_records (stage, batch_id, position, record) VALUES ($1, $2, $3, $4)";

const SELECT_LATEST: &str = r#"
SELECT record FROM stage_records
WHERE stage = $1
  AND batch_id = (SELECT batch_id FROM stage_records WHERE stage = $1 ORDER BY id DESC LIMIT 1)
ORDER BY position ASC
LIMIT $2"#;

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect and make sure the schema exists
    pub async fn connect(url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let storage = Self::from_pool(pool);
        storage.ensure_schema().await?;
        info!(max_connections, "Connected to PostgreSQL storage");
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StoragePort for PostgresStorage {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn write(&self, stage: Stage, batch: &[Record]) -> StorageResult<()> {
        let batch_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        for (position, record) in batch.iter().enumerate() {
            sqlx::query(INSERT_RECORD)
                .bind(stage.name())
                .bind(batch_id)
                .bind(position as i32)
                .bind(Json(record))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(stage = %stage, records = batch.len(), %batch_id, "Inserted batch");
        Ok(())
    }

    async fn read(&self, stage: Stage, limit: usize) -> StorageResult<Option<Batch>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(Json<Record>,)> = sqlx::query_as(SELECT_LATEST)
            .bind(stage.name())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(rows.into_iter().map(|(Json(record),)| record).collect()))
    }
}
