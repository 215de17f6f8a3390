//! Replay source: walks historical blocks by an integer cursor
//!
//! The cursor advances only after a block has been handed to the raw stage.
//! It lives in memory; with `cursor_policy = resume` the source recovers it on
//! start from the latest durable raw batch.
//!
//! The JSON-RPC fetcher lands block headers, not transactions. Through the
//! cleaned stage's field aliases a header becomes one cleaned record per
//! block: `blockNumber` is the cursor, the block `hash` fills
//! `transactionHash`, and `gasUsed` is the block total. Headers carry no
//! `from`, `to`, `value` or `gasPrice`, so those stay null.

use async_trait::async_trait;
use metrics::increment_counter;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::{wait_or_cancel, IngestionSource, SourceKind, SourceRuntime, SourceState};
use crate::config::{CursorPolicy, IngestionConfig, SourceConfig};
use crate::record::{coerce_u64, Record};
use crate::stages::RawStage;
use crate::{PipelineError, Result};

const DEFAULT_IDLE_BACKOFF_MS: u64 = 5000;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 1000;
const RESUME_SCAN_LIMIT: usize = 100_000;

/// Fetches the block at a cursor position
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// `Ok(None)` means no data exists at this position yet
    async fn fetch(&self, cursor: u64) -> Result<Option<Record>>;
}

/// JSON-RPC `eth_getBlockByNumber` fetcher
pub struct JsonRpcBlockFetcher {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl JsonRpcBlockFetcher {
    pub fn new(endpoint: impl Into<String>, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            max_retries,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn request(&self, cursor: u64) -> Result<Option<Record>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": cursor,
            "method": "eth_getBlockByNumber",
            "params": [format!("{:#x}", cursor), false],
        });

        let payload: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = payload.get("error") {
            return Err(PipelineError::source_connection(
                self.endpoint.clone(),
                format!("JSON-RPC error: {}", error),
            ));
        }

        match payload.get("result") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(block)) => {
                let mut record = block.clone();
                record.insert("blockNumber".to_string(), json!(cursor));
                Ok(Some(record))
            }
            Some(other) => Err(PipelineError::decode(format!("unexpected block payload: {}", other))),
        }
    }
}

#[async_trait]
impl BlockFetcher for JsonRpcBlockFetcher {
    async fn fetch(&self, cursor: u64) -> Result<Option<Record>> {
        let mut attempt = 0;
        loop {
            match self.request(cursor).await {
                Ok(block) => return Ok(block),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(cursor, attempt, error = %e, "Retrying block fetch");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct ReplaySource {
    runtime: SourceRuntime,
    fetcher: Arc<dyn BlockFetcher>,
    start_cursor: u64,
    cursor: Arc<AtomicU64>,
    cursor_policy: CursorPolicy,
    idle_backoff: Duration,
    error_backoff: Duration,
    raw: Arc<RawStage>,
}

impl ReplaySource {
    pub fn new(name: impl Into<String>, fetcher: Arc<dyn BlockFetcher>, start_cursor: u64, raw: Arc<RawStage>) -> Self {
        Self {
            runtime: SourceRuntime::new(name, SourceKind::Replay),
            fetcher,
            start_cursor,
            cursor: Arc::new(AtomicU64::new(start_cursor)),
            cursor_policy: CursorPolicy::Restart,
            idle_backoff: Duration::from_millis(DEFAULT_IDLE_BACKOFF_MS),
            error_backoff: Duration::from_millis(DEFAULT_ERROR_BACKOFF_MS),
            raw,
        }
    }

    pub fn from_config(
        name: String,
        config: &SourceConfig,
        ingestion: &IngestionConfig,
        raw: Arc<RawStage>,
    ) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| PipelineError::configuration(format!("replay source {} requires an endpoint", name)))?;
        let fetcher = Arc::new(JsonRpcBlockFetcher::new(endpoint, ingestion.max_retries));

        Ok(Self::new(name, fetcher, config.start_cursor.unwrap_or(0), raw)
            .with_cursor_policy(ingestion.cursor_policy)
            .with_backoff(
                SourceConfig::duration_or(config.idle_backoff_ms, DEFAULT_IDLE_BACKOFF_MS),
                SourceConfig::duration_or(config.error_backoff_ms, DEFAULT_ERROR_BACKOFF_MS),
            ))
    }

    pub fn with_cursor_policy(mut self, policy: CursorPolicy) -> Self {
        self.cursor_policy = policy;
        self
    }

    /// Pauses used when no data is available and after a failure
    pub fn with_backoff(mut self, idle: Duration, error: Duration) -> Self {
        self.idle_backoff = idle;
        self.error_backoff = error;
        self
    }

    /// Highest block number in the latest durable raw batch, plus one
    async fn resume_position(&self) -> Result<Option<u64>> {
        let Some(batch) = self.raw.get_next_batch(RESUME_SCAN_LIMIT).await? else {
            return Ok(None);
        };

        Ok(batch
            .iter()
            .filter_map(|record| record.get("blockNumber"))
            .filter_map(|value| coerce_u64("blockNumber", value).ok())
            .max()
            .map(|highest| highest + 1))
    }

    async fn replay_loop(
        fetcher: Arc<dyn BlockFetcher>,
        cursor: Arc<AtomicU64>,
        idle_backoff: Duration,
        error_backoff: Duration,
        raw: Arc<RawStage>,
        token: CancellationToken,
    ) {
        while !token.is_cancelled() {
            let position = cursor.load(Ordering::SeqCst);
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = fetcher.fetch(position) => fetched,
            };

            let pause = match fetched {
                Ok(Some(record)) => match raw.store(record).await {
                    Ok(()) => {
                        cursor.store(position + 1, Ordering::SeqCst);
                        increment_counter!("stratum_records_ingested_total", "kind" => "replay");
                        None
                    }
                    Err(e) => {
                        // The record is held by the raw buffer and will be retried on the next flush
                        cursor.store(position + 1, Ordering::SeqCst);
                        error!(cursor = position, error = %e, "Failed to flush replayed block");
                        Some(error_backoff)
                    }
                },
                Ok(None) => {
                    debug!(cursor = position, "No block at cursor yet");
                    Some(idle_backoff)
                }
                Err(e) => {
                    increment_counter!("stratum_source_errors_total", "kind" => "replay");
                    warn!(cursor = position, error = %e, "Block fetch failed");
                    Some(error_backoff)
                }
            };

            if let Some(pause) = pause {
                if !wait_or_cancel(&token, pause).await {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl IngestionSource for ReplaySource {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Replay
    }

    async fn start(&self) -> Result<()> {
        if !self.runtime.begin_start() {
            return Ok(());
        }

        let mut position = self.start_cursor;
        if self.cursor_policy == CursorPolicy::Resume {
            match self.resume_position().await {
                Ok(Some(resumed)) if resumed > position => position = resumed,
                Ok(_) => {}
                Err(e) => warn!(source = self.name(), error = %e, "Could not recover replay cursor"),
            }
        }
        self.cursor.store(position, Ordering::SeqCst);
        info!(source = self.name(), cursor = position, "Starting replay source");

        let fetcher = Arc::clone(&self.fetcher);
        let cursor = Arc::clone(&self.cursor);
        let raw = Arc::clone(&self.raw);
        let (idle, error) = (self.idle_backoff, self.error_backoff);
        self.runtime
            .launch(move |token| Self::replay_loop(fetcher, cursor, idle, error, raw, token));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.shutdown().await
    }

    fn state(&self) -> SourceState {
        self.runtime.state()
    }

    fn cursor(&self) -> Option<u64> {
        Some(self.cursor.load(Ordering::SeqCst))
    }
}
