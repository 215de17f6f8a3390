//! Polling source: periodic HTTP snapshots

use async_trait::async_trait;
use metrics::increment_counter;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::traits::{wait_or_cancel, IngestionSource, SourceKind, SourceRuntime, SourceState};
use crate::config::SourceConfig;
use crate::record::{now_timestamp, Record};
use crate::stages::RawStage;
use crate::{PipelineError, Result};

const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 5000;

/// Produces one snapshot per poll
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Provider label attached to every snapshot
    fn provider(&self) -> &str;

    /// `Ok(None)` means the provider had nothing to report this time
    async fn fetch_snapshot(&self) -> Result<Option<Value>>;
}

/// HTTP GET snapshot provider
pub struct HttpSnapshotProvider {
    client: reqwest::Client,
    provider: String,
    endpoint: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpSnapshotProvider {
    pub fn new(provider: impl Into<String>, endpoint: impl Into<String>, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider: provider.into(),
            endpoint: endpoint.into(),
            max_retries,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn request(&self) -> Result<Option<Value>> {
        let response = self.client.get(&self.endpoint).send().await?.error_for_status()?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn fetch_snapshot(&self) -> Result<Option<Value>> {
        let mut attempt = 0;
        loop {
            match self.request().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(provider = %self.provider, attempt, error = %e, "Retrying snapshot fetch");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wrap a snapshot as a raw record
pub fn snapshot_record(provider: &str, data: Value) -> Record {
    let mut record = Record::new();
    record.insert("source".to_string(), json!("api"));
    record.insert("provider".to_string(), json!(provider));
    record.insert("fetchedAt".to_string(), json!(now_timestamp()));
    record.insert("data".to_string(), data);
    record
}

pub struct PollingSource {
    runtime: SourceRuntime,
    provider: Arc<dyn SnapshotProvider>,
    poll_interval: Duration,
    error_backoff: Duration,
    raw: Arc<RawStage>,
}

impl PollingSource {
    pub fn new(name: impl Into<String>, provider: Arc<dyn SnapshotProvider>, raw: Arc<RawStage>) -> Self {
        Self {
            runtime: SourceRuntime::new(name, SourceKind::Polling),
            provider,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            error_backoff: Duration::from_millis(DEFAULT_ERROR_BACKOFF_MS),
            raw,
        }
    }

    pub fn from_config(name: String, config: &SourceConfig, max_retries: u32, raw: Arc<RawStage>) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| PipelineError::configuration(format!("polling source {} requires an endpoint", name)))?;
        let provider_name = config.provider.clone().unwrap_or_else(|| name.clone());
        let provider = Arc::new(HttpSnapshotProvider::new(provider_name, endpoint, max_retries));

        Ok(Self::new(name, provider, raw).with_intervals(
            SourceConfig::duration_or(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS),
            SourceConfig::duration_or(config.error_backoff_ms, DEFAULT_ERROR_BACKOFF_MS),
        ))
    }

    pub fn with_intervals(mut self, poll_interval: Duration, error_backoff: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.error_backoff = error_backoff;
        self
    }

    async fn poll_loop(
        provider: Arc<dyn SnapshotProvider>,
        poll_interval: Duration,
        error_backoff: Duration,
        raw: Arc<RawStage>,
        token: CancellationToken,
    ) {
        while !token.is_cancelled() {
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = provider.fetch_snapshot() => fetched,
            };

            let pause = match fetched {
                Ok(Some(data)) => match raw.store(snapshot_record(provider.provider(), data)).await {
                    Ok(()) => {
                        increment_counter!("stratum_records_ingested_total", "kind" => "polling");
                        poll_interval
                    }
                    Err(e) => {
                        error!(provider = provider.provider(), error = %e, "Failed to store snapshot");
                        error_backoff
                    }
                },
                Ok(None) => poll_interval,
                Err(e) => {
                    increment_counter!("stratum_source_errors_total", "kind" => "polling");
                    error!(provider = provider.provider(), error = %e, "Snapshot fetch failed");
                    error_backoff
                }
            };

            if !wait_or_cancel(&token, pause).await {
                break;
            }
        }
    }
}

#[async_trait]
impl IngestionSource for PollingSource {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Polling
    }

    async fn start(&self) -> Result<()> {
        if !self.runtime.begin_start() {
            return Ok(());
        }

        info!(
            source = self.name(),
            provider = self.provider.provider(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "Starting polling source"
        );
        let provider = Arc::clone(&self.provider);
        let raw = Arc::clone(&self.raw);
        let (interval, backoff) = (self.poll_interval, self.error_backoff);
        self.runtime
            .launch(move |token| Self::poll_loop(provider, interval, backoff, raw, token));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.shutdown().await
    }

    fn state(&self) -> SourceState {
        self.runtime.state()
    }
}
