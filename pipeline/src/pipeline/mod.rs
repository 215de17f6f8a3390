//! Pipeline orchestrator
//!
//! Owns the storage port, the three stages and the ingestion manager, and
//! runs two advance loops (raw → cleaned, cleaned → feature) plus a periodic
//! buffer flusher while started.

pub mod advance;

pub use advance::{AdvanceLoop, CleanedToFeature, RawToCleaned, StageAdvance, StepOutcome};

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::config::PipelineConfig;
use crate::ingestion::{IngestionManager, IngestionSource, IngestionStatus};
use crate::stages::{CleanedStage, FeatureStage, RawStage, StageStatus};
use crate::storage::{self, StoragePort};
use crate::{PipelineError, Result};

/// Point-in-time view of the whole pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub stack: String,
    pub running: bool,
    pub storage_backend: &'static str,
    pub ingestion: IngestionStatus,
    pub raw: StageStatus,
    pub cleaned: StageStatus,
    pub feature: StageStatus,
}

pub struct Pipeline {
    stack: String,
    config: PipelineConfig,
    storage: Arc<dyn StoragePort>,
    raw: Arc<RawStage>,
    cleaned: Arc<CleanedStage>,
    feature: Arc<FeatureStage>,
    ingestion: IngestionManager,
    running: AtomicBool,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl Pipeline {
    /// Validate the configuration, connect storage and build every component
    pub async fn new(config: PipelineConfig, stack: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let storage = storage::connect(&config.storage).await?;
        Self::with_storage(config, stack, storage)
    }

    /// Build the pipeline over an existing storage port
    pub fn with_storage(config: PipelineConfig, stack: impl Into<String>, storage: Arc<dyn StoragePort>) -> Result<Self> {
        let stack = stack.into();
        let capacity = config.ingestion.batch_size;
        if capacity == 0 {
            return Err(PipelineError::configuration("ingestion.batch_size must be greater than 0"));
        }

        let processing = &config.processing;
        let raw = Arc::new(RawStage::new(&processing.raw, capacity, Arc::clone(&storage)));
        let cleaned = Arc::new(CleanedStage::new(&processing.cleaned, capacity, Arc::clone(&storage)));
        let feature = Arc::new(FeatureStage::new(&processing.feature, capacity, Arc::clone(&storage)));
        let ingestion = IngestionManager::from_config(&config.ingestion, Arc::clone(&raw))?;

        let span = info_span!("pipeline", stack = %stack);
        info!(
            parent: &span,
            backend = storage.backend(),
            sources = ingestion.sources().len(),
            capacity,
            "Pipeline initialized"
        );

        Ok(Self {
            stack,
            config,
            storage,
            raw,
            cleaned,
            feature,
            ingestion,
            running: AtomicBool::new(false),
            shutdown: parking_lot::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            span,
        })
    }

    /// Register an extra ingestion source before starting
    pub fn add_source(&mut self, source: Arc<dyn IngestionSource>) {
        self.ingestion.add_source(source);
    }

    /// Start ingestion, both advance loops and the periodic flusher.
    /// Starting a running pipeline logs a warning and does nothing.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(parent: &self.span, "Pipeline is already running");
            return Ok(());
        }

        info!(parent: &self.span, "Starting pipeline");
        self.ingestion.start().instrument(self.span.clone()).await?;

        let token = CancellationToken::new();
        let advance = &self.config.processing.advance;
        let mut tasks = self.tasks.lock().await;

        let raw_to_cleaned = AdvanceLoop::new(
            RawToCleaned {
                raw: Arc::clone(&self.raw),
                cleaned: Arc::clone(&self.cleaned),
            },
            advance,
        );
        tasks.push(tokio::spawn(
            raw_to_cleaned.run(token.clone()).instrument(self.span.clone()),
        ));

        let cleaned_to_feature = AdvanceLoop::new(
            CleanedToFeature {
                cleaned: Arc::clone(&self.cleaned),
                feature: Arc::clone(&self.feature),
            },
            advance,
        );
        tasks.push(tokio::spawn(
            cleaned_to_feature.run(token.clone()).instrument(self.span.clone()),
        ));

        tasks.push(tokio::spawn(
            flush_loop(
                Arc::clone(&self.raw),
                Arc::clone(&self.cleaned),
                Arc::clone(&self.feature),
                advance.flush_interval(),
                token.clone(),
            )
            .instrument(self.span.clone()),
        ));

        *self.shutdown.lock() = Some(token);
        info!(parent: &self.span, "Pipeline started");
        Ok(())
    }

    /// Stop ingestion, wait for the background loops, then flush every stage.
    /// Stopping a stopped pipeline does nothing.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!(parent: &self.span, "Stopping pipeline");
        self.ingestion.stop().instrument(self.span.clone()).await?;

        let token = self.shutdown.lock().take();
        if let Some(token) = token {
            token.cancel();
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(parent: &self.span, error = %e, "Pipeline task ended abnormally");
            }
        }

        if let Err(e) = self.flush_all().await {
            error!(parent: &self.span, error = %e, "Final flush failed");
        }

        info!(parent: &self.span, "Pipeline stopped");
        Ok(())
    }

    /// Start, wait for `shutdown` to resolve, then stop
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) -> Result<()> {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    /// Flush raw, cleaned and feature buffers in order. Every stage is
    /// attempted; the first failure is returned.
    pub async fn flush_all(&self) -> Result<()> {
        flush_stages(&self.raw, &self.cleaned, &self.feature).await
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            stack: self.stack.clone(),
            running: self.is_running(),
            storage_backend: self.storage.backend(),
            ingestion: self.ingestion.status(),
            raw: self.raw.status(),
            cleaned: self.cleaned.status(),
            feature: self.feature.status(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn StoragePort> {
        Arc::clone(&self.storage)
    }

    pub fn raw_stage(&self) -> Arc<RawStage> {
        Arc::clone(&self.raw)
    }

    pub fn cleaned_stage(&self) -> Arc<CleanedStage> {
        Arc::clone(&self.cleaned)
    }

    pub fn feature_stage(&self) -> Arc<FeatureStage> {
        Arc::clone(&self.feature)
    }
}

async fn flush_stages(raw: &RawStage, cleaned: &CleanedStage, feature: &FeatureStage) -> Result<()> {
    let results = [raw.flush().await, cleaned.flush().await, feature.flush().await];
    let mut first_error = None;
    for result in results {
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn flush_loop(
    raw: Arc<RawStage>,
    cleaned: Arc<CleanedStage>,
    feature: Arc<FeatureStage>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = flush_stages(&raw, &cleaned, &feature).await {
                    warn!(error = %e, "Periodic flush failed");
                }
            }
        }
    }
}
