//! Background loops moving durable batches from one stage to the next

use async_trait::async_trait;
use metrics::increment_counter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AdvanceConfig;
use crate::ingestion::traits::wait_or_cancel;
use crate::record::{fingerprint, Batch, Record};
use crate::stages::{CleanedStage, FeatureStage, RawStage};
use crate::Result;

/// One stage transition: where batches come from and how they move on
#[async_trait]
pub trait StageAdvance: Send + Sync {
    /// Transition label for logs and metrics
    fn transition(&self) -> &'static str;

    /// Latest durable batch of the source stage
    async fn next_batch(&self, limit: usize) -> Result<Option<Batch>>;

    /// Transform a batch into records for the target stage
    fn transform(&self, batch: &[Record]) -> Result<Batch>;

    /// Buffer transformed records in the target stage. When the flush this
    /// triggers fails, the records stay buffered for the next flush.
    async fn store(&self, records: Batch) -> Result<()>;
}

/// raw → cleaned
pub struct RawToCleaned {
    pub raw: Arc<RawStage>,
    pub cleaned: Arc<CleanedStage>,
}

#[async_trait]
impl StageAdvance for RawToCleaned {
    fn transition(&self) -> &'static str {
        "raw_to_cleaned"
    }

    async fn next_batch(&self, limit: usize) -> Result<Option<Batch>> {
        self.raw.get_next_batch(limit).await
    }

    fn transform(&self, batch: &[Record]) -> Result<Batch> {
        self.cleaned.process(batch)
    }

    async fn store(&self, records: Batch) -> Result<()> {
        self.cleaned.store(records).await
    }
}

/// cleaned → feature
pub struct CleanedToFeature {
    pub cleaned: Arc<CleanedStage>,
    pub feature: Arc<FeatureStage>,
}

#[async_trait]
impl StageAdvance for CleanedToFeature {
    fn transition(&self) -> &'static str {
        "cleaned_to_feature"
    }

    async fn next_batch(&self, limit: usize) -> Result<Option<Batch>> {
        self.cleaned.get_next_batch(limit).await
    }

    fn transform(&self, batch: &[Record]) -> Result<Batch> {
        self.feature.process(batch)
    }

    async fn store(&self, records: Batch) -> Result<()> {
        self.feature.store(records).await
    }
}

/// Outcome of a single advance step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A new batch was transformed and buffered downstream
    Advanced { read: usize, written: usize },
    /// No batch, or the latest batch was already consumed
    Idle,
}

/// Repeatedly advances the latest batch until cancelled.
///
/// The latest batch stays the same until the upstream stage flushes again, so
/// the loop remembers the fingerprint of the batch it last consumed and skips
/// it. A batch is consumed once its transformed records sit in the target
/// buffer, even if the flush they trigger fails, since the buffer retries that
/// flush itself. Transform failures also consume the batch; read failures do
/// not.
pub struct AdvanceLoop<A> {
    advance: A,
    read_limit: usize,
    error_backoff: Duration,
    idle_backoff: Duration,
    last_consumed: Option<u64>,
}

impl<A: StageAdvance> AdvanceLoop<A> {
    pub fn new(advance: A, config: &AdvanceConfig) -> Self {
        Self {
            advance,
            read_limit: config.read_limit,
            error_backoff: config.error_backoff(),
            idle_backoff: config.idle_backoff(),
            last_consumed: None,
        }
    }

    /// Run one iteration
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let Some(batch) = self.advance.next_batch(self.read_limit).await? else {
            return Ok(StepOutcome::Idle);
        };

        let batch_fingerprint = fingerprint(&batch);
        if self.last_consumed == Some(batch_fingerprint) {
            return Ok(StepOutcome::Idle);
        }

        if batch.len() >= self.read_limit {
            warn!(
                transition = self.advance.transition(),
                read_limit = self.read_limit,
                "Latest batch fills the read limit, records beyond it are not advanced"
            );
        }

        let output = match self.advance.transform(&batch) {
            Ok(output) => output,
            Err(e) => {
                if e.is_batch_failure() {
                    self.last_consumed = Some(batch_fingerprint);
                }
                return Err(e);
            }
        };

        self.last_consumed = Some(batch_fingerprint);
        let written = output.len();
        self.advance.store(output).await?;

        debug!(
            transition = self.advance.transition(),
            read = batch.len(),
            written,
            "Advanced batch"
        );
        Ok(StepOutcome::Advanced {
            read: batch.len(),
            written,
        })
    }

    /// Loop until `token` is cancelled. An iteration in flight is allowed to finish.
    pub async fn run(mut self, token: CancellationToken) {
        let transition = self.advance.transition();
        info!(transition, "Advance loop started");

        while !token.is_cancelled() {
            let pause = match self.step().await {
                Ok(StepOutcome::Advanced { .. }) => None,
                Ok(StepOutcome::Idle) => Some(self.idle_backoff),
                Err(e) => {
                    increment_counter!(
                        "stratum_advance_errors_total",
                        "transition" => transition,
                        "category" => e.category()
                    );
                    error!(transition, error = %e, "Advance step failed");
                    Some(self.error_backoff)
                }
            };

            if let Some(pause) = pause {
                if !wait_or_cancel(&token, pause).await {
                    break;
                }
            }
        }

        info!(transition, "Advance loop stopped");
    }
}
