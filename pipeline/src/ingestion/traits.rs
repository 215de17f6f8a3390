//! Traits and shared lifecycle plumbing for ingestion sources

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument, Span};

use crate::{PipelineError, Result};

/// Upper bound on how long `stop` waits for a source task before aborting it
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Kinds of ingestion source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Persistent WebSocket subscription
    Streaming,
    /// Cursor-based historical block fetch
    Replay,
    /// Periodic HTTP snapshot
    Polling,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Streaming => "streaming",
            SourceKind::Replay => "replay",
            SourceKind::Polling => "polling",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "streaming" | "websocket" => Ok(SourceKind::Streaming),
            "replay" | "historical" => Ok(SourceKind::Replay),
            "polling" | "api" => Ok(SourceKind::Polling),
            _ => Err(PipelineError::configuration(format!("Unknown source type: {}", s))),
        }
    }
}

/// Lifecycle state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of a source
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub kind: SourceKind,
    pub state: SourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
}

/// An independent producer of raw records
#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// Name used in logs and status
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Begin producing in the background. Starting a running source is a no-op.
    async fn start(&self) -> Result<()>;

    /// Stop producing and wait for the background task. Idempotent.
    async fn stop(&self) -> Result<()>;

    fn state(&self) -> SourceState;

    fn is_running(&self) -> bool {
        self.state() == SourceState::Running
    }

    /// Position of the next fetch for cursor-based sources
    fn cursor(&self) -> Option<u64> {
        None
    }

    fn status(&self) -> SourceStatus {
        SourceStatus {
            name: self.name().to_string(),
            kind: self.kind(),
            state: self.state(),
            cursor: self.cursor(),
        }
    }
}

/// Background task bookkeeping shared by the built-in sources.
///
/// Owns the lifecycle state, the cancellation token and the join handle of a
/// single producer task.
pub struct SourceRuntime {
    name: String,
    state: RwLock<SourceState>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    span: Span,
}

impl SourceRuntime {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        let name = name.into();
        let span = info_span!("source", source = %name, kind = kind.name());
        Self {
            name,
            state: RwLock::new(SourceState::Stopped),
            task: Mutex::new(None),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SourceState {
        *self.state.read()
    }

    /// Move from stopped to starting. Returns false when the source is not stopped.
    pub fn begin_start(&self) -> bool {
        let mut state = self.state.write();
        if *state != SourceState::Stopped {
            warn!(source = %self.name, state = ?*state, "Source already started");
            return false;
        }
        *state = SourceState::Starting;
        true
    }

    /// Roll back a failed start
    pub fn abort_start(&self) {
        *self.state.write() = SourceState::Stopped;
    }

    /// Spawn the producer task and mark the source running
    pub fn launch<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()).instrument(self.span.clone()));
        *self.task.lock() = Some((token, handle));
        *self.state.write() = SourceState::Running;
        info!(source = %self.name, "Source started");
    }

    /// Cancel the producer task and wait for it to finish
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                SourceState::Stopped | SourceState::Stopping => return Ok(()),
                _ => *state = SourceState::Stopping,
            }
        }

        let task = self.task.lock().take();
        if let Some((token, mut handle)) = task {
            token.cancel();
            match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(source = %self.name, error = %e, "Source task ended abnormally"),
                Err(_) => {
                    warn!(source = %self.name, "Source task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        *self.state.write() = SourceState::Stopped;
        info!(source = %self.name, "Source stopped");
        Ok(())
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Sleep unless cancelled first. Returns false when cancelled.
pub async fn wait_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
