//! Ingestion manager coordinating every configured source
//!
//! Starts and stops sources in configuration order. A failing source is
//! logged and never prevents the others from running.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::polling::PollingSource;
use super::replay::ReplaySource;
use super::streaming::StreamingSource;
use super::traits::{IngestionSource, SourceKind, SourceStatus};
use crate::config::IngestionConfig;
use crate::stages::RawStage;
use crate::Result;

/// Manager for all ingestion sources
#[derive(Default)]
pub struct IngestionManager {
    sources: Vec<Arc<dyn IngestionSource>>,
}

/// Point-in-time view of ingestion
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub sources: usize,
    pub active: usize,
    pub details: Vec<SourceStatus>,
}

impl IngestionManager {
    /// Create a manager over already-built sources
    pub fn new(sources: Vec<Arc<dyn IngestionSource>>) -> Self {
        Self { sources }
    }

    /// Build one source per configuration entry.
    ///
    /// Unknown source types are skipped with a warning. A known type missing a
    /// required field fails construction.
    pub fn from_config(config: &IngestionConfig, raw: Arc<RawStage>) -> Result<Self> {
        let mut sources: Vec<Arc<dyn IngestionSource>> = Vec::with_capacity(config.sources.len());

        for (index, source_config) in config.sources.iter().enumerate() {
            let kind: SourceKind = match source_config.source_type.parse() {
                Ok(kind) => kind,
                Err(_) => {
                    warn!(
                        source_type = %source_config.source_type,
                        index,
                        "Skipping ingestion source with unknown type"
                    );
                    continue;
                }
            };

            let name = source_config
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", kind, index));

            let source: Arc<dyn IngestionSource> = match kind {
                SourceKind::Streaming => Arc::new(StreamingSource::from_config(name, source_config, Arc::clone(&raw))?),
                SourceKind::Replay => {
                    Arc::new(ReplaySource::from_config(name, source_config, config, Arc::clone(&raw))?)
                }
                SourceKind::Polling => Arc::new(PollingSource::from_config(
                    name,
                    source_config,
                    config.max_retries,
                    Arc::clone(&raw),
                )?),
            };
            sources.push(source);
        }

        info!(sources = sources.len(), "Ingestion manager configured");
        Ok(Self { sources })
    }

    /// Register an additional source; takes effect on the next `start`
    pub fn add_source(&mut self, source: Arc<dyn IngestionSource>) {
        self.sources.push(source);
    }

    /// Start every source, isolating failures
    pub async fn start(&self) -> Result<()> {
        info!(sources = self.sources.len(), "Starting ingestion sources");

        for source in &self.sources {
            if let Err(e) = source.start().await {
                error!(source = source.name(), kind = %source.kind(), error = %e, "Failed to start ingestion source");
            }
        }

        Ok(())
    }

    /// Stop every source, isolating failures
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping ingestion sources");

        for source in &self.sources {
            if let Err(e) = source.stop().await {
                error!(source = source.name(), kind = %source.kind(), error = %e, "Failed to stop ingestion source");
            }
        }

        Ok(())
    }

    pub fn sources(&self) -> &[Arc<dyn IngestionSource>] {
        &self.sources
    }

    pub fn status(&self) -> IngestionStatus {
        let details: Vec<SourceStatus> = self.sources.iter().map(|source| source.status()).collect();
        IngestionStatus {
            sources: self.sources.len(),
            active: self.sources.iter().filter(|source| source.is_running()).count(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawStageConfig, SourceConfig};
    use crate::ingestion::traits::{SourceRuntime, SourceState};
    use crate::storage::MemoryStorage;
    use crate::PipelineError;
    use async_trait::async_trait;

    fn raw_stage() -> Arc<RawStage> {
        Arc::new(RawStage::new(&RawStageConfig::default(), 10, Arc::new(MemoryStorage::new())))
    }

    fn source(source_type: &str, endpoint: Option<&str>) -> SourceConfig {
        SourceConfig {
            source_type: source_type.to_string(),
            endpoint: endpoint.map(str::to_string),
            ..Default::default()
        }
    }

    /// Source whose start always fails
    struct Broken;

    #[async_trait]
    impl IngestionSource for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Polling
        }

        async fn start(&self) -> Result<()> {
            Err(PipelineError::source_connection("broken", "refused"))
        }

        async fn stop(&self) -> Result<()> {
            Err(PipelineError::internal("already gone"))
        }

        fn state(&self) -> SourceState {
            SourceState::Stopped
        }
    }

    /// Source that idles until stopped
    struct Idle {
        runtime: SourceRuntime,
    }

    #[async_trait]
    impl IngestionSource for Idle {
        fn name(&self) -> &str {
            self.runtime.name()
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Streaming
        }

        async fn start(&self) -> Result<()> {
            if self.runtime.begin_start() {
                self.runtime.launch(|token| async move { token.cancelled().await });
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.runtime.shutdown().await
        }

        fn state(&self) -> SourceState {
            self.runtime.state()
        }
    }

    #[test]
    fn test_unknown_source_type_is_skipped() {
        let config = IngestionConfig {
            sources: vec![
                source("carrier-pigeon", None),
                source("replay", Some("http://localhost:8545")),
                source("websocket", Some("ws://localhost:8546")),
            ],
            ..Default::default()
        };

        let manager = IngestionManager::from_config(&config, raw_stage()).unwrap();
        let status = manager.status();
        assert_eq!(status.sources, 2);
        assert_eq!(status.active, 0);
        assert_eq!(status.details[0].name, "replay-1");
        assert_eq!(status.details[0].cursor, Some(0));
        assert_eq!(status.details[1].kind, SourceKind::Streaming);
    }

    #[test]
    fn test_missing_endpoint_fails_construction() {
        let config = IngestionConfig {
            sources: vec![source("streaming", None)],
            ..Default::default()
        };
        assert!(IngestionManager::from_config(&config, raw_stage()).is_err());
    }

    #[tokio::test]
    async fn test_failing_source_does_not_block_others() {
        let idle = Arc::new(Idle {
            runtime: SourceRuntime::new("idle", SourceKind::Streaming),
        });
        let sources: Vec<Arc<dyn IngestionSource>> = vec![Arc::new(Broken), idle.clone()];
        let manager = IngestionManager::new(sources);

        manager.start().await.unwrap();
        assert!(idle.is_running());
        assert_eq!(manager.status().active, 1);

        manager.stop().await.unwrap();
        assert!(!idle.is_running());
        assert_eq!(manager.status().active, 0);
    }
}
