//! Streaming source over a persistent WebSocket connection
//!
//! Every decoded message is stored as one raw record. Connection failures are
//! logged and the connection is reopened after a fixed backoff until the
//! source is stopped.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::increment_counter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::traits::{wait_or_cancel, IngestionSource, SourceKind, SourceRuntime, SourceState};
use crate::config::SourceConfig;
use crate::record::Record;
use crate::stages::RawStage;
use crate::{PipelineError, Result};

const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1000;

pub struct StreamingSource {
    runtime: SourceRuntime,
    endpoint: String,
    subscribe: Option<String>,
    reconnect_backoff: Duration,
    raw: Arc<RawStage>,
}

impl StreamingSource {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, raw: Arc<RawStage>) -> Self {
        Self {
            runtime: SourceRuntime::new(name, SourceKind::Streaming),
            endpoint: endpoint.into(),
            subscribe: None,
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            raw,
        }
    }

    pub fn from_config(name: String, config: &SourceConfig, raw: Arc<RawStage>) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| PipelineError::configuration(format!("streaming source {} requires an endpoint", name)))?;

        let mut source = Self::new(name, endpoint, raw)
            .with_reconnect_backoff(SourceConfig::duration_or(config.reconnect_backoff_ms, DEFAULT_RECONNECT_BACKOFF_MS));
        if let Some(ref message) = config.subscribe {
            source = source.with_subscription(message.clone());
        }
        Ok(source)
    }

    /// Text message sent right after each connection opens
    pub fn with_subscription(mut self, message: impl Into<String>) -> Self {
        self.subscribe = Some(message.into());
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    fn validate_endpoint(&self) -> Result<()> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| PipelineError::configuration(format!("Invalid WebSocket endpoint {}: {}", self.endpoint, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(()),
            scheme => Err(PipelineError::configuration(format!(
                "WebSocket endpoint must use ws or wss, got {}",
                scheme
            ))),
        }
    }

    async fn connection_loop(
        endpoint: String,
        subscribe: Option<String>,
        backoff: Duration,
        raw: Arc<RawStage>,
        token: CancellationToken,
    ) {
        while !token.is_cancelled() {
            match Self::connect_and_handle(&endpoint, subscribe.as_deref(), &raw, &token).await {
                Ok(()) if token.is_cancelled() => break,
                Ok(()) => info!(endpoint = %endpoint, "WebSocket stream ended"),
                Err(e) => {
                    increment_counter!("stratum_source_errors_total", "kind" => "streaming");
                    error!(endpoint = %endpoint, error = %e, "WebSocket connection failed");
                }
            }

            debug!(delay_ms = backoff.as_millis() as u64, "Reconnecting WebSocket");
            if !wait_or_cancel(&token, backoff).await {
                break;
            }
        }
    }

    async fn connect_and_handle(
        endpoint: &str,
        subscribe: Option<&str>,
        raw: &RawStage,
        token: &CancellationToken,
    ) -> Result<()> {
        let connected = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            connected = connect_async(endpoint) => connected,
        };
        let (ws_stream, _) = connected.map_err(|e| PipelineError::source_connection(endpoint, e.to_string()))?;
        info!(endpoint = %endpoint, "WebSocket connected");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        if let Some(message) = subscribe {
            ws_sender.send(Message::Text(message.to_string())).await?;
        }

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => {
                    // Best effort close; the peer may already be gone
                    let _ = ws_sender.send(Message::Close(None)).await;
                    let _ = ws_sender.close().await;
                    return Ok(());
                }
                message = ws_receiver.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => Self::handle_payload(text.as_bytes(), raw).await,
                Some(Ok(Message::Binary(bytes))) => Self::handle_payload(&bytes, raw).await,
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "WebSocket closed by peer");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    async fn handle_payload(payload: &[u8], raw: &RawStage) {
        match parse_message(payload) {
            Ok(Some(record)) => match raw.store(record).await {
                Ok(()) => increment_counter!("stratum_records_ingested_total", "kind" => "streaming"),
                Err(e) => error!(error = %e, "Failed to store streamed record"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Skipping undecodable WebSocket message"),
        }
    }
}

/// Decode one WebSocket payload into a raw record.
///
/// `eth_subscription` notifications are unwrapped to their result; plain
/// JSON-RPC responses (such as subscription confirmations) yield `None`.
pub fn parse_message(payload: &[u8]) -> Result<Option<Record>> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| PipelineError::decode(format!("WebSocket payload is not JSON: {}", e)))?;

    let Value::Object(message) = value else {
        return Err(PipelineError::decode("WebSocket payload is not a JSON object"));
    };

    if message.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        return match message.get("params").and_then(|p| p.get("result")) {
            Some(Value::Object(result)) => Ok(Some(result.clone())),
            Some(other) => {
                let mut record = Record::new();
                record.insert("result".to_string(), other.clone());
                Ok(Some(record))
            }
            None => Err(PipelineError::decode("subscription notification without a result")),
        };
    }

    if message.contains_key("jsonrpc") && message.contains_key("id") && !message.contains_key("method") {
        debug!(id = %message["id"], "Ignoring JSON-RPC response");
        return Ok(None);
    }

    Ok(Some(message))
}

#[async_trait]
impl IngestionSource for StreamingSource {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Streaming
    }

    async fn start(&self) -> Result<()> {
        if !self.runtime.begin_start() {
            return Ok(());
        }
        if let Err(e) = self.validate_endpoint() {
            self.runtime.abort_start();
            return Err(e);
        }

        info!(source = self.name(), endpoint = %self.endpoint, "Starting streaming source");
        let endpoint = self.endpoint.clone();
        let subscribe = self.subscribe.clone();
        let backoff = self.reconnect_backoff;
        let raw = Arc::clone(&self.raw);
        self.runtime
            .launch(move |token| Self::connection_loop(endpoint, subscribe, backoff, raw, token));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.shutdown().await
    }

    fn state(&self) -> SourceState {
        self.runtime.state()
    }
}
