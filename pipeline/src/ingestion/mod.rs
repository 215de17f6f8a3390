//! Ingestion sources feeding the raw stage
//!
//! Three source kinds are built in: WebSocket streaming, cursor-based block
//! replay over JSON-RPC, and periodic HTTP polling. Custom sources implement
//! [`IngestionSource`] and are registered with the [`IngestionManager`].

pub mod manager;
pub mod polling;
pub mod replay;
pub mod streaming;
pub mod traits;

pub use manager::{IngestionManager, IngestionStatus};
pub use polling::{HttpSnapshotProvider, PollingSource, SnapshotProvider};
pub use replay::{BlockFetcher, JsonRpcBlockFetcher, ReplaySource};
pub use streaming::StreamingSource;
pub use traits::{IngestionSource, SourceKind, SourceRuntime, SourceState, SourceStatus};
