//! Test utilities and helpers
//!
//! Common fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use stratum_pipeline::config::PipelineConfig;
use stratum_pipeline::ingestion::BlockFetcher;
use stratum_pipeline::{Record, Result};

/// A transaction-shaped raw record as a JSON-RPC node would return it
pub fn sample_transaction(block_number: u64) -> Record {
    json!({
        "number": format!("{:#x}", block_number),
        "hash": format!("0x{:064x}", block_number),
        "timestamp": format!("{:#x}", 1_700_000_000 + block_number * 12),
        "from": format!("0x{:040x}", block_number % 3),
        "to": "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2",
        "value": "0xde0b6b3a7640000",
        "gas": "0x5208",
        "gasPrice": "0x32",
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

/// Configuration with short intervals so tests settle quickly
pub fn fast_config(batch_size: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.storage.backend = "memory".to_string();
    config.ingestion.batch_size = batch_size;
    config.processing.advance.idle_backoff_ms = 10;
    config.processing.advance.error_backoff_ms = 10;
    config.processing.advance.flush_interval_ms = 50;
    config
}

/// Chain with blocks `first..=head`; later positions have no data yet
pub struct FixtureChain {
    pub first: u64,
    pub head: u64,
}

#[async_trait]
impl BlockFetcher for FixtureChain {
    async fn fetch(&self, cursor: u64) -> Result<Option<Record>> {
        if cursor < self.first || cursor > self.head {
            return Ok(None);
        }
        let mut record = sample_transaction(cursor);
        record.insert("blockNumber".to_string(), json!(cursor));
        Ok(Some(record))
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` expires
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
