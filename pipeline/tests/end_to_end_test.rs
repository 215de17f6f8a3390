//! End-to-end integration tests
//!
//! Drives records from a replay source through raw, cleaned and feature
//! stages over in-memory and local-file storage.

mod test_utils;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use stratum_pipeline::config::{CursorPolicy, SourceConfig};
use stratum_pipeline::ingestion::{IngestionSource, ReplaySource};
use stratum_pipeline::storage::{MemoryStorage, StoragePort};
use stratum_pipeline::{Pipeline, Stage, ValidationMode};
use test_utils::{fast_config, sample_transaction, wait_until, FixtureChain};

fn block_numbers(records: &[stratum_pipeline::Record]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|r| r.get("blockNumber").and_then(|v| v.as_u64()))
        .collect()
}

#[tokio::test]
async fn test_replay_to_feature_stage() {
    let storage = Arc::new(MemoryStorage::new());
    let mut pipeline = Pipeline::with_storage(fast_config(1), "rust", storage.clone()).unwrap();

    let replay = ReplaySource::new(
        "replay",
        Arc::new(FixtureChain { first: 100, head: 102 }),
        100,
        pipeline.raw_stage(),
    )
    .with_backoff(Duration::from_millis(10), Duration::from_millis(10));
    let replay = Arc::new(replay);
    pipeline.add_source(replay.clone());

    pipeline.start().await.unwrap();
    assert!(pipeline.status().running);

    let reached = wait_until(Duration::from_secs(10), || {
        replay.cursor() == Some(103) && block_numbers(&storage.records(Stage::Feature)).contains(&102)
    })
    .await;
    assert!(reached, "block 102 never reached the feature stage");

    pipeline.stop().await.unwrap();
    assert!(!pipeline.status().running);
    assert!(!replay.is_running());

    // Raw lands every block in cursor order
    assert_eq!(block_numbers(&storage.records(Stage::Raw)), vec![100, 101, 102]);

    let feature = storage
        .records(Stage::Feature)
        .into_iter()
        .find(|r| r["blockNumber"] == json!(102))
        .unwrap();
    assert_eq!(feature["transactionValue"].as_f64(), Some(1e18));
    assert_eq!(feature["gasCost"].as_f64(), Some(1_050_000.0));
    assert!(feature.contains_key("_raw_metadata"));
    assert!(feature.contains_key("_cleaned_metadata"));
    assert_eq!(feature["_feature_metadata"]["featureStore"], json!("feast"));

    let cleaned = storage
        .records(Stage::Cleaned)
        .into_iter()
        .find(|r| r["blockNumber"] == json!(102))
        .unwrap();
    assert_eq!(cleaned["value"], json!("1000000000000000000"));
    assert_eq!(cleaned["gasUsed"], json!(21000));
    assert_eq!(cleaned["_cleaned_metadata"]["validationMode"], json!("strict"));
}

#[tokio::test]
async fn test_lenient_pipeline_skips_bad_records() {
    let mut config = fast_config(3);
    config.processing.cleaned.validation = ValidationMode::Lenient;
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = Pipeline::with_storage(config, "rust", storage.clone()).unwrap();

    // The third record fills the raw buffer, so all three land as one batch
    let raw = pipeline.raw_stage();
    let mut broken = sample_transaction(2);
    broken.remove("hash");
    for record in [sample_transaction(1), broken, sample_transaction(3)] {
        raw.store(record).await.unwrap();
    }
    assert_eq!(storage.batches(Stage::Raw).len(), 1);

    pipeline.start().await.unwrap();

    let cleaned = wait_until(Duration::from_secs(10), || !storage.records(Stage::Cleaned).is_empty()).await;
    pipeline.stop().await.unwrap();
    assert!(cleaned);

    assert_eq!(block_numbers(&storage.records(Stage::Cleaned)), vec![1, 3]);
}

#[tokio::test]
async fn test_unknown_source_type_does_not_stop_others() {
    let mut config = fast_config(10);
    config.ingestion.sources = vec![
        SourceConfig {
            source_type: "carrier-pigeon".to_string(),
            ..Default::default()
        },
        SourceConfig {
            source_type: "polling".to_string(),
            endpoint: Some("http://127.0.0.1:9/prices".to_string()),
            poll_interval_ms: Some(60_000),
            error_backoff_ms: Some(60_000),
            ..Default::default()
        },
    ];

    let pipeline = Pipeline::with_storage(config, "rust", Arc::new(MemoryStorage::new())).unwrap();
    assert_eq!(pipeline.status().ingestion.sources, 1);

    pipeline.start().await.unwrap();
    assert_eq!(pipeline.status().ingestion.active, 1);
    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.status().ingestion.active, 0);
}

#[tokio::test]
async fn test_file_backend_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(2);
    config.storage.backend = "file".to_string();
    config.storage.connection_string = Some(dir.path().to_string_lossy().into_owned());
    // Only capacity and shutdown flush, so the batch layout is deterministic
    config.processing.advance.flush_interval_ms = 60_000;

    // First run replays 100..=102 and stops; the odd record is flushed on stop
    {
        let mut pipeline = Pipeline::new(config.clone(), "rust").await.unwrap();
        let replay = Arc::new(
            ReplaySource::new(
                "replay",
                Arc::new(FixtureChain { first: 100, head: 102 }),
                100,
                pipeline.raw_stage(),
            )
            .with_cursor_policy(CursorPolicy::Resume)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(10)),
        );
        pipeline.add_source(replay.clone());

        pipeline.start().await.unwrap();
        assert!(wait_until(Duration::from_secs(10), || replay.cursor() == Some(103)).await);
        pipeline.stop().await.unwrap();
    }

    let raw_files = std::fs::read_dir(dir.path().join("raw")).unwrap().count();
    assert_eq!(raw_files, 2);

    // Second run resumes after the highest durable block
    let mut pipeline = Pipeline::new(config, "rust").await.unwrap();
    let latest = pipeline.storage().read(Stage::Raw, 100).await.unwrap().unwrap();
    assert_eq!(block_numbers(&latest), vec![102]);

    let replay = Arc::new(
        ReplaySource::new(
            "replay",
            Arc::new(FixtureChain { first: 100, head: 102 }),
            100,
            pipeline.raw_stage(),
        )
        .with_cursor_policy(CursorPolicy::Resume)
        .with_backoff(Duration::from_secs(60), Duration::from_secs(60)),
    );
    pipeline.add_source(replay.clone());
    pipeline.start().await.unwrap();
    assert_eq!(replay.cursor(), Some(103));
    pipeline.stop().await.unwrap();
}
