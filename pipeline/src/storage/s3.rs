//! S3-compatible object store backend
//!
//! Keys: `<prefix><stage>/<stamp>.json`, one object per batch. The latest
//! batch is the lexicographically greatest key under the stage prefix.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info};

use super::traits::{StoragePort, StorageResult};
use super::BatchClock;
use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::record::{Batch, Record};
use crate::Stage;

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
    clock: BatchClock,
}

impl S3Storage {
    /// Build a client from explicit credentials when configured, otherwise from
    /// the ambient AWS environment
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| StorageError::backend("s3", "bucket is not configured"))?;
        let region = Region::new(config.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string()));

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "stratum-storage");
                aws_sdk_s3::Config::builder()
                    .credentials_provider(credentials)
                    .region(region)
            }
            _ => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %bucket, "Object store client initialized");

        Ok(Self::from_client(client, bucket, config.prefix.clone().unwrap_or_default()))
    }

    pub fn from_client(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
            clock: BatchClock::new(),
        }
    }

    fn stage_prefix(&self, stage: Stage) -> String {
        format!("{}{}/", self.prefix, stage.name())
    }

    async fn latest_key(&self, stage: Stage) -> StorageResult<Option<String>> {
        let prefix = self.stage_prefix(stage);
        let mut latest: Option<String> = None;
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(&prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::object_store(format!("Failed to list {}: {}", prefix, e)))?;

            for key in response.contents().iter().filter_map(|object| object.key()) {
                if key.ends_with(".json") && latest.as_deref().map_or(true, |current| key > current) {
                    latest = Some(key.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(latest)
    }
}

#[async_trait]
impl StoragePort for S3Storage {
    fn backend(&self) -> &'static str {
        "s3"
    }

    async fn write(&self, stage: Stage, batch: &[Record]) -> StorageResult<()> {
        let key = format!("{}{}.json", self.stage_prefix(stage), self.clock.next_stamp());
        let body = serde_json::to_vec(batch)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StorageError::object_store(format!("Failed to upload {}: {}", key, e)))?;

        debug!(stage = %stage, records = batch.len(), key = %key, "Uploaded batch object");
        Ok(())
    }

    async fn read(&self, stage: Stage, limit: usize) -> StorageResult<Option<Batch>> {
        let Some(key) = self.latest_key(stage).await? else {
            return Ok(None);
        };

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StorageError::object_store(format!("Failed to download {}: {}", key, e)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::object_store(format!("Failed to read {}: {}", key, e)))?
            .into_bytes();

        let mut batch: Batch = serde_json::from_slice(&data)?;
        batch.truncate(limit);
        Ok(Some(batch))
    }
}
