use std::path::Path;

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use tfl_common::checksum::compute_file_checksum;
use tracing::{debug, info, instrument};

pub mod config;

pub use config::StorageConfig;

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let mut s3_config_builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "tfl-storage");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Streams a local file to `key` without reading it into memory.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<String>,
    ) -> Result<UploadResult> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len() as i64;
        let checksum = compute_file_checksum(path)
            .with_context(|| format!("Failed to checksum {}", path.display()))?;

        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {} for upload", path.display()))?;

        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(size)
            .body(body);

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request.send().await.context("Failed to upload file to S3")?;

        info!(size, "Successfully uploaded to s3://{}/{}", self.bucket, key);

        Ok(UploadResult {
            key: key.to_string(),
            checksum,
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub key: String,
    pub checksum: String,
    pub size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials_client() {
        let storage = Storage::new(StorageConfig::for_minio("http://localhost:9000", "tfl"))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(storage.bucket(), "tfl");
    }
}
