use std::fmt;

use crate::config::flag_or;
use crate::error::Result;

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static key pair. When absent the default AWS credential chain is used.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

impl StorageConfig {
    /// Reads `S3_*` settings. The bucket may also be given as `GCS_BUCKET`
    /// for buckets reached through an S3-compatible endpoint.
    ///
    /// Returns `Ok(None)` when no bucket is configured.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(bucket) = lookup("S3_BUCKET").or_else(|| lookup("GCS_BUCKET")) else {
            return Ok(None);
        };
        if bucket.trim().is_empty() {
            return Ok(None);
        }

        let path_style = flag_or(&lookup, "S3_PATH_STYLE", false)?;

        Ok(Some(Self {
            endpoint: lookup("S3_ENDPOINT"),
            region: lookup("S3_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket,
            access_key: lookup("S3_ACCESS_KEY").or_else(|| lookup("AWS_ACCESS_KEY_ID")),
            secret_key: lookup("S3_SECRET_KEY").or_else(|| lookup("AWS_SECRET_ACCESS_KEY")),
            path_style,
        }))
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_REGION.to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }
}
