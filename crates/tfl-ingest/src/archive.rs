//! Archival mirror
//!
//! Copies raw snapshots and the normalized JSON-lines output to object
//! storage. Uploads are best-effort: callers log and record failures, and a
//! failed upload never fails the run.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::extract::{SourceFile, SourceFormat};
use crate::models::AccidentRecord;
use crate::storage::{Storage, StorageConfig, UploadResult};

pub const DEFAULT_CSV_PREFIX: &str = "raw/csv";
pub const DEFAULT_JSONL_PREFIX: &str = "raw/jsonl";

const NORMALIZED_SUFFIX: &str = ".normalized.jsonl.gz";
const MIRROR_DIR: &str = ".normalized";

/// Object storage used by the mirror.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> anyhow::Result<UploadResult>;
}

#[async_trait]
impl ObjectStore for Storage {
    fn bucket(&self) -> &str {
        Storage::bucket(self)
    }

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> anyhow::Result<UploadResult> {
        self.upload_file(key, path, Some(content_type.to_string())).await
    }
}

/// Key prefixes for archived artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub csv_prefix: String,
    pub jsonl_prefix: String,
}

impl Default for ArchiveLayout {
    fn default() -> Self {
        Self {
            csv_prefix: DEFAULT_CSV_PREFIX.to_string(),
            jsonl_prefix: DEFAULT_JSONL_PREFIX.to_string(),
        }
    }
}

impl ArchiveLayout {
    /// `{prefix}/{snapshot}/{file_name}`, prefix chosen by source format.
    pub fn raw_key(&self, source: &SourceFile) -> String {
        let prefix = if source.format.is_csv() {
            &self.csv_prefix
        } else {
            &self.jsonl_prefix
        };
        join_key(prefix, &source.snapshot, source.file_name())
    }

    pub fn normalized_key(&self, snapshot: &str) -> String {
        join_key(
            &self.jsonl_prefix,
            snapshot,
            &format!("{snapshot}{NORMALIZED_SUFFIX}"),
        )
    }
}

fn join_key(prefix: &str, snapshot: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{snapshot}/{name}")
    } else {
        format!("{prefix}/{snapshot}/{name}")
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub storage: StorageConfig,
    pub layout: ArchiveLayout,
}

pub struct ArchiveMirror {
    store: Arc<dyn ObjectStore>,
    layout: ArchiveLayout,
}

impl ArchiveMirror {
    pub fn new(store: Arc<dyn ObjectStore>, layout: ArchiveLayout) -> Self {
        Self { store, layout }
    }

    /// Builds an S3-backed mirror.
    pub async fn connect(config: ArchiveConfig) -> Result<Self> {
        let storage = Storage::new(config.storage)
            .await
            .map_err(|e| IngestError::Config(format!("object storage: {e:#}")))?;
        Ok(Self::new(Arc::new(storage), config.layout))
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Uploads a raw source snapshot as-is.
    pub async fn archive_raw(&self, source: &SourceFile) -> Result<UploadResult> {
        let key = self.layout.raw_key(source);
        self.put(&key, &source.path, content_type(source.format)).await
    }

    /// Uploads the gzip JSON-lines mirror produced by [`NormalizedMirrorWriter`].
    pub async fn archive_normalized(&self, path: &Path, snapshot: &str) -> Result<UploadResult> {
        let key = self.layout.normalized_key(snapshot);
        self.put(&key, path, "application/gzip").await
    }

    async fn put(&self, key: &str, path: &Path, content_type: &str) -> Result<UploadResult> {
        let result = self
            .store
            .put_file(key, path, content_type)
            .await
            .map_err(|e| IngestError::Archival {
                key: key.to_string(),
                message: format!("{e:#}"),
            })?;
        info!(
            bucket = self.store.bucket(),
            key,
            size = result.size,
            checksum = %result.checksum,
            "Archived artifact"
        );
        Ok(result)
    }
}

fn content_type(format: SourceFormat) -> &'static str {
    match format {
        SourceFormat::CsvGz | SourceFormat::JsonlGz => "application/gzip",
        SourceFormat::Csv => "text/csv",
        SourceFormat::Jsonl => "application/x-ndjson",
    }
}

/// Writes normalized records as gzip JSON-lines while they stream to the
/// loader.
///
/// The first write error is kept and later writes are skipped, so a mirror
/// failure never interrupts the load; [`finish`](Self::finish) reports it.
pub struct NormalizedMirrorWriter {
    path: PathBuf,
    encoder: Option<GzEncoder<BufWriter<File>>>,
    rows: u64,
    error: Option<io::Error>,
}

impl NormalizedMirrorWriter {
    /// Creates `<dir>/.normalized/<snapshot>.normalized.jsonl.gz`.
    pub fn create(dir: &Path, snapshot: &str) -> Result<Self> {
        let mirror_dir = dir.join(MIRROR_DIR);
        fs::create_dir_all(&mirror_dir)?;
        let path = mirror_dir.join(format!("{snapshot}{NORMALIZED_SUFFIX}"));
        let file = File::create(&path)?;
        Ok(Self {
            path,
            encoder: Some(GzEncoder::new(BufWriter::new(file), Compression::default())),
            rows: 0,
            error: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, record: &AccidentRecord) {
        if self.error.is_some() {
            return;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        let outcome = serde_json::to_writer(&mut *encoder, record)
            .map_err(io::Error::from)
            .and_then(|()| encoder.write_all(b"\n"));
        match outcome {
            Ok(()) => self.rows += 1,
            Err(e) => self.error = Some(e),
        }
    }

    /// Flushes the gzip stream and returns the file path with its row count.
    pub fn finish(mut self) -> Result<(PathBuf, u64)> {
        let key = self.path.display().to_string();
        if let Some(e) = self.error.take() {
            let _ = fs::remove_file(&self.path);
            return Err(IngestError::Archival {
                key,
                message: format!("writing normalized mirror: {e}"),
            });
        }
        if let Some(encoder) = self.encoder.take() {
            let flushed = encoder
                .finish()
                .and_then(|w| w.into_inner().map_err(|e| e.into_error()));
            if let Err(e) = flushed {
                let _ = fs::remove_file(&self.path);
                return Err(IngestError::Archival {
                    key,
                    message: format!("flushing normalized mirror: {e}"),
                });
            }
        }
        debug!(path = %self.path.display(), rows = self.rows, "Normalized mirror written");
        Ok((self.path.clone(), self.rows))
    }

    /// Removes the partially written mirror.
    pub fn discard(mut self) {
        self.encoder.take();
        let _ = fs::remove_file(&self.path);
    }
}
