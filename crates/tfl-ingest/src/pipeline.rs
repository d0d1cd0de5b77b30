//! Load-stage orchestration
//!
//! One run: prepare the staging table once, then for every snapshot in the
//! scratch directory archive the raw file, extract it, normalize and load its
//! rows, and archive the normalized output. Stages are awaited one after the
//! other; nothing runs concurrently.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveMirror, NormalizedMirrorWriter};
use crate::config::PipelineConfig;
use crate::db;
use crate::error::{IngestError, Result};
use crate::extract::{discover_sources, extract_gzip, SourceFile};
use crate::loader::{BatchLoader, CopySink, PgCopySink};
use crate::normalize::Normalizer;
use crate::source::RowReader;
use crate::staging::StagingTable;

/// Per-file outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReport {
    pub file: String,
    pub snapshot: String,
    pub rows: u64,
    pub chunks: usize,
    pub malformed_documents: u64,
    pub archived_raw: bool,
    pub archived_normalized: bool,
}

/// An upload that failed without failing the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivalFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileReport>,
    pub rows_loaded: u64,
    pub chunks: usize,
    pub archival_failures: Vec<ArchivalFailure>,
}

impl RunReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            files: Vec::new(),
            rows_loaded: 0,
            chunks: 0,
            archival_failures: Vec::new(),
        }
    }

    fn record_archival(&mut self, err: IngestError) {
        let failure = match err {
            IngestError::Archival { key, message } => ArchivalFailure { key, message },
            other => ArchivalFailure {
                key: String::new(),
                message: other.to_string(),
            },
        };
        warn!(
            run_id = %self.run_id,
            key = %failure.key,
            error = %failure.message,
            "Archive upload failed, continuing"
        );
        self.archival_failures.push(failure);
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    pool: PgPool,
    archive: Option<ArchiveMirror>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, pool: PgPool, archive: Option<ArchiveMirror>) -> Self {
        Self {
            config,
            pool,
            archive,
        }
    }

    /// Connects to the database (and object storage, when configured).
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let pool = db::create_pool(&config.database).await?;
        db::health_check(&pool).await?;
        let archive = match config.archive.clone() {
            Some(archive) => Some(ArchiveMirror::connect(archive).await?),
            None => None,
        };
        Ok(Self::new(config, pool, archive))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn staging_table(&self) -> StagingTable {
        StagingTable::new(self.config.load.table.clone())
    }

    /// Runs the load stage over every snapshot in the scratch directory.
    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::new();
        let load = &self.config.load;
        info!(
            run_id = %report.run_id,
            table = %load.table,
            policy = %load.policy,
            commit_mode = %load.commit_mode,
            chunk_size = load.chunk_size,
            "Starting load run"
        );

        self.staging_table().ensure(&self.pool, load.policy).await?;

        let sources = discover_sources(&self.config.local_storage)?;
        if sources.is_empty() {
            warn!(dir = %self.config.local_storage.display(), "No source files found");
        }

        let sink = PgCopySink::new(
            self.pool.clone(),
            load.table.clone(),
            load.policy,
            load.commit_mode,
        );
        let mut loader = BatchLoader::new(sink, load.chunk_size);

        for source in &sources {
            match self.load_source(&mut loader, source, &mut report).await {
                Ok(file_report) => report.files.push(file_report),
                Err(e) => {
                    loader.rollback().await;
                    return Err(e);
                },
            }
        }

        let totals = loader.finish().await?;
        report.rows_loaded = totals.rows;
        report.chunks = totals.chunks;
        report.finished_at = Utc::now();

        info!(
            run_id = %report.run_id,
            files = report.files.len(),
            rows = report.rows_loaded,
            chunks = report.chunks,
            archival_failures = report.archival_failures.len(),
            "Load run complete"
        );
        Ok(report)
    }

    async fn load_source<S: CopySink>(
        &self,
        loader: &mut BatchLoader<S>,
        source: &SourceFile,
        report: &mut RunReport,
    ) -> Result<FileReport> {
        let mut file_report = FileReport {
            file: source.file_name().to_string(),
            snapshot: source.snapshot.clone(),
            ..Default::default()
        };
        info!(file = %file_report.file, format = ?source.format, "Processing source file");

        // The compressed artifact is deleted by extraction, so it is archived first.
        if let Some(archive) = &self.archive {
            match archive.archive_raw(source).await {
                Ok(_) => file_report.archived_raw = true,
                Err(e) => report.record_archival(e),
            }
        }

        let (path, format) = if source.format.is_compressed() {
            (extract_gzip(&source.path)?, source.format.decompressed())
        } else {
            (source.path.clone(), source.format)
        };

        let mut mirror = match &self.archive {
            Some(_) => match NormalizedMirrorWriter::create(&self.config.local_storage, &source.snapshot) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    report.record_archival(e);
                    None
                },
            },
            None => None,
        };

        let reader = RowReader::open(&path, format)?;
        let mut rows = Normalizer::new(file_report.file.as_str()).normalize_rows(reader);
        let loaded = loader
            .load(rows.by_ref().inspect(|record| {
                if let (Ok(record), Some(writer)) = (record, mirror.as_mut()) {
                    writer.write(record);
                }
            }))
            .await;

        let summary = match loaded {
            Ok(summary) => summary,
            Err(e) => {
                if let Some(writer) = mirror {
                    writer.discard();
                }
                return Err(e);
            },
        };

        let stats = rows.stats();
        file_report.rows = summary.rows;
        file_report.chunks = summary.chunks;
        file_report.malformed_documents = stats.malformed_documents;

        if let (Some(archive), Some(writer)) = (&self.archive, mirror) {
            file_report.archived_normalized = self
                .archive_normalized(archive, writer, &source.snapshot, report)
                .await;
        }

        info!(
            file = %file_report.file,
            rows = file_report.rows,
            chunks = file_report.chunks,
            malformed_documents = file_report.malformed_documents,
            "Source file loaded"
        );
        Ok(file_report)
    }

    async fn archive_normalized(
        &self,
        archive: &ArchiveMirror,
        writer: NormalizedMirrorWriter,
        snapshot: &str,
        report: &mut RunReport,
    ) -> bool {
        let path = match writer.finish() {
            Ok((path, _rows)) => path,
            Err(e) => {
                report.record_archival(e);
                return false;
            },
        };
        let uploaded = archive.archive_normalized(&path, snapshot).await;
        remove_scratch_file(&path);
        match uploaded {
            Ok(_) => true,
            Err(e) => {
                report.record_archival(e);
                false
            },
        }
    }
}

fn remove_scratch_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
    }
}
