//! Error types for the ingestion pipeline
//!
//! Every failure carries the stage it came from so the binary can report it in
//! one line before exiting non-zero.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Position of a chunk within a run: zero-based index plus the half-open
/// range of row offsets it covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk {} (rows {}..{})", self.index, self.start, self.end)
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record {record}: invalid {field}: {message}")]
    Normalization {
        record: String,
        field: &'static str,
        message: String,
    },

    #[error("staging table {table} could not be prepared: {source}")]
    Schema {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("{chunk} rejected by the database: {source}")]
    Load {
        chunk: ChunkRange,
        #[source]
        source: sqlx::Error,
    },

    #[error("commit of {rows} rows failed: {source}")]
    Commit {
        rows: u64,
        #[source]
        source: sqlx::Error,
    },

    #[error("archive upload of {key} failed: {message}")]
    Archival { key: String, message: String },

    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Pipeline stage the error belongs to
    pub fn stage(&self) -> &'static str {
        match self {
            IngestError::Decode { .. } => "extraction",
            IngestError::Normalization { .. } => "normalization",
            IngestError::Schema { .. } => "schema",
            IngestError::Load { .. } => "load",
            IngestError::Commit { .. } => "commit",
            IngestError::Archival { .. } => "archival",
            IngestError::Connect(_) => "connect",
            IngestError::Config(_) => "config",
            IngestError::Fetch(_) => "fetch",
            IngestError::Io(_) => "io",
        }
    }

    pub(crate) fn normalization(
        record: impl fmt::Display,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        IngestError::Normalization {
            record: record.to_string(),
            field,
            message: message.into(),
        }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Decode {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
