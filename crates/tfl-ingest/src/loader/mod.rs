//! Chunked bulk loader
//!
//! [`BatchLoader`] pulls records from a lazy iterator, encodes them into one
//! COPY buffer at a time and hands each full buffer to a [`CopySink`]. Chunks
//! are sent strictly in production order and the loader stops at the first
//! chunk the destination rejects.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use crate::error::{ChunkRange, IngestError, Result};
use crate::models::StagingColumn;
use crate::staging::TableName;

pub mod copy;

pub use copy::{ChunkBuffer, CopyRow, CopyRowWriter};

pub const DEFAULT_CHUNK_SIZE: usize = 5000;

/// Rough per-row size used to pre-allocate the chunk buffer.
const ESTIMATED_ROW_BYTES: usize = 512;
const MAX_PREALLOCATED_BYTES: usize = 16 * 1024 * 1024;

/// How a run keeps the staging table free of duplicate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Drop and recreate the table, then COPY straight into it.
    #[default]
    ReplaceAll,
    /// Keep the table and upsert on `accident_id`.
    UpsertByKey,
}

impl FromStr for LoadPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace_all" | "replace" => Ok(LoadPolicy::ReplaceAll),
            "upsert_by_key" | "upsert" => Ok(LoadPolicy::UpsertByKey),
            other => Err(IngestError::Config(format!(
                "unknown load policy {other:?}, expected replace_all or upsert_by_key"
            ))),
        }
    }
}

impl fmt::Display for LoadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadPolicy::ReplaceAll => "replace_all",
            LoadPolicy::UpsertByKey => "upsert_by_key",
        })
    }
}

/// Transaction boundary for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// One transaction for the whole run; an aborted run leaves no rows.
    #[default]
    SingleRun,
    /// Commit after every chunk; chunks before a failure stay committed.
    PerChunk,
}

impl FromStr for CommitMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single_run" | "single" => Ok(CommitMode::SingleRun),
            "per_chunk" | "chunk" => Ok(CommitMode::PerChunk),
            other => Err(IngestError::Config(format!(
                "unknown commit mode {other:?}, expected single_run or per_chunk"
            ))),
        }
    }
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommitMode::SingleRun => "single_run",
            CommitMode::PerChunk => "per_chunk",
        })
    }
}

/// Destination of encoded chunks.
#[async_trait]
pub trait CopySink: Send {
    /// Sends one chunk of COPY text rows for `columns`. Returns the number of
    /// rows the destination accepted.
    async fn copy_chunk(&mut self, columns: &[&str], data: &[u8]) -> std::result::Result<u64, sqlx::Error>;

    /// Makes every accepted chunk durable.
    async fn commit(&mut self) -> std::result::Result<(), sqlx::Error>;

    /// Discards any chunk not yet committed.
    async fn rollback(&mut self) -> std::result::Result<(), sqlx::Error>;
}

/// PostgreSQL sink using `COPY ... FROM STDIN`.
pub struct PgCopySink {
    pool: PgPool,
    table: TableName,
    policy: LoadPolicy,
    commit_mode: CommitMode,
    tx: Option<Transaction<'static, Postgres>>,
}

const UPSERT_BUFFER_TABLE: &str = "tfl_load_buffer";

impl PgCopySink {
    pub fn new(pool: PgPool, table: TableName, policy: LoadPolicy, commit_mode: CommitMode) -> Self {
        Self {
            pool,
            table,
            policy,
            commit_mode,
            tx: None,
        }
    }

    async fn copy_into(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        columns: &[&str],
        data: &[u8],
    ) -> std::result::Result<u64, sqlx::Error> {
        let column_list = columns.join(", ");
        let target = match self.policy {
            LoadPolicy::ReplaceAll => self.table.to_string(),
            LoadPolicy::UpsertByKey => {
                sqlx::query(&format!(
                    "CREATE TEMP TABLE IF NOT EXISTS {UPSERT_BUFFER_TABLE} \
                     (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
                    self.table
                ))
                .execute(&mut **tx)
                .await?;
                UPSERT_BUFFER_TABLE.to_string()
            },
        };

        let mut copy = tx
            .copy_in_raw(&format!("COPY {target} ({column_list}) FROM STDIN"))
            .await?;
        copy.send(data).await?;
        let rows = copy.finish().await?;

        if self.policy == LoadPolicy::UpsertByKey {
            sqlx::query(&upsert_sql(&self.table, columns))
                .execute(&mut **tx)
                .await?;
            sqlx::query(&format!("TRUNCATE {UPSERT_BUFFER_TABLE}"))
                .execute(&mut **tx)
                .await?;
        }

        Ok(rows)
    }
}

fn upsert_sql(table: &TableName, columns: &[&str]) -> String {
    let key = StagingColumn::AccidentId.name();
    let column_list = columns.join(", ");
    let updates = columns
        .iter()
        .filter(|c| **c != key)
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({column_list}) SELECT {column_list} FROM {UPSERT_BUFFER_TABLE} \
         ON CONFLICT ({key}) DO UPDATE SET {updates}"
    )
}

#[async_trait]
impl CopySink for PgCopySink {
    async fn copy_chunk(&mut self, columns: &[&str], data: &[u8]) -> std::result::Result<u64, sqlx::Error> {
        let mut tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };

        match self.copy_into(&mut tx, columns, data).await {
            Ok(rows) => {
                match self.commit_mode {
                    CommitMode::PerChunk => tx.commit().await?,
                    CommitMode::SingleRun => self.tx = Some(tx),
                }
                Ok(rows)
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed chunk also failed");
                }
                Err(e)
            },
        }
    }

    async fn commit(&mut self) -> std::result::Result<(), sqlx::Error> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> std::result::Result<(), sqlx::Error> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

/// Totals reported by a loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub rows: u64,
    pub chunks: usize,
}

pub struct BatchLoader<S> {
    sink: S,
    chunk_size: usize,
    buffer: ChunkBuffer,
    next_chunk: usize,
    rows_sent: u64,
}

impl<S: CopySink> BatchLoader<S> {
    pub fn new(sink: S, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let capacity = chunk_size
            .saturating_mul(ESTIMATED_ROW_BYTES)
            .min(MAX_PREALLOCATED_BYTES);
        Self {
            sink,
            chunk_size,
            buffer: ChunkBuffer::with_capacity(capacity),
            next_chunk: 0,
            rows_sent: 0,
        }
    }

    /// Loads every record from `records`, one chunk at a time.
    ///
    /// May be called once per source file; chunk numbering and row offsets
    /// continue across calls. An error item from the iterator rolls back
    /// uncommitted work and is returned as-is.
    pub async fn load<R, I>(&mut self, records: I) -> Result<LoadSummary>
    where
        R: CopyRow,
        I: IntoIterator<Item = Result<R>>,
    {
        let start_rows = self.rows_sent;
        let start_chunk = self.next_chunk;

        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    self.buffer.clear();
                    self.rollback().await;
                    return Err(e);
                },
            };
            self.buffer.push(&record);
            if self.buffer.rows() as usize >= self.chunk_size {
                self.flush(R::COLUMNS).await?;
            }
        }

        if !self.buffer.is_empty() {
            self.flush(R::COLUMNS).await?;
        }

        Ok(LoadSummary {
            rows: self.rows_sent - start_rows,
            chunks: self.next_chunk - start_chunk,
        })
    }

    async fn flush(&mut self, columns: &[&str]) -> Result<()> {
        let chunk = ChunkRange {
            index: self.next_chunk,
            start: self.rows_sent,
            end: self.rows_sent + self.buffer.rows(),
        };

        debug!(chunk = chunk.index, rows = self.buffer.rows(), "Sending chunk");

        match self.sink.copy_chunk(columns, self.buffer.as_bytes()).await {
            Ok(accepted) => {
                info!(
                    chunk = chunk.index,
                    rows = accepted,
                    first_row = chunk.start,
                    last_row = chunk.end,
                    "Chunk loaded"
                );
                self.rows_sent = chunk.end;
                self.next_chunk += 1;
                self.buffer.clear();
                Ok(())
            },
            Err(source) => {
                self.buffer.clear();
                self.rollback().await;
                Err(IngestError::Load { chunk, source })
            },
        }
    }

    /// Discards uncommitted chunks. Safe to call more than once.
    pub async fn rollback(&mut self) {
        if let Err(e) = self.sink.rollback().await {
            warn!(error = %e, "Rollback of uncommitted chunks failed");
        }
    }

    /// Commits everything sent so far and returns the run totals.
    pub async fn finish(mut self) -> Result<LoadSummary> {
        let rows = self.rows_sent;
        self.sink
            .commit()
            .await
            .map_err(|source| IngestError::Commit { rows, source })?;
        Ok(LoadSummary {
            rows,
            chunks: self.next_chunk,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::AccidentRecord;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<u64>,
        fail_on: Option<usize>,
        commits: usize,
        rollbacks: usize,
    }

    #[async_trait]
    impl CopySink for RecordingSink {
        async fn copy_chunk(&mut self, columns: &[&str], data: &[u8]) -> std::result::Result<u64, sqlx::Error> {
            assert_eq!(columns.len(), 9);
            if self.fail_on == Some(self.chunks.len()) {
                self.chunks.push(0);
                return Err(sqlx::Error::Protocol("invalid input syntax".to_string()));
            }
            let rows = data.iter().filter(|b| **b == b'\n').count() as u64;
            self.chunks.push(rows);
            Ok(rows)
        }

        async fn commit(&mut self) -> std::result::Result<(), sqlx::Error> {
            self.commits += 1;
            Ok(())
        }

        async fn rollback(&mut self) -> std::result::Result<(), sqlx::Error> {
            self.rollbacks += 1;
            Ok(())
        }
    }

    fn records(n: i32) -> impl Iterator<Item = Result<AccidentRecord>> {
        (0..n).map(|id| Ok(AccidentRecord::new(id)))
    }

    #[tokio::test]
    async fn test_ten_thousand_rows_in_four_chunks() {
        let mut loader = BatchLoader::new(RecordingSink::default(), 2500);
        let summary = loader.load(records(10_000)).await.unwrap();

        assert_eq!(summary, LoadSummary { rows: 10_000, chunks: 4 });
        assert_eq!(loader.sink().chunks, vec![2500, 2500, 2500, 2500]);

        let totals = loader.finish().await.unwrap();
        assert_eq!(totals.rows, 10_000);
    }

    #[tokio::test]
    async fn test_partial_last_chunk() {
        let mut loader = BatchLoader::new(RecordingSink::default(), 2500);
        loader.load(records(10_001)).await.unwrap();
        assert_eq!(loader.sink().chunks, vec![2500, 2500, 2500, 2500, 1]);
    }

    #[tokio::test]
    async fn test_empty_input_sends_nothing() {
        let mut loader = BatchLoader::new(RecordingSink::default(), 100);
        let summary = loader.load(records(0)).await.unwrap();
        assert_eq!(summary, LoadSummary::default());
        assert!(loader.sink().chunks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_chunk_stops_the_load() {
        let sink = RecordingSink {
            fail_on: Some(1),
            ..Default::default()
        };
        let mut loader = BatchLoader::new(sink, 2500);

        let err = loader.load(records(10_000)).await.unwrap_err();
        match err {
            IngestError::Load { chunk, .. } => {
                assert_eq!(
                    chunk,
                    ChunkRange {
                        index: 1,
                        start: 2500,
                        end: 5000
                    }
                );
            },
            other => panic!("expected load error, got {other:?}"),
        }

        // chunk 0 sent, chunk 1 attempted, nothing after
        assert_eq!(loader.sink().chunks.len(), 2);
        assert_eq!(loader.sink().rollbacks, 1);
        assert_eq!(loader.sink().commits, 0);
    }

    #[tokio::test]
    async fn test_normalization_error_aborts() {
        let mut loader = BatchLoader::new(RecordingSink::default(), 2);
        let input = (0..10).map(|id| {
            if id == 5 {
                Err(IngestError::normalization("line 6", "accident_id", "missing"))
            } else {
                Ok(AccidentRecord::new(id))
            }
        });

        let err = loader.load(input).await.unwrap_err();
        assert_eq!(err.stage(), "normalization");
        assert_eq!(loader.sink().chunks, vec![2, 2]);
        assert_eq!(loader.sink().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_chunk_numbering_continues_across_files() {
        let mut loader = BatchLoader::new(RecordingSink::default(), 3);
        let first = loader.load(records(4)).await.unwrap();
        assert_eq!(first, LoadSummary { rows: 4, chunks: 2 });

        let sink = RecordingSink {
            fail_on: Some(3),
            ..Default::default()
        };
        let mut failing = BatchLoader::new(sink, 3);
        failing.load(records(4)).await.unwrap();
        let err = failing.load(records(5)).await.unwrap_err();
        match err {
            IngestError::Load { chunk, .. } => {
                assert_eq!(chunk.index, 3);
                assert_eq!(chunk.start, 7);
                assert_eq!(chunk.end, 9);
            },
            other => panic!("expected load error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finish_commits_once() {
        let mut loader = BatchLoader::new(RecordingSink::default(), 10);
        loader.load(records(25)).await.unwrap();
        let sink_commits_before = loader.sink().commits;
        let summary = loader.finish().await.unwrap();
        assert_eq!(sink_commits_before, 0);
        assert_eq!(summary, LoadSummary { rows: 25, chunks: 3 });
    }

    #[test]
    fn test_policy_and_mode_parsing() {
        assert_eq!("replace_all".parse::<LoadPolicy>().unwrap(), LoadPolicy::ReplaceAll);
        assert_eq!("UPSERT_BY_KEY".parse::<LoadPolicy>().unwrap(), LoadPolicy::UpsertByKey);
        assert!("merge".parse::<LoadPolicy>().is_err());

        assert_eq!("per_chunk".parse::<CommitMode>().unwrap(), CommitMode::PerChunk);
        assert_eq!(CommitMode::default(), CommitMode::SingleRun);
        assert!("never".parse::<CommitMode>().is_err());
    }

    #[test]
    fn test_upsert_sql() {
        let sql = upsert_sql(&TableName::default(), &["accident_id", "lat", "casualties"]);
        assert_eq!(
            sql,
            "INSERT INTO public.stg_tfl_accidents (accident_id, lat, casualties) \
             SELECT accident_id, lat, casualties FROM tfl_load_buffer \
             ON CONFLICT (accident_id) DO UPDATE SET lat = EXCLUDED.lat, casualties = EXCLUDED.casualties"
        );
    }
}
