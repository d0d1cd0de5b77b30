//! TfL accident ingestion pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch pipeline that takes Transport for London AccidentStats snapshots
//! (gzip CSV or JSON-lines), normalizes each record and bulk-loads the result
//! into the PostgreSQL staging table `stg_tfl_accidents`, mirroring raw and
//! normalized artifacts to object storage along the way.
//!
//! # Stages
//!
//! - [`fetch`]: download yearly snapshots from the TfL API
//! - [`extract`]: discover snapshots and decode gzip containers
//! - [`normalize`]: rename and type fields, parse nested documents
//! - [`staging`]: recreate or verify the destination table
//! - [`loader`]: chunked `COPY ... FROM STDIN`
//! - [`archive`]: best-effort uploads to S3-compatible storage
//!
//! [`pipeline::Pipeline`] wires the stages together for one run.

pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod loader;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod source;
pub mod staging;
pub mod storage;

pub use config::PipelineConfig;
pub use error::{ChunkRange, IngestError, Result};
pub use models::AccidentRecord;
pub use pipeline::{Pipeline, RunReport};
