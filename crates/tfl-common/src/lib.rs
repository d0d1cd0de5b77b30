//! TfL Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the TfL accident ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error and result types
//! - **Logging**: Tracing subscriber setup driven by `LOG_*` environment variables
//! - **Checksums**: Digests recorded for archived artifacts
//!
//! # Example
//!
//! ```no_run
//! use tfl_common::checksum::compute_file_checksum;
//! use tfl_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<()> {
//!     let digest = compute_file_checksum(path)?;
//!     tracing::info!(%digest, "snapshot fingerprint");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
