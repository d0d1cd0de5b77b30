//! Configuration management
//!
//! Everything is read from the process environment exactly once, into a
//! [`PipelineConfig`] that is then passed by value. Loading `.env` is the
//! binary's job and happens before any of this runs.
//!
//! The `fetch` subcommand reads only [`FetchSettings`], so a broken
//! database or storage setup never blocks a download.

use std::path::PathBuf;
use std::str::FromStr;

use crate::archive::{ArchiveConfig, ArchiveLayout, DEFAULT_CSV_PREFIX, DEFAULT_JSONL_PREFIX};
use crate::db::{DatabaseConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS};
use crate::error::{IngestError, Result};
use crate::fetch::{FetchConfig, DEFAULT_API_URL, DEFAULT_TIMEOUT_SECS, DEFAULT_YEAR};
use crate::loader::{CommitMode, LoadPolicy, DEFAULT_CHUNK_SIZE};
use crate::staging::TableName;
use crate::storage::StorageConfig;

// ============================================================================
// Defaults
// ============================================================================

/// Default scratch directory for downloaded and extracted snapshots.
pub const DEFAULT_LOCAL_STORAGE: &str = "downloaded_data";

/// Default local database host.
pub const DEFAULT_DB_HOST: &str = "localhost";

/// Default database port.
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default database name and user.
pub const DEFAULT_DB_NAME: &str = "postgres";
pub const DEFAULT_DB_USER: &str = "postgres";

/// Upper bound for `LOAD_CHUNK_SIZE`.
pub const MAX_CHUNK_SIZE: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub table: TableName,
    pub chunk_size: usize,
    pub policy: LoadPolicy,
    pub commit_mode: CommitMode,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            table: TableName::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            policy: LoadPolicy::default(),
            commit_mode: CommitMode::default(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub load: LoadConfig,
    pub local_storage: PathBuf,
    /// `None` disables the archival mirror.
    pub archive: Option<ArchiveConfig>,
    pub fetch: FetchConfig,
}

/// The subset of configuration the `fetch` subcommand needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub fetch: FetchConfig,
    pub local_storage: PathBuf,
}

impl FetchSettings {
    /// Load fetch settings from the process environment
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads and validates only the fetch keys; database and storage keys
    /// are ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = non_blank(lookup);
        let settings = Self::read(&get)?;
        settings.fetch.validate()?;
        Ok(settings)
    }

    fn read<F>(get: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            fetch: FetchConfig {
                api_url: get("TFL_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                start_year: parse_or(get, "START_YEAR", DEFAULT_YEAR)?,
                end_year: parse_or(get, "END_YEAR", DEFAULT_YEAR)?,
                timeout_secs: parse_or(get, "FETCH_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?,
            },
            local_storage: get("LOCAL_STORAGE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_STORAGE)),
        })
    }
}

impl PipelineConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds and validates the configuration from a key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = non_blank(lookup);

        let use_cloud = flag_or(&get, "USE_CLOUD_DB", false)?;
        let prefix = if use_cloud { "CLOUD_DB" } else { "DB" };
        let var = |name: &str| format!("{prefix}_{name}");

        let host = match get(&var("HOST")) {
            Some(host) => host,
            None if use_cloud => {
                return Err(IngestError::Config(
                    "CLOUD_DB_HOST must be set when USE_CLOUD_DB is true".to_string(),
                ))
            },
            None => DEFAULT_DB_HOST.to_string(),
        };

        let database = DatabaseConfig {
            host,
            port: parse_or(&get, &var("PORT"), DEFAULT_DB_PORT)?,
            name: get(&var("NAME")).unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
            user: get(&var("USER")).unwrap_or_else(|| DEFAULT_DB_USER.to_string()),
            password: get(&var("PASSWORD")).unwrap_or_default(),
            max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            connect_timeout_secs: parse_or(&get, "DB_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT_SECS)?,
        };

        let load = LoadConfig {
            table: match get("STAGING_TABLE") {
                Some(name) => name.parse()?,
                None => TableName::default(),
            },
            chunk_size: parse_or(&get, "LOAD_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            policy: parse_or(&get, "LOAD_POLICY", LoadPolicy::default())?,
            commit_mode: parse_or(&get, "LOAD_COMMIT_MODE", CommitMode::default())?,
        };

        let storage = StorageConfig::from_lookup(&get)?;
        let archive_enabled = flag_or(&get, "ARCHIVE_ENABLED", storage.is_some())?;
        let archive = match (archive_enabled, storage) {
            (true, Some(storage)) => Some(ArchiveConfig {
                storage,
                layout: ArchiveLayout {
                    csv_prefix: get("ARCHIVE_CSV_PREFIX")
                        .unwrap_or_else(|| DEFAULT_CSV_PREFIX.to_string()),
                    jsonl_prefix: get("ARCHIVE_JSONL_PREFIX")
                        .unwrap_or_else(|| DEFAULT_JSONL_PREFIX.to_string()),
                },
            }),
            (true, None) => {
                return Err(IngestError::Config(
                    "ARCHIVE_ENABLED is true but neither S3_BUCKET nor GCS_BUCKET is set".to_string(),
                ))
            },
            (false, _) => None,
        };

        let FetchSettings {
            fetch,
            local_storage,
        } = FetchSettings::read(&get)?;

        let config = PipelineConfig {
            database,
            load,
            local_storage,
            archive,
            fetch,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.load.chunk_size == 0 || self.load.chunk_size > MAX_CHUNK_SIZE {
            return Err(IngestError::Config(format!(
                "LOAD_CHUNK_SIZE must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.load.chunk_size
            )));
        }
        if self.database.max_connections == 0 {
            return Err(IngestError::Config(
                "DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        self.fetch.validate()
    }
}

/// Treats blank values as unset.
fn non_blank<F>(lookup: F) -> impl Fn(&str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    move |key: &str| lookup(key).filter(|v| !v.trim().is_empty())
}

/// Parses a boolean flag in any case: `true`/`false`, `1`/`0`, `yes`/`no`.
pub(crate) fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(IngestError::Config(format!(
            "{key}={raw:?} is invalid: expected true or false"
        ))),
    }
}

pub(crate) fn flag_or<F>(get: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_flag(key, &raw),
        None => Ok(default),
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| IngestError::Config(format!("{key}={raw:?} is invalid: {e}"))),
        None => Ok(default),
    }
}
