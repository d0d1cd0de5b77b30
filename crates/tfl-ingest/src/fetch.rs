//! TfL AccidentStats download
//!
//! Fetches one JSON array per year from `{api_url}/{year}`, tags every record
//! with its `year` and writes it to the scratch directory as
//! `tfl_accidents_{year}.jsonl.gz`, ready for the load stage.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{IngestError, Result};

pub const DEFAULT_API_URL: &str = "https://api.tfl.gov.uk/AccidentStats";
pub const DEFAULT_YEAR: i32 = 2019;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub api_url: String,
    pub start_year: i32,
    pub end_year: i32,
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            start_year: DEFAULT_YEAR,
            end_year: DEFAULT_YEAR,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.start_year > self.end_year {
            return Err(IngestError::Config(format!(
                "START_YEAR ({}) is after END_YEAR ({})",
                self.start_year, self.end_year
            )));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(IngestError::Config(format!(
                "TFL_API_URL must be an http(s) URL, got {:?}",
                self.api_url
            )));
        }
        Ok(())
    }

    pub fn year_url(&self, year: i32) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), year)
    }
}

/// Outcome of a fetch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub files: Vec<PathBuf>,
    pub skipped_years: Vec<i32>,
    pub records: u64,
}

pub struct TflClient {
    client: Client,
    config: FetchConfig,
}

impl TflClient {
    pub fn new(config: FetchConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("tfl-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    /// Downloads one year. `Ok(None)` means the API answered with a
    /// non-success status and the year was skipped.
    pub async fn fetch_year(&self, year: i32) -> Result<Option<Vec<Map<String, Value>>>> {
        let url = self.config.year_url(year);
        info!(year, %url, "Fetching accident data");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(year, status = status.as_u16(), "Failed to fetch year, skipping");
            return Ok(None);
        }

        let mut records: Vec<Map<String, Value>> = response.json().await?;
        for record in &mut records {
            record.insert("year".to_string(), Value::from(year));
        }
        info!(year, records = records.len(), "Fetched accident data");
        Ok(Some(records))
    }

    /// Fetches every configured year into `dir`.
    pub async fn fetch_all(&self, dir: &Path) -> Result<FetchReport> {
        fs::create_dir_all(dir)?;
        let mut report = FetchReport::default();

        for year in self.config.start_year..=self.config.end_year {
            let Some(records) = self.fetch_year(year).await? else {
                report.skipped_years.push(year);
                continue;
            };
            let path = dir.join(format!("tfl_accidents_{year}.jsonl.gz"));
            write_jsonl_gz(&path, &records)?;
            report.records += records.len() as u64;
            report.files.push(path);
        }

        info!(
            files = report.files.len(),
            records = report.records,
            skipped = report.skipped_years.len(),
            "Fetch complete"
        );
        Ok(report)
    }
}

/// Writes `records` as gzip JSON-lines via a `.partial` file and rename.
fn write_jsonl_gz(path: &Path, records: &[Map<String, Value>]) -> Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    if let Err(e) = encode_jsonl_gz(&partial, records) {
        let _ = fs::remove_file(&partial);
        return Err(e.into());
    }
    fs::rename(&partial, path)?;
    Ok(())
}

fn encode_jsonl_gz(path: &Path, records: &[Map<String, Value>]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    for record in records {
        serde_json::to_writer(&mut encoder, record)?;
        encoder.write_all(b"\n")?;
    }
    let file = encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}
