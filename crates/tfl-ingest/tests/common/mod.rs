//! Common test utilities for tfl-ingest integration tests using testcontainers
//!
//! Each test starts its own PostgreSQL (and, where needed, MinIO) container,
//! so tests stay isolated and can run in parallel. Tests that need Docker are
//! marked `#[ignore = "requires Docker"]`; run them with
//! `cargo test -p tfl-ingest -- --ignored`.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use serde_json::Value;
use sqlx::PgPool;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use testcontainers_modules::postgres::Postgres;
use tfl_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tfl_ingest::archive::{ArchiveConfig, ArchiveLayout};
use tfl_ingest::config::{LoadConfig, PipelineConfig};
use tfl_ingest::db::{self, DatabaseConfig};
use tfl_ingest::extract::compress_gzip;
use tfl_ingest::fetch::FetchConfig;
use tfl_ingest::storage::StorageConfig;
use tracing::info;

/// Default S3 bucket name for tests
pub const DEFAULT_TEST_BUCKET: &str = "tfl-test-archive";

const POSTGRES_TAG: &str = "16-alpine";
const MINIO_TAG: &str = "latest";

/// Installs a console subscriber once per test binary.
pub fn init_test_tracing() {
    let config = LogConfig::builder()
        .level(LogLevel::Info)
        .output(LogOutput::Console)
        .build();
    // A second call in the same binary fails; the first subscriber stays.
    let _ = init_logging(&config);
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    config: DatabaseConfig,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag(POSTGRES_TAG)
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let config = DatabaseConfig {
            host: host.to_string(),
            port,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: 4,
            connect_timeout_secs: 30,
        };
        let pool = db::create_pool(&config)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            container,
            config,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn database_config(&self) -> DatabaseConfig {
        self.config.clone()
    }

    /// Pipeline configuration pointing at this container, archival disabled.
    pub fn pipeline_config(&self, local_storage: &Path) -> PipelineConfig {
        PipelineConfig {
            database: self.database_config(),
            load: LoadConfig::default(),
            local_storage: local_storage.to_path_buf(),
            archive: None,
            fetch: FetchConfig::default(),
        }
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .expect("count query failed")
    }
}

// ============================================================================
// MinIO Test Container
// ============================================================================

pub struct TestMinio {
    container: ContainerAsync<GenericImage>,
    config: StorageConfig,
    client: Client,
}

impl TestMinio {
    /// Starts MinIO with the default root credentials and creates the test bucket.
    pub async fn start() -> Result<Self> {
        info!("Starting MinIO test container...");

        let container = GenericImage::new("minio/minio", MINIO_TAG)
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("MinIO Object Storage Server"))
            .with_env_var("MINIO_ROOT_USER", "minioadmin")
            .with_env_var("MINIO_ROOT_PASSWORD", "minioadmin")
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .context("Failed to start MinIO container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get MinIO host")?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .context("Failed to get MinIO port")?;

        let endpoint = format!("http://{host}:{port}");
        let config = StorageConfig::for_minio(endpoint.clone(), DEFAULT_TEST_BUCKET);

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(Credentials::new(
                "minioadmin",
                "minioadmin",
                None,
                None,
                "test",
            ))
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);

        client
            .create_bucket()
            .bucket(DEFAULT_TEST_BUCKET)
            .send()
            .await
            .context("Failed to create test bucket")?;

        Ok(Self {
            container,
            config,
            client,
        })
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self
            .client
            .head_object()
            .bucket(DEFAULT_TEST_BUCKET)
            .key(key)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => false,
            Err(e) => panic!("head_object {key} failed: {e}"),
        }
    }

    pub async fn download(&self, key: &str) -> Vec<u8> {
        self.client
            .get_object()
            .bucket(DEFAULT_TEST_BUCKET)
            .key(key)
            .send()
            .await
            .unwrap_or_else(|e| panic!("get_object {key} failed: {e}"))
            .body
            .collect()
            .await
            .expect("failed to read object body")
            .into_bytes()
            .to_vec()
    }

    pub async fn list(&self, prefix: &str) -> Vec<String> {
        self.client
            .list_objects_v2()
            .bucket(DEFAULT_TEST_BUCKET)
            .prefix(prefix)
            .send()
            .await
            .expect("list_objects_v2 failed")
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(str::to_string))
            .collect()
    }

    pub fn archive_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            storage: self.config.clone(),
            layout: ArchiveLayout::default(),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const CSV_HEADER: &str = "id,lat,lon,location,date,severity,borough,casualties,vehicles";

/// Writes `contents` gzip-compressed to `dir/name`.
pub fn write_gz(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, compress_gzip(contents.as_bytes()).unwrap()).unwrap();
    path
}

/// CSV snapshot with `rows` well-formed accidents, ids starting at `first_id`.
pub fn csv_snapshot(first_id: i32, rows: usize) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for i in 0..rows {
        let id = first_id + i as i32;
        out.push_str(&format!(
            "{id},51.5{i},-0.1{i},\"Junction {id}, Oxford St\",2019-01-{day:02}T08:30:00Z,Slight,Westminster,\
             \"[{{'age': 30, 'class': 'Driver', 'severity': 'Slight'}}]\",\"[{{'type': 'Car'}}]\"\n",
            day = i % 28 + 1,
        ));
    }
    out
}

/// JSON-lines snapshot shaped like the TfL API response.
pub fn jsonl_snapshot(records: &[Value]) -> String {
    records.iter().map(|r| format!("{r}\n")).collect()
}
