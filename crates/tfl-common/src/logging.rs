//! Logging Configuration and Initialization
//!
//! Centralized `tracing` setup for every binary in the workspace. It supports:
//!
//! - Console, file (daily rotation) or both
//! - Human-readable text or JSON lines
//! - Level and per-module filter directives
//! - Overrides from `LOG_*` environment variables
//!
//! Use the structured macros (`info!`, `warn!`, ...) with fields rather than
//! `println!`:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! # let (rows, chunk, key) = (2500, 3, "raw/csv/tfl_accidents_2019");
//! info!(rows, chunk, "Chunk loaded");
//! warn!(%key, "Archive upload failed");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tfl_common::logging::{init_logging, LogConfig, LogLevel};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::builder()
//!         .level(LogLevel::Debug)
//!         .log_file_prefix("tfl-ingest")
//!         .build()
//!         .with_env_overrides()?;
//!
//!     // Keep the guard alive so buffered file output is flushed on exit
//!     let _guard = init_logging(&config)?;
//!
//!     info!("Pipeline started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Very detailed trace-level logging
    Trace,
    /// Debug-level logging for development
    Debug,
    /// Informational messages
    #[default]
    Info,
    /// Warning messages
    Warn,
    /// Error messages
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Output target for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Output to console only
    #[default]
    Console,
    /// Output to file only
    File,
    /// Output to both console and file
    Both,
}

impl LogOutput {
    fn writes_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn writes_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(anyhow::anyhow!("Invalid log output: {}", s)),
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,

    /// Output target (console, file, or both)
    pub output: LogOutput,

    /// Log format (text or JSON)
    pub format: LogFormat,

    /// Directory for log files (only used when output includes file)
    pub log_dir: PathBuf,

    /// Log file name prefix (e.g., "tfl-ingest" -> "tfl-ingest.2024-01-18")
    pub log_file_prefix: String,

    /// Additional filter directives (e.g., "sqlx=warn,aws_config=warn")
    pub filter_directives: Option<String>,

    /// Whether to include file and line number in logs
    pub include_location: bool,

    /// Whether to include target module names in logs
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "tfl".to_string(),
            filter_directives: None,
            include_location: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    /// Create a builder for fluent configuration
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Apply `LOG_*` environment variables on top of this configuration
    ///
    /// Environment variables:
    /// - `LOG_LEVEL`: Log level (trace, debug, info, warn, error)
    /// - `LOG_OUTPUT`: Output target (console, file, both)
    /// - `LOG_FORMAT`: Log format (text, json)
    /// - `LOG_DIR`: Directory for log files
    /// - `LOG_FILE_PREFIX`: Prefix for log files
    /// - `LOG_FILTER`: Additional filter directives
    /// - `LOG_INCLUDE_LOCATION`: Include file/line in logs (true/false)
    /// - `LOG_INCLUDE_TARGETS`: Include module targets (true/false)
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("LOG_LEVEL") {
            self.level = level.parse()?;
        }

        if let Some(output) = lookup("LOG_OUTPUT") {
            self.output = output.parse()?;
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            self.format = format.parse()?;
        }

        if let Some(dir) = lookup("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }

        if let Some(prefix) = lookup("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }

        if let Some(filter) = lookup("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }

        if let Some(val) = lookup("LOG_INCLUDE_LOCATION") {
            self.include_location = val.parse().unwrap_or(self.include_location);
        }

        if let Some(val) = lookup("LOG_INCLUDE_TARGETS") {
            self.include_targets = val.parse().unwrap_or(self.include_targets);
        }

        Ok(self)
    }
}

/// Builder for LogConfig
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn include_location(mut self, include: bool) -> Self {
        self.config.include_location = include;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Initialize logging with the given configuration
///
/// Installs the global tracing subscriber; call once at startup. When the
/// output includes a file, the returned guard must be held until exit so the
/// background writer flushes.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.output.writes_console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.output.writes_file() {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    let mut filter =
        EnvFilter::from_default_env().add_directive(config.level.to_tracing_level().into());

    if let Some(ref directives) = config.filter_directives {
        for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Failed to parse filter directive '{}'", directive))?,
            );
        }
    }

    Ok(filter)
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
