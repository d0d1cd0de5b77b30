//! tfl-ingest - TfL accident ingestion tool

use clap::{Parser, Subcommand};
use tfl_common::logging::{init_logging, LogConfig, LogLevel};
use tfl_ingest::config::FetchSettings;
use tfl_ingest::fetch::TflClient;
use tfl_ingest::{IngestError, Pipeline, PipelineConfig, RunReport};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tfl-ingest")]
#[command(author, version, about = "Load TfL accident snapshots into the staging table")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download yearly snapshots from the TfL API into LOCAL_STORAGE
    Fetch,
    /// Load every snapshot in LOCAL_STORAGE into the staging table
    Load,
    /// Fetch, then load
    Run,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tfl-ingest")
        .build()
        .with_env_overrides();

    let guard = match log_config.and_then(|config| init_logging(&config)) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialise logging: {err:#}");
            std::process::exit(2);
        },
    };

    if let Err(err) = run(cli.command).await {
        error!(stage = err.stage(), error = %err, "Pipeline failed");
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            error!(cause = %cause, "caused by");
            source = cause.source();
        }
        // process::exit skips destructors; flush the file writer first
        drop(guard);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), IngestError> {
    match command {
        Command::Fetch => fetch(&FetchSettings::load()?).await,
        Command::Load => load(PipelineConfig::load()?).await,
        Command::Run => {
            let config = PipelineConfig::load()?;
            let settings = FetchSettings {
                fetch: config.fetch.clone(),
                local_storage: config.local_storage.clone(),
            };
            fetch(&settings).await?;
            load(config).await
        },
    }
}

async fn fetch(settings: &FetchSettings) -> Result<(), IngestError> {
    let client = TflClient::new(settings.fetch.clone())?;
    let report = client.fetch_all(&settings.local_storage).await?;
    info!(
        files = report.files.len(),
        records = report.records,
        skipped_years = ?report.skipped_years,
        "Fetch finished"
    );
    Ok(())
}

async fn load(config: PipelineConfig) -> Result<(), IngestError> {
    let pipeline = Pipeline::connect(config).await?;
    let report = pipeline.run().await?;
    log_summary(&report);
    Ok(())
}

fn log_summary(report: &RunReport) {
    for file in &report.files {
        info!(
            file = %file.file,
            rows = file.rows,
            chunks = file.chunks,
            malformed_documents = file.malformed_documents,
            archived_raw = file.archived_raw,
            archived_normalized = file.archived_normalized,
            "File summary"
        );
    }
    let elapsed = report.finished_at - report.started_at;
    info!(
        run_id = %report.run_id,
        rows = report.rows_loaded,
        chunks = report.chunks,
        archival_failures = report.archival_failures.len(),
        elapsed_ms = elapsed.num_milliseconds(),
        "Ingestion complete"
    );
}
