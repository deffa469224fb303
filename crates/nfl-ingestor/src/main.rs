//! NFL Ingestor - publishes historical games from a CSV file to the game queue

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nfl_common::logging::{init_logging, service_span, LogConfig, LogLevel};
use nfl_common::queue::amqp::{AmqpPublisher, AmqpSession};
use nfl_common::retry::{retry, RetryError};
use nfl_common::shutdown::shutdown_token;
use nfl_ingestor::{
    config::{interval_from_secs, IngestConfig},
    publisher::GamePublisher,
    runner,
    source::CsvSource,
};
use tracing::{info, warn, Instrument};

const SERVICE_NAME: &str = "nfl_ingestor";

#[derive(Parser, Debug)]
#[command(name = "nfl-ingestor")]
#[command(author, version, about = "Publish NFL game records to the game queue")]
struct Cli {
    /// Source CSV file (overrides NFL_DATA_FILE)
    #[arg(short, long)]
    data_file: Option<PathBuf>,

    /// Seconds to wait after each published game (overrides INGESTOR_INTERVAL)
    #[arg(short, long)]
    interval: Option<f64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::load().unwrap_or_default();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    init_logging(&log_config)?;

    run(cli).instrument(service_span(SERVICE_NAME)).await
}

async fn run(cli: Cli) -> Result<()> {
    info!("NFL Ingestor starting up");

    let mut config = IngestConfig::load().context("Invalid configuration")?;
    if let Some(data_file) = cli.data_file {
        config.data_file = data_file;
    }
    if let Some(interval) = cli.interval {
        config.interval = interval_from_secs(interval).context("Invalid --interval")?;
    }

    info!(
        queue = %config.queue.queue,
        interval_ms = config.interval.as_millis() as u64,
        data_file = %config.data_file.display(),
        "Configuration loaded"
    );

    let source = CsvSource::open(&config.data_file)?;
    let cancel = shutdown_token();

    let session = match retry(&config.startup_policy(), "connect to RabbitMQ", &cancel, |_| {
        AmqpSession::connect(&config.queue)
    })
    .await
    {
        Ok(session) => session,
        Err(RetryError::Cancelled) => {
            info!("Shutdown requested before the broker was reachable");
            return Ok(());
        },
        Err(e) => return Err(e).context("Could not connect to RabbitMQ"),
    };

    let mut publisher = GamePublisher::new(
        AmqpPublisher::from_session(session),
        config.publish_policy(),
        cancel.clone(),
    );

    let outcome = runner::run(source.rows(), &mut publisher, config.interval, &cancel).await;

    if let Err(e) = publisher.close().await {
        warn!(error = %e, "Failed to close RabbitMQ connection cleanly");
    }

    let summary = outcome?;
    if summary.interrupted {
        info!("NFL Ingestor stopped by shutdown signal");
    } else {
        info!(
            published = summary.published,
            "All NFL data has been processed, exiting"
        );
    }

    Ok(())
}
