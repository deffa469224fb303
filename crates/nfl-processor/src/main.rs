//! NFL Processor - stores games from the game queue in PostgreSQL

use anyhow::{Context, Result};
use clap::Parser;
use nfl_common::logging::{init_logging, service_span, LogConfig, LogLevel};
use nfl_common::queue::amqp::{AmqpConsumer, AmqpSession};
use nfl_common::queue::QueueConfig;
use nfl_common::retry::{retry, RetryError};
use nfl_common::shutdown::shutdown_token;
use nfl_common::QueueResult;
use nfl_processor::{
    config::ProcessorConfig, db, error::ProcessorError, writer::PgGameStore, GameConsumer,
};
use tracing::{error, info, Instrument};
use uuid::Uuid;

const SERVICE_NAME: &str = "nfl_processor";

#[derive(Parser, Debug)]
#[command(name = "nfl-processor")]
#[command(author, version, about = "Store NFL game records from the game queue")]
struct Cli {
    /// Apply database migrations before consuming (overrides DB_RUN_MIGRATIONS)
    #[arg(long)]
    migrate: bool,

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

    let outcome = run(cli).instrument(service_span(SERVICE_NAME)).await;
    if let Err(e) = &outcome {
        error!(error = %e, "NFL Processor stopped with an error");
    }
    outcome
}

async fn run(cli: Cli) -> Result<()> {
    info!("NFL Processor starting up");

    let mut config = ProcessorConfig::load().context("Invalid configuration")?;
    if cli.migrate {
        config.database.run_migrations = true;
    }

    info!(
        queue = %config.queue.queue,
        dead_letter_queue = %config.queue.dead_letter_queue,
        broker = %config.queue.endpoint(),
        database = %config.database.endpoint(),
        message_max_retries = config.message_max_retries,
        "Configuration loaded"
    );

    let cancel = shutdown_token();
    let startup = config.startup_policy();

    let pool = match retry(&startup, "connect to PostgreSQL", &cancel, |_| {
        db::create_pool(&config.database)
    })
    .await
    {
        Ok(pool) => pool,
        Err(RetryError::Cancelled) => {
            info!("Shutdown requested before the database was reachable");
            return Ok(());
        },
        Err(e) => {
            return Err(ProcessorError::StartupExhausted {
                operation: "connect to PostgreSQL",
                reason: e.to_string(),
            }
            .into())
        },
    };

    if config.database.run_migrations {
        db::run_migrations(&pool).await?;
    }

    let consumer = match retry(&startup, "connect to RabbitMQ", &cancel, |_| {
        connect_consumer(&config.queue)
    })
    .await
    {
        Ok(consumer) => consumer,
        Err(RetryError::Cancelled) => {
            info!("Shutdown requested before the broker was reachable");
            pool.close().await;
            return Ok(());
        },
        Err(e) => {
            pool.close().await;
            return Err(ProcessorError::StartupExhausted {
                operation: "connect to RabbitMQ",
                reason: e.to_string(),
            }
            .into());
        },
    };

    info!("Waiting for game messages, press Ctrl+C to stop");

    let mut worker = GameConsumer::new(
        PgGameStore::new(pool.clone()),
        config.queue.queue.clone(),
        config.message_policy(),
        cancel.clone(),
    );

    let outcome = worker
        .supervise(
            consumer,
            || connect_consumer(&config.queue),
            &config.reconnect_policy(),
        )
        .await;

    let stats = worker.stats();
    info!(
        consumed = stats.consumed,
        stored = stats.stored,
        inserted = stats.inserted,
        updated = stats.updated,
        dead_lettered = stats.dead_lettered,
        requeued = stats.requeued,
        dropped = stats.dropped,
        "NFL Processor shutting down"
    );

    pool.close().await;
    info!("Database pool closed");

    outcome?;
    Ok(())
}

/// One connection, one channel, one registered consumer
async fn connect_consumer(config: &QueueConfig) -> QueueResult<AmqpConsumer> {
    let tag = format!("nfl-processor-{}", Uuid::new_v4());
    AmqpSession::connect(config).await?.into_consumer(&tag).await
}
