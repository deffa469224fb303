//! Test utilities for processor integration tests using testcontainers
//!
//! Spins up a throwaway PostgreSQL container with the `games` schema applied.
//! Each test gets its own container, so tests never see each other's rows.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestPostgres;
//!
//! #[tokio::test]
//! async fn test_with_postgres() {
//!     let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
//!     sqlx::query("SELECT 1").execute(pg.pool()).await.expect("Query failed");
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use nfl_processor::db::{self, DbConfig};
use sqlx::PgPool;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// PostgreSQL test container wrapper
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    config: DbConfig,
}

impl TestPostgres {
    /// Start a new PostgreSQL container with migrations applied
    pub async fn start() -> Result<Self> {
        Self::start_with_options(PostgresOptions::default()).await
    }

    pub async fn start_with_options(options: PostgresOptions) -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag(&options.version)
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

        let config = DbConfig {
            host: host.to_string(),
            port,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: options.max_connections,
            connect_timeout_secs: options.acquire_timeout_secs,
            run_migrations: options.run_migrations,
            ..Default::default()
        };

        debug!(endpoint = %config.endpoint(), "PostgreSQL container ready");

        let pool = db::create_pool(&config)
            .await
            .context("Failed to connect to PostgreSQL")?;

        if options.run_migrations {
            db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
        }

        Ok(Self {
            container,
            pool,
            config,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    /// Settings that reach this container
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Stop the database while keeping the pool around
    pub async fn stop(&self) -> Result<()> {
        self.container
            .stop()
            .await
            .context("Failed to stop PostgreSQL container")
    }
}

/// Configuration options for PostgreSQL test container
pub struct PostgresOptions {
    /// PostgreSQL version/tag (default: "16-alpine")
    pub version: String,
    /// Maximum number of connections in the pool (default: 5)
    pub max_connections: u32,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: u64,
    /// Whether to run migrations on startup (default: true)
    pub run_migrations: bool,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            version: "16-alpine".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 30,
            run_migrations: true,
        }
    }
}

impl PostgresOptions {
    /// Create new options without migrations
    pub fn without_migrations() -> Self {
        Self {
            run_migrations: false,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}
