//! NFL processor library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Consumes game records from the durable queue and upserts them into
//! PostgreSQL, acknowledging each message only after its transaction commits.
//!
//! # Overview
//!
//! - [`db`]: connection settings, pool creation and migrations
//! - [`writer`]: the transactional upsert and storage error classification
//! - [`consumer`]: the consumer loop, dead-lettering and reconnect supervision
//! - [`config`]: environment-driven settings
//!
//! Redelivered messages are harmless: the upsert is keyed by `game_id`, so
//! applying the same record twice leaves one row with the same content.
//!
//! # Example
//!
//! ```no_run
//! use nfl_processor::{config::ProcessorConfig, db, writer::PgGameStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProcessorConfig::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let store = PgGameStore::new(pool);
//!     tracing::info!(rows = store.count().await?, "Games stored");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod writer;

pub use consumer::{ConsumerStats, Disposition, GameConsumer, LoopExit};
pub use error::{ProcessorError, ProcessorResult};
pub use writer::{GameStore, PgGameStore, StorageError, UpsertOutcome};
