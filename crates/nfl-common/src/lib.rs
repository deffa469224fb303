//! NFL pipeline common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! The contract shared by the ingestor and the processor.
//!
//! # Overview
//!
//! - **Types**: the [`Game`] record carried on the queue
//! - **Queue**: publisher/consumer traits with an AMQP implementation
//! - **Retry**: exponential backoff and the connection supervisor
//! - **Logging**: tracing subscriber setup and stage field conventions
//! - **Shutdown**: Ctrl+C / SIGTERM handling as a cancellation token
//!
//! # Example
//!
//! ```no_run
//! use nfl_common::queue::{amqp::AmqpPublisher, QueueConfig, QueuePublisher};
//! use nfl_common::Game;
//!
//! async fn send(game: &Game) -> anyhow::Result<()> {
//!     let mut publisher = AmqpPublisher::new(QueueConfig::from_env()?);
//!     publisher
//!         .publish(&game.game_id.to_string(), &game.to_payload()?)
//!         .await?;
//!     publisher.close().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod types;

// Re-export commonly used types
pub use error::{QueueError, QueueResult};
pub use types::{Game, GameId};
