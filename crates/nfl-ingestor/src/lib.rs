//! NFL ingestor library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Reads historical games from a CSV file, validates each row and publishes
//! the resulting [`nfl_common::Game`] records to a durable queue.
//!
//! # Pipeline
//!
//! - [`source`]: header-driven CSV reader, one item per data line
//! - [`parser`]: total row-to-game conversion with typed rejections
//! - [`publisher`]: confirmed publish with reconnect and backoff
//! - [`runner`]: the paced, cancellable loop tying them together
//!
//! # Example
//!
//! ```no_run
//! use nfl_common::queue::amqp::AmqpPublisher;
//! use nfl_ingestor::{config::IngestConfig, publisher::GamePublisher, runner, source::CsvSource};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let cancel = CancellationToken::new();
//!     let queue = AmqpPublisher::new(config.queue.clone());
//!     let mut publisher = GamePublisher::new(queue, config.publish_policy(), cancel.clone());
//!
//!     let rows = CsvSource::open(&config.data_file)?.rows();
//!     let summary = runner::run(rows, &mut publisher, config.interval, &cancel).await?;
//!     tracing::info!(published = summary.published, "Done");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod parser;
pub mod publisher;
pub mod runner;
pub mod source;

pub use error::{IngestError, PublishFailure, Result};
pub use parser::{parse_row, ParseError, RawRow, RejectionReason};
