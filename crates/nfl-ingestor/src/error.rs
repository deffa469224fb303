//! Ingestor error types

use std::path::PathBuf;

use nfl_common::{GameId, QueueError};
use thiserror::Error;

/// A validated game could not be handed to the queue
#[derive(Error, Debug)]
pub enum PublishFailure {
    #[error("Failed to serialize game {game_id}: {source}")]
    Serialization {
        game_id: GameId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Publishing game {game_id} failed after {attempts} attempts: {source}")]
    Exhausted {
        game_id: GameId,
        attempts: u32,
        #[source]
        source: QueueError,
    },

    #[error("Publishing game {game_id} was cancelled")]
    Cancelled { game_id: GameId },
}

/// Errors that end an ingest run
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("NFL data file not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Failed to read NFL data file {}: {source}", .path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(transparent)]
    Publish(#[from] PublishFailure),
}

pub type Result<T> = std::result::Result<T, IngestError>;
