//! Processor error types

use nfl_common::QueueError;
use thiserror::Error;

use crate::db::DbError;

/// Result type alias for processor operations
pub type ProcessorResult<T> = std::result::Result<T, ProcessorError>;

/// Failures that stop the processor
///
/// Per-message storage failures never surface here; the consumer loop settles
/// them on the queue. Only startup and connection problems end the process.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A bounded startup retry gave up
    #[error("Could not {operation}: {reason}")]
    StartupExhausted {
        operation: &'static str,
        reason: String,
    },

    /// The queue connection could not be re-established
    #[error("Reconnect failed: {0}")]
    Reconnect(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
