//! Error types for queue operations

use thiserror::Error;

/// Result type alias for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Errors raised while talking to the message queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Queue channel error: {0}")]
    Channel(String),

    /// The broker answered the publish with a nack, or returned it as unroutable
    #[error("Publish to '{queue}' was not confirmed: {reason}")]
    NotConfirmed { queue: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue is closed")]
    Closed,
}

impl QueueError {
    /// Whether re-establishing the connection is the right recovery.
    ///
    /// A nack from the broker leaves the connection healthy; everything else
    /// means the channel is unusable.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Channel(_) | QueueError::Closed)
    }
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Connection(err.to_string())
    }
}
