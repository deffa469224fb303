//! Message queue abstraction
//!
//! The pipeline talks to the broker through two traits:
//!
//! - [`QueuePublisher`]: durable publish that only returns once the broker has
//!   confirmed the message.
//! - [`QueueConsumer`]: a pull-style stream of [`Delivery`] values. The caller
//!   decides the fate of every delivery explicitly (ack, nack with or without
//!   requeue, or dead-letter) before pulling the next one, which keeps
//!   acknowledgment timing visible in the consumer loop.
//!
//! [`amqp`] implements both over AMQP 0-9-1 (RabbitMQ). The in-process
//! implementation in `memory` (feature `test-utils`) has the same delivery
//! semantics and backs the tests.

pub mod amqp;
pub mod config;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueResult;
use crate::types::GameId;

pub use config::QueueConfig;

/// Content type of every payload on the game queue
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message handed to a consumer, not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag, unique per channel
    pub delivery_tag: u64,
    /// Set when the broker has delivered this message before
    pub redelivered: bool,
    /// `message_id` property set by the publisher, if any
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Why a message left the main queue without being stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The payload is not a valid game record
    Deserialization,
    /// Storage rejected the record outright
    ConstraintViolation,
    /// Storage failed in a way retrying cannot fix
    PermanentStorage,
    /// Retryable failures persisted past the retry budget and one redelivery
    RetriesExhausted,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Deserialization => write!(f, "deserialization"),
            DeadLetterReason::ConstraintViolation => write!(f, "constraint_violation"),
            DeadLetterReason::PermanentStorage => write!(f, "permanent_storage"),
            DeadLetterReason::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

/// Envelope written to the dead-letter queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Original payload (lossy UTF-8 for binary garbage)
    pub original_payload: String,
    /// `message_id` of the original message; stable across redeliveries
    #[serde(default)]
    pub original_message_id: Option<String>,
    pub reason: DeadLetterReason,
    pub error: String,
    /// Present when the payload decoded far enough to know it
    pub game_id: Option<GameId>,
    pub source_queue: String,
    /// Processing attempts made in this delivery
    pub attempts: u32,
    pub redelivered: bool,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        delivery: &Delivery,
        source_queue: impl Into<String>,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            original_payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            original_message_id: delivery.message_id.clone(),
            reason,
            error: error.into(),
            game_id: None,
            source_queue: source_queue.into(),
            attempts: 1,
            redelivered: delivery.redelivered,
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn with_game_id(mut self, game_id: GameId) -> Self {
        self.game_id = Some(game_id);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// `message_id` of the envelope on the dead-letter queue.
    ///
    /// Taken from the original message, then the game id, and only then the
    /// delivery tag, so the same message dead-lettered on two deliveries gets
    /// the same id and readers of the dead-letter queue can drop the repeat.
    pub fn message_id(&self, delivery_tag: u64) -> String {
        match (&self.original_message_id, self.game_id) {
            (Some(id), _) if !id.is_empty() => id.clone(),
            (_, Some(game_id)) => game_id.to_string(),
            _ => format!("delivery-{delivery_tag}"),
        }
    }
}

/// Durable, confirmed publishing to the game queue
#[async_trait]
pub trait QueuePublisher: Send {
    /// Publish one persistent message and wait for the broker's confirm.
    ///
    /// `message_id` is carried as a message property for tracing; it is not
    /// used for deduplication.
    async fn publish(&mut self, message_id: &str, payload: &[u8]) -> QueueResult<()>;

    /// Close the channel and connection, if any
    async fn close(&mut self) -> QueueResult<()>;
}

/// Pull-style consumption with explicit acknowledgment
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next delivery. `None` means the stream has ended.
    async fn next_delivery(&mut self) -> Option<QueueResult<Delivery>>;

    async fn ack(&mut self, delivery: &Delivery) -> QueueResult<()>;

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> QueueResult<()>;

    /// Move the delivery to the dead-letter queue: the envelope is published
    /// (confirmed) first, then the original is acknowledged.
    ///
    /// Delivery to the dead-letter queue is at-least-once. When the ack fails
    /// after a confirmed publish the original is redelivered and dead-lettered
    /// again; both envelopes carry the same [`DeadLetter::message_id`].
    async fn dead_letter(&mut self, delivery: &Delivery, letter: &DeadLetter) -> QueueResult<()>;

    /// Stop consuming and close the channel and connection
    async fn close(&mut self) -> QueueResult<()>;
}
