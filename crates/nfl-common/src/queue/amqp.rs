//! AMQP 0-9-1 (RabbitMQ) implementation of the queue traits
//!
//! Every channel runs in publisher-confirm mode, so a publish only counts once
//! the broker has accepted it. Messages are persistent (delivery mode 2) and
//! both the game queue and the dead-letter queue are declared durable, so they
//! survive a broker restart.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::{Delivery, DeadLetter, QueueConfig, QueueConsumer, QueuePublisher, CONTENT_TYPE_JSON};
use crate::error::{QueueError, QueueResult};

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Reply code sent when closing cleanly
const REPLY_SUCCESS: u16 = 200;

/// One connection plus one confirm-mode channel
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    config: QueueConfig,
}

impl AmqpSession {
    /// Connect, open a confirm-mode channel and declare the queue topology.
    ///
    /// A single attempt; wrap in [`crate::retry`] for backoff.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        info!(endpoint = %config.endpoint(), "Connecting to RabbitMQ");

        let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;

        let session = Self {
            connection,
            channel,
            config: config.clone(),
        };
        session.declare_topology().await?;

        info!(
            endpoint = %config.endpoint(),
            queue = %config.queue,
            dead_letter_queue = %config.dead_letter_queue,
            "Connected to RabbitMQ"
        );

        Ok(session)
    }

    /// Declare both durable queues; declarations are idempotent
    async fn declare_topology(&self) -> QueueResult<()> {
        for queue in [&self.config.queue, &self.config.dead_letter_queue] {
            let options = QueueDeclareOptions {
                durable: true,
                ..Default::default()
            };
            self.channel
                .queue_declare(queue, options, FieldTable::default())
                .await?;
            debug!(queue = %queue, "Queue declared");
        }

        Ok(())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Publish to `routing_key` through the default exchange and wait for the confirm
    async fn publish_confirmed(
        &self,
        routing_key: &str,
        message_id: &str,
        payload: &[u8],
    ) -> QueueResult<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_message_id(message_id.into())
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);

        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                properties,
            )
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(None) => Ok(()),
            Confirmation::Ack(Some(_returned)) => Err(QueueError::NotConfirmed {
                queue: routing_key.to_string(),
                reason: "message returned as unroutable".to_string(),
            }),
            Confirmation::Nack(_) => Err(QueueError::NotConfirmed {
                queue: routing_key.to_string(),
                reason: "broker nacked the message".to_string(),
            }),
            Confirmation::NotRequested => Err(QueueError::NotConfirmed {
                queue: routing_key.to_string(),
                reason: "channel is not in confirm mode".to_string(),
            }),
        }
    }

    /// Start consuming the game queue with the configured prefetch
    pub async fn into_consumer(self, consumer_tag: &str) -> QueueResult<AmqpConsumer> {
        self.channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let stream = self
            .channel
            .basic_consume(
                &self.config.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %self.config.queue,
            consumer_tag,
            prefetch = self.config.prefetch,
            "Consumer registered"
        );

        Ok(AmqpConsumer {
            session: Some(self),
            stream,
        })
    }

    /// Close channel then connection
    pub async fn close(self) -> QueueResult<()> {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = %e, "Channel close failed");
        }
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        info!("RabbitMQ connection closed");
        Ok(())
    }
}

/// Publisher that connects lazily and drops a broken session, so the next
/// publish attempt starts from a fresh connection.
pub struct AmqpPublisher {
    config: QueueConfig,
    session: Option<AmqpSession>,
}

impl AmqpPublisher {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Reuse an already established session
    pub fn from_session(session: AmqpSession) -> Self {
        Self {
            config: session.config.clone(),
            session: Some(session),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn session(&mut self) -> QueueResult<&AmqpSession> {
        if self.session.is_none() {
            self.session = Some(AmqpSession::connect(&self.config).await?);
        }
        self.session.as_ref().ok_or(QueueError::Closed)
    }
}

#[async_trait]
impl QueuePublisher for AmqpPublisher {
    async fn publish(&mut self, message_id: &str, payload: &[u8]) -> QueueResult<()> {
        let queue = self.config.queue.clone();
        let result = self
            .session()
            .await?
            .publish_confirmed(&queue, message_id, payload)
            .await;

        if let Err(ref e) = result {
            if e.needs_reconnect() {
                warn!(error = %e, "Publish failed, dropping broken session");
                if let Some(session) = self.session.take() {
                    let _ = session.close().await;
                }
            }
        }

        result
    }

    async fn close(&mut self) -> QueueResult<()> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

/// Consumer over a `basic_consume` stream
pub struct AmqpConsumer {
    session: Option<AmqpSession>,
    stream: lapin::Consumer,
}

impl AmqpConsumer {
    fn channel(&self) -> QueueResult<&Channel> {
        self.session
            .as_ref()
            .map(|s| &s.channel)
            .ok_or(QueueError::Closed)
    }
}

#[async_trait]
impl QueueConsumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Option<QueueResult<Delivery>> {
        if self.session.is_none() {
            return None;
        }

        match self.stream.next().await? {
            Ok(delivery) => Some(Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                message_id: delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                payload: delivery.data,
            })),
            Err(e) => Some(Err(QueueError::Connection(e.to_string()))),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> QueueResult<()> {
        self.channel()?
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> QueueResult<()> {
        self.channel()?
            .basic_nack(
                delivery.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, letter: &DeadLetter) -> QueueResult<()> {
        let session = self.session.as_ref().ok_or(QueueError::Closed)?;
        let payload = serde_json::to_vec(letter)?;
        let message_id = letter.message_id(delivery.delivery_tag);

        session
            .publish_confirmed(&session.config.dead_letter_queue, &message_id, &payload)
            .await?;

        // A failed ack here leaves the envelope published; the redelivered
        // original is dead-lettered again under the same message id.
        if let Err(e) = self.ack(delivery).await {
            warn!(
                message_id = %message_id,
                error = %e,
                "Dead letter published but original not acknowledged"
            );
            return Err(e);
        }
        Ok(())
    }

    async fn close(&mut self) -> QueueResult<()> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}
