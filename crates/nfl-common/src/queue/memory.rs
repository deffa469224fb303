//! In-process broker with the delivery semantics of a durable AMQP queue
//!
//! - FIFO per queue, competing consumers, each message outstanding at one
//!   consumer at a time
//! - unacknowledged messages go back to the head of the queue (marked
//!   redelivered) on `nack(requeue = true)` or when a consumer crashes
//! - `nack(requeue = false)` drops the message
//! - fault injection for publishes, dead-letter writes and the ack that
//!   follows a dead-letter write

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{Delivery, DeadLetter, QueueConsumer, QueuePublisher};
use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: VecDeque<StoredMessage>,
    /// delivery tag -> (consumer id, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
    dead_letters: Vec<DeadLetter>,
    dropped: Vec<Vec<u8>>,
    published: u64,
    next_tag: u64,
    closed: bool,
    failing_publishes: u32,
    failing_dead_letters: u32,
    failing_dead_letter_acks: u32,
}

/// Shared handle to an in-memory queue plus its dead-letter queue
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    next_consumer: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.clone(),
            closed: false,
        }
    }

    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            id: self.next_consumer.fetch_add(1, Ordering::SeqCst),
            closed: false,
        }
    }

    /// Enqueue a raw payload, bypassing serialization (poison-message tests)
    pub async fn push_raw(&self, payload: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().await;
        state.ready.push_back(StoredMessage {
            message_id: String::new(),
            payload: payload.into(),
            redelivered: false,
        });
        state.published += 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Payloads waiting for a consumer, in delivery order
    pub async fn ready_payloads(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state.ready.iter().map(|m| m.payload.clone()).collect()
    }

    /// Message ids waiting for a consumer, in delivery order
    pub async fn ready_message_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.ready.iter().map(|m| m.message_id.clone()).collect()
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn unacked_len(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Total messages ever accepted by the main queue
    pub async fn published_count(&self) -> u64 {
        self.state.lock().await.published
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Payloads rejected without requeue
    pub async fn dropped(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.dropped.clone()
    }

    /// Make the next `n` publishes fail with a connection error
    pub async fn fail_next_publishes(&self, n: u32) {
        self.state.lock().await.failing_publishes = n;
    }

    /// Make the next `n` dead-letter writes fail with a connection error
    pub async fn fail_next_dead_letters(&self, n: u32) {
        self.state.lock().await.failing_dead_letters = n;
    }

    /// Make the next `n` dead-letter writes succeed but leave the original
    /// unacknowledged, as when the channel drops between confirm and ack
    pub async fn fail_next_dead_letter_acks(&self, n: u32) {
        self.state.lock().await.failing_dead_letter_acks = n;
    }

    /// End the stream: consumers see `None` once the queue is drained
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Return every message held by `consumer_id` to the head of the queue
    async fn requeue_outstanding(&self, consumer_id: u64) {
        let mut state = self.state.lock().await;
        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == consumer_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some((_, mut message)) = state.unacked.remove(&tag) {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Publisher half of [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    closed: bool,
}

#[async_trait]
impl QueuePublisher for MemoryPublisher {
    async fn publish(&mut self, message_id: &str, payload: &[u8]) -> QueueResult<()> {
        if self.closed {
            return Err(QueueError::Closed);
        }

        let mut state = self.broker.state.lock().await;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(QueueError::Connection("injected publish failure".to_string()));
        }

        state.ready.push_back(StoredMessage {
            message_id: message_id.to_string(),
            payload: payload.to_vec(),
            redelivered: false,
        });
        state.published += 1;
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> QueueResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Consumer half of [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    id: u64,
    closed: bool,
}

impl MemoryConsumer {
    /// Simulate a crash: everything this consumer holds is redelivered
    pub async fn crash(mut self) {
        self.closed = true;
        self.broker.requeue_outstanding(self.id).await;
    }

    async fn settle(&self, delivery: &Delivery) -> QueueResult<StoredMessage> {
        let mut state = self.broker.state.lock().await;
        match state.unacked.remove(&delivery.delivery_tag) {
            Some((owner, message)) if owner == self.id => Ok(message),
            Some(entry) => {
                state.unacked.insert(delivery.delivery_tag, entry);
                Err(QueueError::Channel(format!(
                    "delivery tag {} belongs to another consumer",
                    delivery.delivery_tag
                )))
            },
            None => Err(QueueError::Channel(format!(
                "unknown delivery tag {}",
                delivery.delivery_tag
            ))),
        }
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<QueueResult<Delivery>> {
        loop {
            if self.closed {
                return None;
            }

            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.state.lock().await;
                if let Some(message) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let delivery_tag = state.next_tag;
                    let delivery = Delivery {
                        delivery_tag,
                        redelivered: message.redelivered,
                        message_id: Some(message.message_id.clone()).filter(|id| !id.is_empty()),
                        payload: message.payload.clone(),
                    };
                    state.unacked.insert(delivery_tag, (self.id, message));
                    return Some(Ok(delivery));
                }

                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> QueueResult<()> {
        self.settle(delivery).await.map(|_| ())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> QueueResult<()> {
        let mut message = self.settle(delivery).await?;
        let mut state = self.broker.state.lock().await;

        if requeue {
            message.redelivered = true;
            state.ready.push_front(message);
            drop(state);
            self.broker.notify.notify_waiters();
        } else {
            state.dropped.push(message.payload);
        }

        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, letter: &DeadLetter) -> QueueResult<()> {
        {
            let mut state = self.broker.state.lock().await;
            if state.failing_dead_letters > 0 {
                state.failing_dead_letters -= 1;
                return Err(QueueError::Connection(
                    "injected dead-letter failure".to_string(),
                ));
            }
        }

        {
            let mut state = self.broker.state.lock().await;
            if state.failing_dead_letter_acks > 0 {
                state.failing_dead_letter_acks -= 1;
                state.dead_letters.push(letter.clone());
                return Err(QueueError::Channel(
                    "injected ack failure after dead-letter write".to_string(),
                ));
            }
        }

        self.settle(delivery).await?;
        self.broker.state.lock().await.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn close(&mut self) -> QueueResult<()> {
        self.closed = true;
        self.broker.requeue_outstanding(self.id).await;
        Ok(())
    }
}
