//! Consumer loop: one delivery at a time from queue to storage
//!
//! Every delivery ends in exactly one explicit disposition before the next is
//! pulled:
//!
//! | Outcome                                   | Disposition                   |
//! |-------------------------------------------|-------------------------------|
//! | upsert committed                          | ack                           |
//! | payload is not a game                     | dead-letter                   |
//! | constraint violation / permanent error    | dead-letter                   |
//! | retryable error, retries exhausted        | requeue once, then dead-letter|
//! | shutdown while backing off                | requeue                       |
//! | dead-letter publish failed                | nack without requeue          |
//!
//! A delivery is never acknowledged before its transaction commits.

use std::future::Future;

use nfl_common::logging::stage;
use nfl_common::queue::{DeadLetter, DeadLetterReason, Delivery, QueueConsumer};
use nfl_common::retry::{retry, retry_with, BackoffPolicy, RetryError};
use nfl_common::{Game, QueueError, QueueResult};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ProcessorError;
use crate::writer::{GameStore, StorageError, UpsertOutcome};

/// Counters kept for the lifetime of the processor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub consumed: u64,
    pub stored: u64,
    pub inserted: u64,
    pub updated: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    /// Rejected without requeue because dead-lettering failed
    pub dropped: u64,
}

/// How one delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Stored(UpsertOutcome),
    DeadLettered(DeadLetterReason),
    Requeued,
    Dropped,
}

/// Why [`GameConsumer::run`] returned
#[derive(Debug)]
pub enum LoopExit {
    Cancelled,
    /// The broker ended the delivery stream
    StreamEnded,
    QueueFailed(QueueError),
}

pub struct GameConsumer<S> {
    store: S,
    source_queue: String,
    message_policy: BackoffPolicy,
    cancel: CancellationToken,
    stats: ConsumerStats,
}

impl<S: GameStore> GameConsumer<S> {
    pub fn new(
        store: S,
        source_queue: impl Into<String>,
        message_policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            source_queue: source_queue.into(),
            message_policy,
            cancel,
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Pull and settle deliveries until shutdown or a queue failure.
    ///
    /// Shutdown is only observed while waiting for the next delivery, so an
    /// in-flight write and its ack always complete.
    pub async fn run<C: QueueConsumer>(&mut self, consumer: &mut C) -> LoopExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                next = consumer.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return LoopExit::QueueFailed(e),
                None => return LoopExit::StreamEnded,
            };

            if let Err(e) = self.handle(consumer, &delivery).await {
                return LoopExit::QueueFailed(e);
            }
        }
    }

    /// Decode, store and settle one delivery
    pub async fn handle<C: QueueConsumer>(
        &mut self,
        consumer: &mut C,
        delivery: &Delivery,
    ) -> QueueResult<Disposition> {
        self.stats.consumed += 1;

        let game = match Game::from_payload(&delivery.payload) {
            Ok(game) => game,
            Err(e) => {
                let letter = DeadLetter::new(
                    delivery,
                    &self.source_queue,
                    DeadLetterReason::Deserialization,
                    e.to_string(),
                );
                return self.dead_letter(consumer, delivery, letter).await;
            },
        };

        info!(
            game_id = game.game_id,
            stage = stage::CONSUMED,
            redelivered = delivery.redelivered,
            "Processing game"
        );

        let mut attempts = 0u32;
        let result = retry_with(
            &self.message_policy,
            "store game",
            &self.cancel,
            StorageError::is_retryable,
            |attempt| {
                attempts = attempt;
                self.store.upsert(&game)
            },
        )
        .await;

        match result {
            Ok(outcome) => {
                consumer.ack(delivery).await?;
                self.stats.stored += 1;
                match outcome {
                    UpsertOutcome::Inserted => self.stats.inserted += 1,
                    UpsertOutcome::Updated => self.stats.updated += 1,
                }
                info!(
                    game_id = game.game_id,
                    stage = stage::STORED,
                    %outcome,
                    matchup = %game.matchup(),
                    "Stored game"
                );
                Ok(Disposition::Stored(outcome))
            },
            Err(RetryError::Permanent(err)) => {
                let letter = DeadLetter::new(
                    delivery,
                    &self.source_queue,
                    err.dead_letter_reason(),
                    err.to_string(),
                )
                .with_game_id(game.game_id)
                .with_attempts(attempts);
                self.dead_letter(consumer, delivery, letter).await
            },
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                if delivery.redelivered {
                    let letter = DeadLetter::new(
                        delivery,
                        &self.source_queue,
                        DeadLetterReason::RetriesExhausted,
                        last_error.to_string(),
                    )
                    .with_game_id(game.game_id)
                    .with_attempts(attempts);
                    self.dead_letter(consumer, delivery, letter).await
                } else {
                    warn!(
                        game_id = game.game_id,
                        attempts,
                        error = %last_error,
                        "Storage retries exhausted, requeueing once"
                    );
                    self.requeue(consumer, delivery, game.game_id).await
                }
            },
            Err(RetryError::Cancelled) => {
                info!(game_id = game.game_id, "Shutdown while retrying storage");
                self.requeue(consumer, delivery, game.game_id).await
            },
        }
    }

    async fn requeue<C: QueueConsumer>(
        &mut self,
        consumer: &mut C,
        delivery: &Delivery,
        game_id: i64,
    ) -> QueueResult<Disposition> {
        consumer.nack(delivery, true).await?;
        self.stats.requeued += 1;
        info!(game_id, stage = stage::REQUEUED, "Requeued game");
        Ok(Disposition::Requeued)
    }

    async fn dead_letter<C: QueueConsumer>(
        &mut self,
        consumer: &mut C,
        delivery: &Delivery,
        letter: DeadLetter,
    ) -> QueueResult<Disposition> {
        match consumer.dead_letter(delivery, &letter).await {
            Ok(()) => {
                self.stats.dead_lettered += 1;
                error!(
                    game_id = letter.game_id,
                    stage = stage::DEAD_LETTERED,
                    reason = %letter.reason,
                    error = %letter.error,
                    "Dead-lettered message"
                );
                Ok(Disposition::DeadLettered(letter.reason))
            },
            Err(e) => {
                consumer.nack(delivery, false).await?;
                self.stats.dropped += 1;
                error!(
                    game_id = letter.game_id,
                    stage = stage::DEAD_LETTERED,
                    reason = %letter.reason,
                    error = %letter.error,
                    dead_letter_error = %e,
                    "Dead-letter publish failed, message rejected without requeue"
                );
                Ok(Disposition::Dropped)
            },
        }
    }

    /// Run with reconnects until shutdown.
    ///
    /// `consumer` is an established consumer; `connect` produces a fresh one
    /// whenever the stream breaks. Deliveries left unacknowledged on a broken
    /// channel are redelivered by the broker.
    pub async fn supervise<C, F, Fut>(
        &mut self,
        mut consumer: C,
        mut connect: F,
        reconnect_policy: &BackoffPolicy,
    ) -> Result<(), ProcessorError>
    where
        C: QueueConsumer,
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<C>>,
    {
        loop {
            let exit = self.run(&mut consumer).await;

            if let Err(e) = consumer.close().await {
                warn!(error = %e, "Failed to close consumer cleanly");
            }

            match exit {
                LoopExit::Cancelled => return Ok(()),
                LoopExit::StreamEnded => warn!("Delivery stream ended, reconnecting"),
                LoopExit::QueueFailed(e) => warn!(error = %e, "Queue failure, reconnecting"),
            }

            let pause = reconnect_policy.delay_for(1);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(pause) => {},
            }

            consumer = match retry(reconnect_policy, "reconnect to RabbitMQ", &self.cancel, |_| {
                connect()
            })
            .await
            {
                Ok(consumer) => consumer,
                Err(RetryError::Cancelled) => return Ok(()),
                Err(e) => return Err(ProcessorError::Reconnect(e.to_string())),
            };

            info!("Reconnected to RabbitMQ");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use nfl_common::queue::memory::{MemoryBroker, MemoryConsumer};
    use nfl_common::queue::QueuePublisher;
    use nfl_common::GameId;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// In-memory store with scripted failures
    #[derive(Clone, Default)]
    struct FakeStore {
        rows: Arc<Mutex<HashMap<GameId, Game>>>,
        failures: Arc<Mutex<VecDeque<StorageError>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl FakeStore {
        fn fail_with(&self, errors: impl IntoIterator<Item = StorageError>) {
            self.failures.lock().unwrap().extend(errors);
        }

        fn row(&self, game_id: GameId) -> Option<Game> {
            self.rows.lock().unwrap().get(&game_id).cloned()
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl GameStore for FakeStore {
        async fn upsert(&self, game: &Game) -> Result<UpsertOutcome, StorageError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let previous = self.rows.lock().unwrap().insert(game.game_id, game.clone());
            Ok(match previous {
                Some(_) => UpsertOutcome::Updated,
                None => UpsertOutcome::Inserted,
            })
        }
    }

    fn game(id: GameId, home_score: i32) -> Game {
        let mut game = Game::new(id, NaiveDate::from_ymd_opt(2009, 9, 10).unwrap(), "TEN", "PIT");
        game.away_score = Some(10);
        game.home_score = Some(home_score);
        game
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::bounded(Duration::from_millis(100), Duration::from_secs(1), 2)
    }

    async fn publish(broker: &MemoryBroker, game: &Game) {
        broker
            .publisher()
            .publish(&game.game_id.to_string(), &game.to_payload().unwrap())
            .await
            .unwrap();
    }

    fn consumer_for(store: &FakeStore) -> GameConsumer<FakeStore> {
        GameConsumer::new(store.clone(), "game_events", policy(), CancellationToken::new())
    }

    async fn next(consumer: &mut MemoryConsumer) -> Delivery {
        consumer.next_delivery().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_stored_then_acked() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        let mut worker = consumer_for(&store);
        let mut queue = broker.consumer();

        publish(&broker, &game(100, 13)).await;
        let delivery = next(&mut queue).await;

        let disposition = worker.handle(&mut queue, &delivery).await.unwrap();
        assert_eq!(disposition, Disposition::Stored(UpsertOutcome::Inserted));
        assert_eq!(broker.unacked_len().await, 0);
        assert_eq!(store.row(100).unwrap().home_score, Some(13));
        assert_eq!(worker.stats().stored, 1);
    }

    #[tokio::test]
    async fn test_poison_message_leaves_queue_in_one_attempt() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        let mut worker = consumer_for(&store);
        let mut queue = broker.consumer();

        broker.push_raw("{not json").await;
        let delivery = next(&mut queue).await;

        let disposition = worker.handle(&mut queue, &delivery).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::DeadLettered(DeadLetterReason::Deserialization)
        );
        assert_eq!(broker.ready_len().await, 0);
        assert_eq!(broker.unacked_len().await, 0);
        assert_eq!(store.calls(), 0);

        let letters = broker.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].original_payload, "{not json");
        assert_eq!(letters[0].source_queue, "game_events");
        assert_eq!(letters[0].game_id, None);
    }

    #[tokio::test]
    async fn test_constraint_violation_is_dead_lettered_without_retry() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        store.fail_with([StorageError::ConstraintViolation("check".into())]);
        let mut worker = consumer_for(&store);
        let mut queue = broker.consumer();

        publish(&broker, &game(7, 3)).await;
        let delivery = next(&mut queue).await;

        let disposition = worker.handle(&mut queue, &delivery).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::DeadLettered(DeadLetterReason::ConstraintViolation)
        );
        assert_eq!(store.calls(), 1);

        let letters = broker.dead_letters().await;
        assert_eq!(letters[0].game_id, Some(7));
        assert_eq!(letters[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retried_in_process() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        store.fail_with([
            StorageError::TransientConnection("reset".into()),
            StorageError::SerializationConflict("40001".into()),
        ]);
        let mut worker = consumer_for(&store);
        let mut queue = broker.consumer();

        publish(&broker, &game(8, 21)).await;
        let delivery = next(&mut queue).await;

        let disposition = worker.handle(&mut queue, &delivery).await.unwrap();
        assert_eq!(disposition, Disposition::Stored(UpsertOutcome::Inserted));
        assert_eq!(store.calls(), 3);
        assert_eq!(broker.unacked_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_requeue_once_then_dead_letter() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        store.fail_with((0..6).map(|_| StorageError::TransientConnection("down".into())));
        let mut worker = consumer_for(&store);
        let mut queue = broker.consumer();

        publish(&broker, &game(9, 0)).await;

        let first = next(&mut queue).await;
        assert_eq!(
            worker.handle(&mut queue, &first).await.unwrap(),
            Disposition::Requeued
        );
        assert_eq!(broker.ready_len().await, 1);

        let second = next(&mut queue).await;
        assert!(second.redelivered);
        assert_eq!(
            worker.handle(&mut queue, &second).await.unwrap(),
            Disposition::DeadLettered(DeadLetterReason::RetriesExhausted)
        );

        assert_eq!(broker.ready_len().await, 0);
        assert_eq!(store.calls(), 6);
        let letters = broker.dead_letters().await;
        assert_eq!(letters[0].attempts, 3);
        assert!(letters[0].redelivered);
        assert_eq!(worker.stats().requeued, 1);
        assert_eq!(worker.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_falls_back_to_reject() {
        let broker = MemoryBroker::new();
        broker.fail_next_dead_letters(1).await;
        let store = FakeStore::default();
        let mut worker = consumer_for(&store);
        let mut queue = broker.consumer();

        broker.push_raw(vec![0xff, 0xfe]).await;
        let delivery = next(&mut queue).await;

        let disposition = worker.handle(&mut queue, &delivery).await.unwrap();
        assert_eq!(disposition, Disposition::Dropped);
        assert_eq!(broker.dropped().await.len(), 1);
        assert_eq!(broker.ready_len().await, 0);
        assert_eq!(worker.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_crash_is_idempotent() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        publish(&broker, &game(100, 13)).await;

        // First consumer stores the game but dies before acknowledging
        let mut crashed = broker.consumer();
        let delivery = next(&mut crashed).await;
        store.upsert(&Game::from_payload(&delivery.payload).unwrap()).await.unwrap();
        crashed.crash().await;

        let mut worker = consumer_for(&store);
        let mut queue = broker.consumer();
        let redelivered = next(&mut queue).await;
        assert!(redelivered.redelivered);

        let disposition = worker.handle(&mut queue, &redelivered).await.unwrap();
        assert_eq!(disposition, Disposition::Stored(UpsertOutcome::Updated));
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        assert_eq!(store.row(100).unwrap().home_score, Some(13));
    }

    #[tokio::test]
    async fn test_run_drains_until_stream_ends() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        let mut worker = consumer_for(&store);

        publish(&broker, &game(100, 13)).await;
        publish(&broker, &game(101, 20)).await;
        broker.push_raw("garbage").await;
        publish(&broker, &game(100, 17)).await;
        broker.close().await;

        let mut queue = broker.consumer();
        let exit = worker.run(&mut queue).await;

        assert!(matches!(exit, LoopExit::StreamEnded));
        assert_eq!(
            worker.stats(),
            &ConsumerStats {
                consumed: 4,
                stored: 3,
                inserted: 2,
                updated: 1,
                dead_lettered: 1,
                requeued: 0,
                dropped: 0,
            }
        );
        assert_eq!(store.row(100).unwrap().home_score, Some(17));
    }

    #[tokio::test]
    async fn test_competing_consumers_store_each_game_once() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        for id in 1..=30 {
            publish(&broker, &game(id, id as i32)).await;
        }
        broker.close().await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut worker = consumer_for(&store);
            let mut queue = broker.consumer();
            handles.push(tokio::spawn(async move {
                worker.run(&mut queue).await;
                worker.stats().stored
            }));
        }

        let mut stored = 0;
        for handle in handles {
            stored += handle.await.unwrap();
        }

        assert_eq!(stored, 30);
        assert_eq!(store.calls(), 30);
        assert_eq!(store.rows.lock().unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_for_deliveries() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        let cancel = CancellationToken::new();
        let mut worker = GameConsumer::new(store.clone(), "game_events", policy(), cancel.clone());
        let mut queue = broker.consumer();

        cancel.cancel();
        publish(&broker, &game(1, 1)).await;

        assert!(matches!(worker.run(&mut queue).await, LoopExit::Cancelled));
        assert_eq!(store.calls(), 0);
        assert_eq!(broker.ready_len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_storage_backoff_requeues() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        store.fail_with([StorageError::TransientConnection("down".into())]);
        let cancel = CancellationToken::new();
        let mut worker = GameConsumer::new(store.clone(), "game_events", policy(), cancel.clone());
        let mut queue = broker.consumer();

        publish(&broker, &game(3, 3)).await;
        let delivery = next(&mut queue).await;
        cancel.cancel();

        let disposition = worker.handle(&mut queue, &delivery).await.unwrap();
        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(broker.ready_len().await, 1);
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_reconnects_after_stream_ends() {
        let broker = MemoryBroker::new();
        let store = FakeStore::default();
        let cancel = CancellationToken::new();
        let mut worker = GameConsumer::new(store.clone(), "game_events", policy(), cancel.clone());

        publish(&broker, &game(1, 1)).await;
        broker.close().await;

        let connects = Arc::new(Mutex::new(0u32));
        let counter = connects.clone();
        let reconnect_broker = broker.clone();
        let connect = move || {
            *counter.lock().unwrap() += 1;
            let consumer = reconnect_broker.consumer();
            async move { Ok::<_, QueueError>(consumer) }
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            trigger.cancel();
        });

        worker
            .supervise(broker.consumer(), connect, &policy())
            .await
            .unwrap();

        assert_eq!(worker.stats().stored, 1);
        assert_eq!(*connects.lock().unwrap(), 3);
    }
}
