//! Confirmed publishing of games with reconnect and backoff
//!
//! A publish only succeeds once the broker has confirmed the message. Queue
//! failures are retried through the [`Supervisor`] state machine; the record
//! is held in memory for the whole time and never dropped. The only ways out
//! without a confirm are an exhausted (explicitly bounded) policy or shutdown.

use nfl_common::logging::stage;
use nfl_common::queue::QueuePublisher;
use nfl_common::retry::{BackoffPolicy, FailureAction, Supervisor};
use nfl_common::Game;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::PublishFailure;

pub struct GamePublisher<P> {
    queue: P,
    policy: BackoffPolicy,
    cancel: CancellationToken,
}

impl<P: QueuePublisher> GamePublisher<P> {
    pub fn new(queue: P, policy: BackoffPolicy, cancel: CancellationToken) -> Self {
        Self {
            queue,
            policy,
            cancel,
        }
    }

    /// Serialize `game` and publish it, retrying queue failures per the policy.
    ///
    /// Returns the number of attempts it took.
    pub async fn publish(&mut self, game: &Game) -> Result<u32, PublishFailure> {
        let payload = game
            .to_payload()
            .map_err(|source| PublishFailure::Serialization {
                game_id: game.game_id,
                source,
            })?;
        let message_id = game.game_id.to_string();

        let mut supervisor = Supervisor::new(self.policy.clone());

        loop {
            let attempt = supervisor.begin_attempt();

            let err = match self.queue.publish(&message_id, &payload).await {
                Ok(()) => {
                    supervisor.succeed();
                    info!(
                        game_id = game.game_id,
                        stage = stage::PUBLISHED,
                        matchup = %game.matchup(),
                        attempt,
                        "Published game"
                    );
                    return Ok(attempt);
                },
                Err(err) => err,
            };

            match supervisor.fail() {
                FailureAction::RetryAfter(delay) => {
                    warn!(
                        game_id = game.game_id,
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Publish failed, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return Err(PublishFailure::Cancelled { game_id: game.game_id });
                        },
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
                FailureAction::GiveUp { attempts } => {
                    return Err(PublishFailure::Exhausted {
                        game_id: game.game_id,
                        attempts,
                        source: err,
                    });
                },
            }
        }
    }

    /// Close the underlying queue connection
    pub async fn close(mut self) -> nfl_common::QueueResult<()> {
        self.queue.close().await
    }

    pub fn queue(&self) -> &P {
        &self.queue
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use nfl_common::queue::memory::MemoryBroker;
    use std::time::Duration;

    fn game(id: i64) -> Game {
        Game::new(id, NaiveDate::from_ymd_opt(2009, 9, 10).unwrap(), "TEN", "PIT")
    }

    fn policy(max_retries: Option<u32>) -> BackoffPolicy {
        BackoffPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(60))
            .with_max_retries(max_retries)
    }

    #[tokio::test]
    async fn test_publish_enqueues_field_named_payload() {
        let broker = MemoryBroker::new();
        let mut publisher =
            GamePublisher::new(broker.publisher(), policy(None), CancellationToken::new());

        assert_eq!(publisher.publish(&game(2009090100)).await.unwrap(), 1);

        let payloads = broker.ready_payloads().await;
        assert_eq!(payloads.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(value["game_id"], 2009090100);
        assert_eq!(value["away_team"], "TEN");
        assert_eq!(broker.ready_message_ids().await, vec!["2009090100".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_not_dropped() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(3).await;
        let mut publisher =
            GamePublisher::new(broker.publisher(), policy(None), CancellationToken::new());

        let started = tokio::time::Instant::now();
        let attempts = publisher.publish(&game(1)).await.unwrap();

        assert_eq!(attempts, 4);
        assert_eq!(broker.ready_len().await, 1);
        // 1s + 2s + 4s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_policy_gives_up() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(10).await;
        let mut publisher =
            GamePublisher::new(broker.publisher(), policy(Some(2)), CancellationToken::new());

        let err = publisher.publish(&game(5)).await.unwrap_err();
        assert!(matches!(
            err,
            PublishFailure::Exhausted {
                game_id: 5,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(broker.ready_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(u32::MAX).await;
        let cancel = CancellationToken::new();
        let mut publisher = GamePublisher::new(broker.publisher(), policy(None), cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = publisher.publish(&game(9)).await.unwrap_err();
        assert!(matches!(err, PublishFailure::Cancelled { game_id: 9 }));
    }
}
