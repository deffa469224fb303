//! Retry and backoff supervision
//!
//! Everything that depends on an external service (queue broker, database)
//! goes through here. The policy is plain exponential backoff: the first retry
//! waits `base_delay`, each following retry doubles it, capped at `max_delay`.
//!
//! Two flavours are used across the pipeline:
//!
//! - **Startup connections** run unbounded (`max_retries = None`). The broker or
//!   database may simply not be up yet; the process stays alive until it is.
//! - **Per-message operations** are bounded, so one bad record cannot hold a
//!   consumer in a retry storm.
//!
//! The retry bookkeeping is an explicit state machine ([`Supervisor`]) so the
//! transitions can be tested without any network calls. [`retry_with`] drives
//! that machine around an async operation.
//!
//! # Example
//!
//! ```no_run
//! use nfl_common::retry::{retry, BackoffPolicy};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn connect() -> Result<(), std::io::Error> { Ok(()) }
//! # async fn run() -> anyhow::Result<()> {
//! let policy = BackoffPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(60));
//! let cancel = CancellationToken::new();
//! retry(&policy, "connect to broker", &cancel, |_attempt| connect()).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default delay before the first retry (1 second)
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Default cap on a single backoff delay (60 seconds)
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Retries allowed after the first attempt; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::unbounded(
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        )
    }
}

impl BackoffPolicy {
    /// Retry forever with exponential backoff
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries: None,
        }
    }

    /// Retry at most `max_retries` times after the first attempt
    pub fn bounded(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries: Some(max_retries),
        }
    }

    /// Same delays, different retry bound
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Load base and max delays from the environment.
    ///
    /// - `RETRY_BASE_DELAY_MS` (default 1000)
    /// - `RETRY_MAX_DELAY_MS` (default 60000)
    ///
    /// The retry bound is left to the caller, since it depends on what is being retried.
    pub fn from_env() -> Self {
        let base_delay_ms = std::env::var("RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BASE_DELAY_MS);

        let max_delay_ms = std::env::var("RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_DELAY_MS);

        Self::unbounded(
            Duration::from_millis(base_delay_ms),
            Duration::from_millis(max_delay_ms.max(base_delay_ms)),
        )
    }

    /// Delay to wait after the `failures`-th consecutive failure (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self.max_retries {
            Some(max) => failures <= max,
            None => true,
        }
    }
}

/// Connection lifecycle as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing established yet, or the last connection was lost
    Disconnected,
    /// An attempt is in flight
    Connecting { attempt: u32 },
    /// The last attempt succeeded
    Connected,
    /// Waiting `delay` before attempt number `attempt`
    Backoff { attempt: u32, delay: Duration },
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Sleep for the given delay, then try again
    RetryAfter(Duration),
    /// The policy is exhausted
    GiveUp { attempts: u32 },
}

/// Backoff state machine
///
/// ```text
/// Disconnected --begin_attempt--> Connecting --succeed--> Connected
///      ^                              |                      |
///      |                            fail                 disconnect
///      |                              v                      |
///      +------(exhausted)------- Backoff --begin_attempt--> Connecting
/// ```
#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: BackoffPolicy,
    state: ConnectionState,
    failures: u32,
}

impl Supervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Enter `Connecting`; returns the 1-based attempt number
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt = self.failures + 1;
        self.state = ConnectionState::Connecting { attempt };
        attempt
    }

    /// The attempt succeeded: reset the failure streak
    pub fn succeed(&mut self) {
        self.failures = 0;
        self.state = ConnectionState::Connected;
    }

    /// The attempt failed: either back off or give up
    pub fn fail(&mut self) -> FailureAction {
        self.failures += 1;

        if self.policy.allows_retry(self.failures) {
            let delay = self.policy.delay_for(self.failures);
            self.state = ConnectionState::Backoff {
                attempt: self.failures + 1,
                delay,
            };
            FailureAction::RetryAfter(delay)
        } else {
            self.state = ConnectionState::Disconnected;
            FailureAction::GiveUp {
                attempts: self.failures,
            }
        }
    }

    /// An established connection went away
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

/// Why a supervised operation did not produce a value
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// The error was classified as not worth retrying
    #[error("{0}")]
    Permanent(E),

    #[error("cancelled while retrying")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if one was observed
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Permanent(err) => Some(err),
            RetryError::Cancelled => None,
        }
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with(policy, operation, cancel, |_| true, op).await
}

/// Like [`retry`], but errors for which `is_retryable` returns false end the
/// loop immediately with [`RetryError::Permanent`].
///
/// Cancellation is only observed while sleeping between attempts; an attempt
/// that has started is always allowed to finish.
pub async fn retry_with<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    operation: &str,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    R: Fn(&E) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut supervisor = Supervisor::new(policy.clone());

    loop {
        let attempt = supervisor.begin_attempt();

        let err = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "Succeeded after retrying");
                }
                supervisor.succeed();
                return Ok(value);
            },
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(RetryError::Permanent(err));
        }

        match supervisor.fail() {
            FailureAction::RetryAfter(delay) => {
                warn!(
                    operation,
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Attempt failed, backing off"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {},
                }
            },
            FailureAction::GiveUp { attempts } => {
                warn!(operation, attempts, error = %err, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts,
                    last_error: err,
                });
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy(None);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(6), Duration::from_secs(32));
        assert_eq!(p.delay_for(7), Duration::from_secs(60));
        assert_eq!(p.delay_for(500), Duration::from_secs(60));
    }

    #[test]
    fn test_supervisor_transitions() {
        let mut sup = Supervisor::new(policy(Some(2)));
        assert_eq!(sup.state(), ConnectionState::Disconnected);

        assert_eq!(sup.begin_attempt(), 1);
        assert_eq!(sup.state(), ConnectionState::Connecting { attempt: 1 });

        assert_eq!(sup.fail(), FailureAction::RetryAfter(Duration::from_secs(1)));
        assert_eq!(
            sup.state(),
            ConnectionState::Backoff {
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );

        assert_eq!(sup.begin_attempt(), 2);
        assert_eq!(sup.fail(), FailureAction::RetryAfter(Duration::from_secs(2)));

        assert_eq!(sup.begin_attempt(), 3);
        assert_eq!(sup.fail(), FailureAction::GiveUp { attempts: 3 });
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut sup = Supervisor::new(policy(Some(1)));
        sup.begin_attempt();
        sup.fail();
        sup.begin_attempt();
        sup.succeed();

        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(sup.failures(), 0);

        sup.disconnect();
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(sup.begin_attempt(), 1);
    }

    #[test]
    fn test_unbounded_never_gives_up() {
        let mut sup = Supervisor::new(policy(None));
        for _ in 0..1_000 {
            sup.begin_attempt();
            assert!(matches!(sup.fail(), FailureAction::RetryAfter(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<u32, RetryError<String>> =
            retry(&policy(None), "flaky", &cancel, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Err(format!("attempt {} failed", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_bounded_policy() {
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<String>> =
            retry(&policy(Some(2)), "always fails", &cancel, |_| async {
                Err("down".to_string())
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "down");
            },
            other => panic!("expected exhaustion, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> = retry_with(
            &policy(None),
            "constraint",
            &cancel,
            |err: &&str| *err != "permanent",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent("permanent"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<String>> =
            retry(&policy(None), "never up", &cancel, |_| async {
                Err("refused".to_string())
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
