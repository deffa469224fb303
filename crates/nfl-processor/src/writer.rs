//! Game storage: transactional upsert keyed by `game_id`
//!
//! `INSERT ... ON CONFLICT (game_id) DO UPDATE` is the only write path. The
//! statement runs inside its own transaction, so a failure at any point leaves
//! the row exactly as it was. Applying the same record twice gives the same
//! row, apart from `updated_at`.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use nfl_common::queue::DeadLetterReason;
use nfl_common::{Game, GameId};
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;

/// Failure of one storage operation, classified by how to react to it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Connection-level trouble; retry with backoff
    #[error("Transient database error: {0}")]
    TransientConnection(String),

    /// The row itself is unacceptable; never retry
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Lost a race with a concurrent writer; retry
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    /// Anything else; retrying cannot help
    #[error("Database error: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::TransientConnection(_) | StorageError::SerializationConflict(_)
        )
    }

    /// Dead-letter reason for a failure that will not be retried further
    pub fn dead_letter_reason(&self) -> DeadLetterReason {
        match self {
            StorageError::ConstraintViolation(_) => DeadLetterReason::ConstraintViolation,
            StorageError::Permanent(_) => DeadLetterReason::PermanentStorage,
            StorageError::TransientConnection(_) | StorageError::SerializationConflict(_) => {
                DeadLetterReason::RetriesExhausted
            },
        }
    }

    /// Classify a Postgres SQLSTATE code
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let message = format!("[{}] {}", code, message.into());

        match code {
            "40001" | "40P01" => StorageError::SerializationConflict(message),
            // admin/crash shutdown, cannot connect now, too many connections
            "57P01" | "57P02" | "57P03" | "53300" => StorageError::TransientConnection(message),
            _ if code.starts_with("23") => StorageError::ConstraintViolation(message),
            _ if code.starts_with("08") => StorageError::TransientConnection(message),
            _ => StorageError::Permanent(message),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db) => match db.code() {
                Some(code) => StorageError::from_sqlstate(&code, db.message()),
                None => StorageError::Permanent(err.to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::TransientConnection(err.to_string()),
            _ => StorageError::Permanent(err.to_string()),
        }
    }
}

/// What the upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl std::fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpsertOutcome::Inserted => write!(f, "inserted"),
            UpsertOutcome::Updated => write!(f, "updated"),
        }
    }
}

/// Storage seam used by the consumer loop
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Insert or fully overwrite the row for `game.game_id` in one transaction
    async fn upsert(&self, game: &Game) -> Result<UpsertOutcome, StorageError>;
}

/// A `games` row as stored
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredGame {
    pub game_id: GameId,
    pub game_date: NaiveDate,
    pub away_team: String,
    pub away_score: Option<i32>,
    pub home_team: String,
    pub home_score: Option<i32>,
    pub away_spread_open: Option<BigDecimal>,
    pub away_spread_open_odds: Option<i32>,
    pub away_spread_close: Option<BigDecimal>,
    pub away_spread_close_odds: Option<i32>,
    pub away_moneyline_open: Option<i32>,
    pub away_moneyline_close: Option<i32>,
    pub home_spread_open: Option<BigDecimal>,
    pub home_spread_open_odds: Option<i32>,
    pub home_spread_close: Option<BigDecimal>,
    pub home_spread_close_odds: Option<i32>,
    pub home_moneyline_open: Option<i32>,
    pub home_moneyline_close: Option<i32>,
    pub over_open: Option<BigDecimal>,
    pub over_open_odds: Option<i32>,
    pub over_close: Option<BigDecimal>,
    pub over_close_odds: Option<i32>,
    pub under_open: Option<BigDecimal>,
    pub under_open_odds: Option<i32>,
    pub under_close: Option<BigDecimal>,
    pub under_close_odds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const UPSERT_GAME: &str = r#"
INSERT INTO games (
    game_id, game_date, away_team, away_score, home_team, home_score,
    away_spread_open, away_spread_open_odds, away_spread_close, away_spread_close_odds,
    away_moneyline_open, away_moneyline_close,
    home_spread_open, home_spread_open_odds, home_spread_close, home_spread_close_odds,
    home_moneyline_open, home_moneyline_close,
    over_open, over_open_odds, over_close, over_close_odds,
    under_open, under_open_odds, under_close, under_close_odds
) VALUES (
    $1, $2, $3, $4, $5, $6,
    $7, $8, $9, $10, $11, $12,
    $13, $14, $15, $16, $17, $18,
    $19, $20, $21, $22, $23, $24, $25, $26
)
ON CONFLICT (game_id) DO UPDATE SET
    game_date = EXCLUDED.game_date,
    away_team = EXCLUDED.away_team,
    away_score = EXCLUDED.away_score,
    home_team = EXCLUDED.home_team,
    home_score = EXCLUDED.home_score,
    away_spread_open = EXCLUDED.away_spread_open,
    away_spread_open_odds = EXCLUDED.away_spread_open_odds,
    away_spread_close = EXCLUDED.away_spread_close,
    away_spread_close_odds = EXCLUDED.away_spread_close_odds,
    away_moneyline_open = EXCLUDED.away_moneyline_open,
    away_moneyline_close = EXCLUDED.away_moneyline_close,
    home_spread_open = EXCLUDED.home_spread_open,
    home_spread_open_odds = EXCLUDED.home_spread_open_odds,
    home_spread_close = EXCLUDED.home_spread_close,
    home_spread_close_odds = EXCLUDED.home_spread_close_odds,
    home_moneyline_open = EXCLUDED.home_moneyline_open,
    home_moneyline_close = EXCLUDED.home_moneyline_close,
    over_open = EXCLUDED.over_open,
    over_open_odds = EXCLUDED.over_open_odds,
    over_close = EXCLUDED.over_close,
    over_close_odds = EXCLUDED.over_close_odds,
    under_open = EXCLUDED.under_open,
    under_open_odds = EXCLUDED.under_open_odds,
    under_close = EXCLUDED.under_close,
    under_close_odds = EXCLUDED.under_close_odds,
    updated_at = clock_timestamp()
RETURNING (xmax = 0) AS inserted
"#;

const SELECT_GAME: &str = r#"
SELECT
    game_id, game_date, away_team, away_score, home_team, home_score,
    away_spread_open, away_spread_open_odds, away_spread_close, away_spread_close_odds,
    away_moneyline_open, away_moneyline_close,
    home_spread_open, home_spread_open_odds, home_spread_close, home_spread_close_odds,
    home_moneyline_open, home_moneyline_close,
    over_open, over_open_odds, over_close, over_close_odds,
    under_open, under_open_odds, under_close, under_close_odds,
    created_at, updated_at
FROM games
WHERE game_id = $1
"#;

/// Postgres-backed [`GameStore`]
#[derive(Debug, Clone)]
pub struct PgGameStore {
    pool: PgPool,
}

impl PgGameStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn find(&self, game_id: GameId) -> Result<Option<StoredGame>, StorageError> {
        let row = sqlx::query_as::<_, StoredGame>(SELECT_GAME)
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM games")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl GameStore for PgGameStore {
    async fn upsert(&self, game: &Game) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_scalar::<_, bool>(UPSERT_GAME)
            .bind(game.game_id)
            .bind(game.game_date)
            .bind(&game.away_team)
            .bind(game.away_score)
            .bind(&game.home_team)
            .bind(game.home_score)
            .bind(&game.away_spread_open)
            .bind(game.away_spread_open_odds)
            .bind(&game.away_spread_close)
            .bind(game.away_spread_close_odds)
            .bind(game.away_moneyline_open)
            .bind(game.away_moneyline_close)
            .bind(&game.home_spread_open)
            .bind(game.home_spread_open_odds)
            .bind(&game.home_spread_close)
            .bind(game.home_spread_close_odds)
            .bind(game.home_moneyline_open)
            .bind(game.home_moneyline_close)
            .bind(&game.over_open)
            .bind(game.over_open_odds)
            .bind(&game.over_close)
            .bind(game.over_close_odds)
            .bind(&game.under_open)
            .bind(game.under_open_odds)
            .bind(&game.under_close)
            .bind(game.under_close_odds)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        let outcome = if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        };
        debug!(game_id = game.game_id, %outcome, "Upsert committed");

        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert!(matches!(
            StorageError::from_sqlstate("23505", "duplicate key"),
            StorageError::ConstraintViolation(_)
        ));
        assert!(matches!(
            StorageError::from_sqlstate("23514", "check violation"),
            StorageError::ConstraintViolation(_)
        ));
        assert!(matches!(
            StorageError::from_sqlstate("40001", "could not serialize"),
            StorageError::SerializationConflict(_)
        ));
        assert!(matches!(
            StorageError::from_sqlstate("40P01", "deadlock detected"),
            StorageError::SerializationConflict(_)
        ));
        assert!(matches!(
            StorageError::from_sqlstate("08006", "connection failure"),
            StorageError::TransientConnection(_)
        ));
        assert!(matches!(
            StorageError::from_sqlstate("57P01", "terminating connection"),
            StorageError::TransientConnection(_)
        ));
        assert!(matches!(
            StorageError::from_sqlstate("22003", "numeric field overflow"),
            StorageError::Permanent(_)
        ));
        assert!(matches!(
            StorageError::from_sqlstate("42P01", "relation does not exist"),
            StorageError::Permanent(_)
        ));
    }

    #[test]
    fn test_sqlstate_message_keeps_code() {
        let err = StorageError::from_sqlstate("23505", "duplicate key");
        assert_eq!(err.to_string(), "Constraint violation: [23505] duplicate key");
    }

    #[test]
    fn test_connection_level_sqlx_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(StorageError::from(sqlx::Error::Io(io)).is_retryable());
        assert!(StorageError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(StorageError::from(sqlx::Error::PoolClosed).is_retryable());
        assert!(StorageError::from(sqlx::Error::Protocol("unexpected eof".into())).is_retryable());
    }

    #[test]
    fn test_other_sqlx_errors_are_permanent() {
        let err = StorageError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::Permanent(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_dead_letter_reasons() {
        assert_eq!(
            StorageError::ConstraintViolation(String::new()).dead_letter_reason(),
            DeadLetterReason::ConstraintViolation
        );
        assert_eq!(
            StorageError::Permanent(String::new()).dead_letter_reason(),
            DeadLetterReason::PermanentStorage
        );
        assert_eq!(
            StorageError::TransientConnection(String::new()).dead_letter_reason(),
            DeadLetterReason::RetriesExhausted
        );
    }
}
