//! Common types shared by the ingestor and the processor
//!
//! [`Game`] is the unit of transport: the ingestor builds one per source row,
//! serializes it onto the queue, and the processor upserts it into storage.
//! Both sides depend on this one definition so the wire format cannot drift.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Externally assigned game identifier, the idempotency key of the pipeline.
pub type GameId = i64;

/// One historical NFL game with its final score and betting lines.
///
/// Spread and total values are decimals with one fractional digit; odds and
/// moneylines use the American odds convention (signed integers).
///
/// The record is immutable in transit. Storage is the only place where two
/// records sharing a `game_id` are merged, and there the incoming values win.
///
/// # Examples
///
/// ```rust,ignore
/// use nfl_common::types::Game;
///
/// let game = Game::new(2009090100, date, "TEN", "PIT");
/// assert_eq!(game.matchup(), "TEN @ PIT");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub game_id: GameId,
    pub game_date: NaiveDate,

    pub away_team: String,
    /// Absent until the game has been played
    pub away_score: Option<i32>,
    pub home_team: String,
    /// Absent until the game has been played
    pub home_score: Option<i32>,

    // Away side
    pub away_spread_open: Option<BigDecimal>,
    pub away_spread_open_odds: Option<i32>,
    pub away_spread_close: Option<BigDecimal>,
    pub away_spread_close_odds: Option<i32>,
    pub away_moneyline_open: Option<i32>,
    pub away_moneyline_close: Option<i32>,

    // Home side
    pub home_spread_open: Option<BigDecimal>,
    pub home_spread_open_odds: Option<i32>,
    pub home_spread_close: Option<BigDecimal>,
    pub home_spread_close_odds: Option<i32>,
    pub home_moneyline_open: Option<i32>,
    pub home_moneyline_close: Option<i32>,

    // Total (over/under)
    pub over_open: Option<BigDecimal>,
    pub over_open_odds: Option<i32>,
    pub over_close: Option<BigDecimal>,
    pub over_close_odds: Option<i32>,
    pub under_open: Option<BigDecimal>,
    pub under_open_odds: Option<i32>,
    pub under_close: Option<BigDecimal>,
    pub under_close_odds: Option<i32>,

    /// When the source row was turned into this record
    pub processed_at: DateTime<Utc>,
}

impl Game {
    /// Create a game carrying only the required fields; every score and line is absent.
    pub fn new(
        game_id: GameId,
        game_date: NaiveDate,
        away_team: impl Into<String>,
        home_team: impl Into<String>,
    ) -> Self {
        Self {
            game_id,
            game_date,
            away_team: away_team.into(),
            away_score: None,
            home_team: home_team.into(),
            home_score: None,
            away_spread_open: None,
            away_spread_open_odds: None,
            away_spread_close: None,
            away_spread_close_odds: None,
            away_moneyline_open: None,
            away_moneyline_close: None,
            home_spread_open: None,
            home_spread_open_odds: None,
            home_spread_close: None,
            home_spread_close_odds: None,
            home_moneyline_open: None,
            home_moneyline_close: None,
            over_open: None,
            over_open_odds: None,
            over_close: None,
            over_close_odds: None,
            under_open: None,
            under_open_odds: None,
            under_close: None,
            under_close_odds: None,
            processed_at: Utc::now(),
        }
    }

    /// "AWAY @ HOME", the form used in log lines
    pub fn matchup(&self) -> String {
        format!("{} @ {}", self.away_team, self.home_team)
    }

    /// Whether both final scores are known
    pub fn is_final(&self) -> bool {
        self.away_score.is_some() && self.home_score.is_some()
    }

    /// Serialize to the field-named JSON payload carried on the queue.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a queue payload produced by [`Game::to_payload`].
    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

impl std::fmt::Display for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "game {} ({} on {})", self.game_id, self.matchup(), self.game_date)
    }
}
