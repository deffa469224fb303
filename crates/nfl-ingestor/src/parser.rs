//! Source row to [`Game`] conversion
//!
//! The parser is a total, side-effect free function: every row yields either a
//! [`Game`] or a [`RejectionReason`]. Only the four required fields can reject
//! a row. Any optional numeric value that is empty, malformed or out of range
//! degrades to `None`.

use std::collections::HashMap;
use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{NaiveDate, Utc};
use nfl_common::{Game, GameId};
use thiserror::Error;

/// Largest magnitude a line value may have (`NUMERIC(5,1)` in storage)
const MAX_LINE_MAGNITUDE: i64 = 10_000;

/// Fractional digits kept on spread and total values
const LINE_SCALE: i64 = 1;

/// Integer digits that fit before the decimal point of `NUMERIC(5,1)`
const MAX_LINE_INT_DIGITS: i64 = 4;

// ============================================================================
// Column mapping
// ============================================================================

/// A source column: its CSV header and the snake_case fallback key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub header: &'static str,
    pub key: &'static str,
}

const fn col(header: &'static str, key: &'static str) -> Column {
    Column { header, key }
}

pub const GAME_ID: Column = col("Game ID", "game_id");
pub const DATE: Column = col("Date", "game_date");
pub const AWAY_TEAM: Column = col("Away Team", "away_team");
pub const AWAY_SCORE: Column = col("Away Score", "away_score");
pub const HOME_TEAM: Column = col("Home Team", "home_team");
pub const HOME_SCORE: Column = col("Home Score", "home_score");

pub const AWAY_SPREAD_OPEN: Column = col("Away Spread Open", "away_spread_open");
pub const AWAY_SPREAD_OPEN_ODDS: Column = col("Away Spread Open Odds", "away_spread_open_odds");
pub const AWAY_SPREAD_CLOSE: Column = col("Away Spread Close", "away_spread_close");
pub const AWAY_SPREAD_CLOSE_ODDS: Column = col("Away Spread Close Odds", "away_spread_close_odds");
pub const AWAY_MONEYLINE_OPEN: Column = col("Away MoneyLine Open", "away_moneyline_open");
pub const AWAY_MONEYLINE_CLOSE: Column = col("Away MoneyLine Close", "away_moneyline_close");

pub const HOME_SPREAD_OPEN: Column = col("Home Spread Open", "home_spread_open");
pub const HOME_SPREAD_OPEN_ODDS: Column = col("Home Spread Open Odds", "home_spread_open_odds");
pub const HOME_SPREAD_CLOSE: Column = col("Home Spread Close", "home_spread_close");
pub const HOME_SPREAD_CLOSE_ODDS: Column = col("Home Spread Close Odds", "home_spread_close_odds");
pub const HOME_MONEYLINE_OPEN: Column = col("Home MoneyLine Open", "home_moneyline_open");
pub const HOME_MONEYLINE_CLOSE: Column = col("Home MoneyLine Close", "home_moneyline_close");

pub const OVER_OPEN: Column = col("Over Open", "over_open");
pub const OVER_OPEN_ODDS: Column = col("Over Open Odds", "over_open_odds");
pub const OVER_CLOSE: Column = col("Over Close", "over_close");
pub const OVER_CLOSE_ODDS: Column = col("Over Close Odds", "over_close_odds");
pub const UNDER_OPEN: Column = col("Under Open", "under_open");
pub const UNDER_OPEN_ODDS: Column = col("Under Open Odds", "under_open_odds");
pub const UNDER_CLOSE: Column = col("Under Close", "under_close");
pub const UNDER_CLOSE_ODDS: Column = col("Under Close Odds", "under_close_odds");

// ============================================================================
// Raw rows
// ============================================================================

/// One source row as field-value pairs, all values still strings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    fields: HashMap<String, String>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zip a header row with a record; surplus or missing cells are ignored
    pub fn from_record(headers: &csv::StringRecord, record: &csv::StringRecord) -> Self {
        headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.trim().to_string(), v.to_string()))
            .collect()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Trimmed, non-empty value of a column, by header first, then by key
    pub fn value(&self, column: Column) -> Option<&str> {
        [column.header, column.key]
            .into_iter()
            .filter_map(|name| self.fields.get(name))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }

    /// Raw `game_id` text, for log lines about rejected rows
    pub fn game_id_text(&self) -> Option<&str> {
        self.value(GAME_ID)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ============================================================================
// Rejections
// ============================================================================

/// Why a row cannot become a [`Game`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("missing or invalid required field '{field}'")]
    MissingRequiredField { field: &'static str },

    #[error("invalid date '{value}', expected YYYYMMDD")]
    InvalidDate { value: String },
}

/// A rejected source row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {row} (game_id {}): {reason}", .game_id.as_deref().unwrap_or("unknown"))]
pub struct ParseError {
    /// 1-based line in the source file
    pub row: u64,
    /// Raw `game_id` text when the row had one
    pub game_id: Option<String>,
    pub reason: RejectionReason,
}

impl ParseError {
    pub fn new(row: u64, raw: &RawRow, reason: RejectionReason) -> Self {
        Self {
            row,
            game_id: raw.game_id_text().map(str::to_string),
            reason,
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Convert one row into a [`Game`]
pub fn parse_row(row: &RawRow) -> Result<Game, RejectionReason> {
    let game_id = parse_game_id(row)?;
    let game_date = parse_game_date(row)?;
    let away_team = required_text(row, AWAY_TEAM)?;
    let home_team = required_text(row, HOME_TEAM)?;

    let int = |column| row.value(column).and_then(parse_int);
    let line = |column| row.value(column).and_then(parse_line);

    Ok(Game {
        game_id,
        game_date,
        away_team: away_team.to_string(),
        away_score: int(AWAY_SCORE),
        home_team: home_team.to_string(),
        home_score: int(HOME_SCORE),

        away_spread_open: line(AWAY_SPREAD_OPEN),
        away_spread_open_odds: int(AWAY_SPREAD_OPEN_ODDS),
        away_spread_close: line(AWAY_SPREAD_CLOSE),
        away_spread_close_odds: int(AWAY_SPREAD_CLOSE_ODDS),
        away_moneyline_open: int(AWAY_MONEYLINE_OPEN),
        away_moneyline_close: int(AWAY_MONEYLINE_CLOSE),

        home_spread_open: line(HOME_SPREAD_OPEN),
        home_spread_open_odds: int(HOME_SPREAD_OPEN_ODDS),
        home_spread_close: line(HOME_SPREAD_CLOSE),
        home_spread_close_odds: int(HOME_SPREAD_CLOSE_ODDS),
        home_moneyline_open: int(HOME_MONEYLINE_OPEN),
        home_moneyline_close: int(HOME_MONEYLINE_CLOSE),

        over_open: line(OVER_OPEN),
        over_open_odds: int(OVER_OPEN_ODDS),
        over_close: line(OVER_CLOSE),
        over_close_odds: int(OVER_CLOSE_ODDS),
        under_open: line(UNDER_OPEN),
        under_open_odds: int(UNDER_OPEN_ODDS),
        under_close: line(UNDER_CLOSE),
        under_close_odds: int(UNDER_CLOSE_ODDS),

        processed_at: Utc::now(),
    })
}

fn parse_game_id(row: &RawRow) -> Result<GameId, RejectionReason> {
    row.value(GAME_ID)
        .and_then(|v| v.parse::<GameId>().ok())
        .filter(|id| *id > 0)
        .ok_or(RejectionReason::MissingRequiredField { field: GAME_ID.key })
}

fn parse_game_date(row: &RawRow) -> Result<NaiveDate, RejectionReason> {
    let value = row
        .value(DATE)
        .ok_or(RejectionReason::MissingRequiredField { field: DATE.key })?;

    parse_date(value).ok_or_else(|| RejectionReason::InvalidDate {
        value: value.to_string(),
    })
}

fn required_text(row: &RawRow, column: Column) -> Result<&str, RejectionReason> {
    row.value(column)
        .ok_or(RejectionReason::MissingRequiredField { field: column.key })
}

/// `YYYYMMDD`, exactly eight ASCII digits naming a real calendar day
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let year = value[0..4].parse().ok()?;
    let month = value[4..6].parse().ok()?;
    let day = value[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Signed 32-bit integer (scores, odds, moneylines)
pub fn parse_int(value: &str) -> Option<i32> {
    value.trim().parse().ok()
}

/// Spread or total value, rounded to one decimal; `None` if it cannot be stored
pub fn parse_line(value: &str) -> Option<BigDecimal> {
    let parsed = BigDecimal::from_str(value.trim()).ok()?;
    if parsed.is_zero() {
        return Some(BigDecimal::zero().with_scale(LINE_SCALE));
    }

    // Exponent notation can name values far too large to materialize, so the
    // magnitude is bounded from the digit count before any arithmetic.
    let (_, scale) = parsed.as_bigint_and_exponent();
    let int_digits = i64::try_from(parsed.digits())
        .unwrap_or(i64::MAX)
        .saturating_sub(scale);
    if int_digits > MAX_LINE_INT_DIGITS {
        return None;
    }
    if int_digits < -1 {
        // Below 0.01 in magnitude, rounds to zero
        return Some(BigDecimal::zero().with_scale(LINE_SCALE));
    }

    let rounded = parsed.round(LINE_SCALE);

    if rounded.abs() >= BigDecimal::from(MAX_LINE_MAGNITUDE) {
        return None;
    }

    Some(rounded.with_scale(LINE_SCALE))
}
