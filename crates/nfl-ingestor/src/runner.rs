//! Ingest run loop: source rows in, confirmed queue messages out

use std::time::Duration;

use nfl_common::logging::stage;
use nfl_common::queue::QueuePublisher;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PublishFailure, Result};
use crate::parser::{parse_row, ParseError};
use crate::publisher::GamePublisher;
use crate::source::SourceItem;

/// Counts reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Data lines read from the source, including rejected ones
    pub rows_read: u64,
    pub published: u64,
    pub rejected: u64,
    /// The run stopped on a shutdown signal before the source was exhausted
    pub interrupted: bool,
}

/// Parse, publish and pace every row until the source ends or `cancel` fires.
///
/// Bad rows are logged and skipped. A publish that cannot be confirmed ends
/// the run with an error; the row is never skipped silently.
pub async fn run<I, P>(
    rows: I,
    publisher: &mut GamePublisher<P>,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<RunSummary>
where
    I: IntoIterator<Item = SourceItem>,
    P: QueuePublisher,
{
    let mut summary = RunSummary::default();

    for item in rows {
        if cancel.is_cancelled() {
            summary.interrupted = true;
            break;
        }

        summary.rows_read += 1;

        let source_row = match item {
            SourceItem::Row(source_row) => source_row,
            SourceItem::Unreadable { line, error } => {
                summary.rejected += 1;
                warn!(row = line, stage = stage::REJECTED, error = %error, "Skipped unreadable row");
                continue;
            },
        };

        let game = match parse_row(&source_row.row) {
            Ok(game) => game,
            Err(reason) => {
                summary.rejected += 1;
                let err = ParseError::new(source_row.line, &source_row.row, reason);
                warn!(
                    row = err.row,
                    game_id = err.game_id.as_deref().unwrap_or("unknown"),
                    stage = stage::REJECTED,
                    reason = %err.reason,
                    "Skipped invalid row"
                );
                continue;
            },
        };

        debug!(game_id = game.game_id, row = source_row.line, stage = stage::PARSED, "Parsed row");

        match publisher.publish(&game).await {
            Ok(_) => summary.published += 1,
            Err(PublishFailure::Cancelled { game_id }) => {
                warn!(game_id, "Shutdown while retrying publish, game not published");
                summary.interrupted = true;
                break;
            },
            Err(err) => return Err(err.into()),
        }

        if !interval.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.interrupted = true;
                    break;
                },
                _ = tokio::time::sleep(interval) => {},
            }
        }
    }

    info!(
        rows_read = summary.rows_read,
        published = summary.published,
        rejected = summary.rejected,
        interrupted = summary.interrupted,
        "Ingest run finished"
    );

    Ok(summary)
}
