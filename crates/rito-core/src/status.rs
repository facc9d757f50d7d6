//! Ingestion lag status derived from the checkpointed cursor.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lag below this many minutes is reported as "no delay".
pub const DELAY_THRESHOLD_MINUTES: i64 = 5;

pub const COMMENT_NORMAL: &str = "Ingestion is running normally.";
pub const COMMENT_DELAYED: &str = "Ingestion is delayed.";
pub const COMMENT_UNKNOWN: &str = "Ingestion has not checkpointed yet.";

/// Status payload served on `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorStatus {
    pub comment: String,
    /// Minutes behind `now`, `0` while within the threshold, `None` when no
    /// cursor has been checkpointed.
    pub diff_minutes: Option<i64>,
}

/// Derive the status from the current time and the checkpointed cursor
/// position (microseconds since the Unix epoch).
pub fn derive_status(now: DateTime<Utc>, cursor_micros: Option<i64>) -> CursorStatus {
    let Some(cursor) = cursor_micros else {
        return CursorStatus {
            comment: COMMENT_UNKNOWN.to_string(),
            diff_minutes: None,
        };
    };

    let elapsed_minutes = (now.timestamp_micros() - cursor).max(0) / 60_000_000;

    if elapsed_minutes < DELAY_THRESHOLD_MINUTES {
        CursorStatus {
            comment: COMMENT_NORMAL.to_string(),
            diff_minutes: Some(0),
        }
    } else {
        CursorStatus {
            comment: COMMENT_DELAYED.to_string(),
            diff_minutes: Some(elapsed_minutes),
        }
    }
}
