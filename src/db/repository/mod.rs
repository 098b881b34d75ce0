//! Repository layer: job ledger operations over a borrowed connection.
//!
//! Every function takes `&Connection` so callers decide which connection
//! (and therefore which thread) performs the write.

mod job;
mod stats;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::ErrorCode;

use super::DatabaseError;

pub use job::*;
pub use stats::*;

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that
/// text comparison in SQL matches chronological order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode_ts(column: &str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidTimestamp {
            column: column.into(),
            value: value.into(),
        })
}

pub(crate) fn decode_opt_ts(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value.map(|v| decode_ts(column, &v)).transpose()
}

/// Trigger aborts and CHECK failures surface as constraint violations.
pub(crate) fn map_write_error(e: rusqlite::Error) -> DatabaseError {
    if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        DatabaseError::ConstraintViolation(e.to_string())
    } else {
        DatabaseError::Sqlite(e)
    }
}
