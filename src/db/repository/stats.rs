use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use super::encode_ts;
use crate::db::DatabaseError;
use crate::models::*;

/// Compute a statistics snapshot from the ledger.
///
/// All reads share one deferred transaction, so under WAL they see a single
/// consistent version of the table and never block writers.
pub fn snapshot_stats(
    conn: &Connection,
    now: DateTime<Utc>,
    window: Duration,
    max_retries: u32,
) -> Result<AggregateStatistics, DatabaseError> {
    let tx = conn.unchecked_transaction()?;

    let mut by_state: BTreeMap<JobState, u64> =
        JobState::all().iter().map(|s| (*s, 0)).collect();
    {
        let mut stmt = tx.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (state, count) in rows {
            by_state.insert(state.parse()?, count as u64);
        }
    }
    let total: u64 = by_state.values().sum();

    let (mean_confidence, mean_processing_ms, pages_completed) = tx.query_row(
        "SELECT AVG(aggregate_confidence), AVG(processing_time_ms), COALESCE(SUM(page_count), 0)
         FROM jobs WHERE state = 'completed'",
        [],
        |row| {
            Ok((
                row.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
                row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                row.get::<_, i64>(2)?,
            ))
        },
    )?;

    let needs_review: i64 = tx.query_row(
        "SELECT COUNT(*) FROM jobs WHERE needs_review = 1",
        [],
        |row| row.get(0),
    )?;

    let exhausted: i64 = tx.query_row(
        "SELECT COUNT(*) FROM jobs WHERE state = 'failed' AND retry_count >= ?1",
        params![max_retries],
        |row| row.get(0),
    )?;

    let (files_in_window, pages_in_window) = tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(page_count), 0)
         FROM jobs WHERE state = 'completed' AND completed_at >= ?1",
        params![encode_ts(now - window)],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    )?;

    tx.finish()?;

    let rate = |count: u64| {
        if total == 0 {
            0.0
        } else {
            count as f64 * 100.0 / total as f64
        }
    };
    let window_secs = window.num_seconds().max(1) as u64;
    let per_hour = |count: i64| count as f64 * 3600.0 / window_secs as f64;

    Ok(AggregateStatistics {
        taken_at: Some(now),
        total,
        completion_rate: rate(by_state[&JobState::Completed]),
        failure_rate: rate(by_state[&JobState::Failed]),
        by_state,
        mean_confidence,
        mean_processing_secs: mean_processing_ms / 1000.0,
        needs_review: needs_review as u64,
        exhausted_failures: exhausted as u64,
        pages_completed: pages_completed as u64,
        throughput: Throughput {
            window_secs,
            files_in_window: files_in_window as u64,
            pages_in_window: pages_in_window as u64,
            files_per_hour: per_hour(files_in_window),
            pages_per_hour: per_hour(pages_in_window),
        },
    })
}
