//! Read-only statistics over the ledger and their text rendering.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::config::PipelineConfig;
use crate::db::{self, DatabaseError};
use crate::models::{AggregateStatistics, JobState};

/// Snapshot using the configured throughput window and retry limit.
pub fn collect(
    conn: &Connection,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<AggregateStatistics, DatabaseError> {
    let window = chrono::Duration::from_std(config.stats_window)
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    db::snapshot_stats(conn, now, window, config.retry.max_retries)
}

/// Fixed-width table for terminals.
pub fn render_table(stats: &AggregateStatistics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<24}{:>12}", "state", "jobs");
    for state in JobState::all() {
        let _ = writeln!(out, "{:<24}{:>12}", state.as_str(), stats.count(*state));
    }
    let _ = writeln!(out, "{:<24}{:>12}", "total", stats.total);
    out.push('\n');

    let rows: [(&str, String); 9] = [
        ("completion rate", format!("{:.1}%", stats.completion_rate)),
        ("failure rate", format!("{:.1}%", stats.failure_rate)),
        ("mean confidence", format!("{:.3}", stats.mean_confidence)),
        ("mean processing", format!("{:.2}s", stats.mean_processing_secs)),
        ("needs review", stats.needs_review.to_string()),
        ("exhausted failures", stats.exhausted_failures.to_string()),
        ("pages completed", stats.pages_completed.to_string()),
        ("files / hour", format!("{:.1}", stats.throughput.files_per_hour)),
        ("pages / hour", format!("{:.1}", stats.throughput.pages_per_hour)),
    ];
    for (label, value) in rows {
        let _ = writeln!(out, "{label:<24}{value:>12}");
    }
    let _ = write!(out, "(throughput over the last {}s)", stats.throughput.window_secs);
    out
}
