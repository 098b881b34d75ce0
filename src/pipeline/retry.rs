//! Retry policy for failed jobs.
//!
//! `should_retry` is the single decision point; `sweep` applies it to the
//! ledger and requeues whatever is due.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::RetryPolicy;
use crate::db::{self, DatabaseError};
use crate::models::{Job, JobState, TransitionFields};

const SWEEP_PAGE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Wait before the next attempt, measured from when the job failed.
    pub delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweepSummary {
    pub scanned: usize,
    pub requeued: usize,
    /// Eligible but still inside their backoff delay.
    pub waiting: usize,
    /// At `max_retries`; left for manual quarantine.
    pub exhausted: usize,
    pub conflicts: usize,
}

/// `base_delay * backoff_multiplier ^ retry_count`, saturating at the
/// largest representable duration.
pub fn delay_for(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let factor = policy.backoff_multiplier.powi(retry_count.min(i32::MAX as u32) as i32);
    Duration::try_from_secs_f64(policy.base_delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

pub fn should_retry(job: &Job, policy: &RetryPolicy) -> RetryDecision {
    RetryDecision {
        retry: job.state == JobState::Failed && job.retry_count < policy.max_retries,
        delay: delay_for(policy, job.retry_count),
    }
}

/// Requeue every failed job whose backoff has elapsed at `now`.
pub fn sweep(
    conn: &Connection,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<RetrySweepSummary, DatabaseError> {
    let mut summary = RetrySweepSummary::default();
    let mut after_id = 0;

    loop {
        let page = db::list_page(conn, JobState::Failed, after_id, SWEEP_PAGE)?;
        let Some(last) = page.last() else { break };
        after_id = last.id;

        for job in &page {
            summary.scanned += 1;
            let decision = should_retry(job, policy);
            if !decision.retry {
                summary.exhausted += 1;
                continue;
            }
            if !is_due(job, decision.delay, now) {
                summary.waiting += 1;
                continue;
            }
            match db::record_transition(
                conn,
                job.id,
                JobState::Failed,
                JobState::Pending,
                TransitionFields::none(),
                now,
            ) {
                Ok(requeued) => {
                    tracing::info!(
                        file_id = %requeued.file_id,
                        retry_count = requeued.retry_count,
                        "Requeued failed job"
                    );
                    summary.requeued += 1;
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(file_id = %job.file_id, "Job moved during retry sweep");
                    summary.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if page.len() < SWEEP_PAGE {
            break;
        }
    }

    if summary.requeued > 0 || summary.exhausted > 0 {
        tracing::info!(
            scanned = summary.scanned,
            requeued = summary.requeued,
            waiting = summary.waiting,
            exhausted = summary.exhausted,
            "Retry sweep finished"
        );
    }
    Ok(summary)
}

fn is_due(job: &Job, delay: Duration, now: DateTime<Utc>) -> bool {
    let Some(failed_at) = job.stage_started_at.or(job.last_retry_at) else {
        return true;
    };
    match chrono::Duration::from_std(delay) {
        Ok(delay) => failed_at
            .checked_add_signed(delay)
            .map(|due| due <= now)
            .unwrap_or(false),
        Err(_) => false,
    }
}
