//! Fixed-size worker pool over the job ledger.
//!
//! One dispatcher claims batches and feeds a bounded channel; each worker
//! owns its own SQLite connection and runs whole jobs. A heartbeat thread
//! keeps the pool's claims fresh so other processes leave them alone.
//!
//! Job ownership lives only in the ledger: a job is handed to the channel
//! after the claim has committed, and the mutex around the receiver just
//! decides which local thread picks it up. Two pools in different processes
//! coordinate through the claim statement alone.

use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;

use crate::db;
use crate::models::{Job, JobState};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::error::PipelineError;
use crate::pipeline::orchestrator::{release, DocumentProcessor, JobOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub workers: usize,
    pub batch_size: usize,
    /// Finished jobs between reclamation passes on a worker's connection.
    pub reclaim_interval: u64,
    pub heartbeat_interval: Duration,
}

/// Upper bound on how long the heartbeat thread sleeps between checks.
const HEARTBEAT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub quarantined: usize,
    pub failed: usize,
    pub released: usize,
    pub abandoned: usize,
    pub elapsed: Duration,
}

impl BatchSummary {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Quarantined => self.quarantined += 1,
            JobOutcome::Failed(_) => self.failed += 1,
            JobOutcome::Released => self.released += 1,
            JobOutcome::Abandoned => self.abandoned += 1,
        }
    }

    fn merge(&mut self, other: &BatchSummary) {
        self.completed += other.completed;
        self.quarantined += other.quarantined;
        self.failed += other.failed;
        self.released += other.released;
        self.abandoned += other.abandoned;
    }
}

/// Claim and process pending jobs until none are left, `limit` jobs have
/// been dispatched, or `token` is cancelled.
pub fn run_pool(
    db_path: &Path,
    processor: &DocumentProcessor,
    settings: PoolSettings,
    limit: Option<usize>,
    token: &CancellationToken,
) -> Result<BatchSummary, PipelineError> {
    let started = Instant::now();
    let workers = settings.workers.max(1);
    let claimant = format!("folio-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple());
    let dispatch_conn = db::open_database(db_path)?;

    tracing::info!(
        workers,
        batch_size = settings.batch_size,
        claimant = %claimant,
        "Worker pool starting"
    );

    // Opened up front so a worker can never die before draining the channel.
    let connections = (0..workers)
        .map(|_| db::open_database(db_path))
        .collect::<Result<Vec<_>, _>>()?;

    let heartbeat_conn = db::open_database(db_path)?;

    let (tx, rx) = sync_channel::<Job>(workers);
    let rx = Mutex::new(rx);
    let stop = AtomicBool::new(false);

    let (dispatched, worker_results) = std::thread::scope(|scope| {
        let heartbeat = {
            let (claimant, stop) = (&claimant, &stop);
            scope.spawn(move || {
                heartbeat_loop(heartbeat_conn, claimant, settings.heartbeat_interval, stop)
            })
        };
        let handles: Vec<_> = connections
            .into_iter()
            .enumerate()
            .map(|(index, conn)| {
                let rx = &rx;
                scope.spawn(move || worker_loop(index, conn, processor, rx, settings, token))
            })
            .collect();

        let dispatched = dispatch(&dispatch_conn, &claimant, settings.batch_size, limit, token, tx);
        let results: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        stop.store(true, Ordering::Release);
        if heartbeat.join().is_err() {
            tracing::error!("Heartbeat thread panicked");
        }
        (dispatched, results)
    });

    let mut summary = BatchSummary::default();
    let mut first_error = None;

    match dispatched {
        Ok(dispatch) => {
            summary.claimed = dispatch.claimed;
            summary.merge(&dispatch.tally);
        }
        Err(e) => first_error = Some(e),
    }
    for (index, result) in worker_results.into_iter().enumerate() {
        match result {
            Ok(tally) => summary.merge(&tally),
            Err(_) => {
                tracing::error!(worker = index, "Worker thread panicked");
                first_error.get_or_insert(PipelineError::WorkerPanic(format!("worker {index}")));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    summary.elapsed = started.elapsed();
    tracing::info!(
        claimed = summary.claimed,
        completed = summary.completed,
        quarantined = summary.quarantined,
        failed = summary.failed,
        released = summary.released,
        abandoned = summary.abandoned,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Batch finished"
    );
    Ok(summary)
}

struct Dispatched {
    claimed: usize,
    /// Jobs released by the dispatcher itself after cancellation.
    tally: BatchSummary,
}

fn dispatch(
    conn: &Connection,
    claimant: &str,
    batch_size: usize,
    limit: Option<usize>,
    token: &CancellationToken,
    tx: SyncSender<Job>,
) -> Result<Dispatched, PipelineError> {
    let mut claimed = 0;
    let mut tally = BatchSummary::default();
    let mut remaining = limit.unwrap_or(usize::MAX);

    while remaining > 0 && !token.is_cancelled() {
        let batch = db::claim_batch(conn, claimant, batch_size.min(remaining), Utc::now())?;
        if batch.is_empty() {
            break;
        }
        claimed += batch.len();
        remaining = remaining.saturating_sub(batch.len());
        tracing::debug!(count = batch.len(), "Claimed batch");

        let mut jobs = batch.into_iter();
        for job in jobs.by_ref() {
            if token.is_cancelled() {
                tally.record(release(conn, &job, JobState::Fetching)?);
                break;
            }
            if let Err(unsent) = tx.send(job) {
                // Every worker is gone; hand the job back.
                tally.record(release(conn, &unsent.0, JobState::Fetching)?);
                break;
            }
        }
        for job in jobs {
            tally.record(release(conn, &job, JobState::Fetching)?);
        }
    }

    Ok(Dispatched { claimed, tally })
}

/// Re-stamp every in-flight job held by `claimant` each `interval` until
/// `stop` is set.
fn heartbeat_loop(conn: Connection, claimant: &str, interval: Duration, stop: &AtomicBool) {
    let tick = interval.min(HEARTBEAT_POLL);
    let mut last_beat = Instant::now();
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(tick);
        if last_beat.elapsed() < interval {
            continue;
        }
        last_beat = Instant::now();
        match db::touch_claims(&conn, claimant, Utc::now()) {
            Ok(jobs) => tracing::trace!(jobs, "Heartbeat"),
            Err(e) => tracing::warn!(error = %e, "Heartbeat failed"),
        }
    }
}

fn worker_loop(
    index: usize,
    conn: Connection,
    processor: &DocumentProcessor,
    rx: &Mutex<Receiver<Job>>,
    settings: PoolSettings,
    token: &CancellationToken,
) -> BatchSummary {
    let _span = tracing::info_span!("worker", worker = index).entered();
    let mut tally = BatchSummary::default();
    let mut finished: u64 = 0;

    loop {
        let next = {
            let guard = rx.lock().unwrap_or_else(|p| p.into_inner());
            guard.recv()
        };
        let Ok(job) = next else { break };

        let outcome = if token.is_cancelled() {
            release(&conn, &job, JobState::Fetching)
        } else {
            processor.process(&conn, &job, token)
        };
        match outcome {
            Ok(outcome) => tally.record(outcome),
            Err(e) => {
                tracing::error!(
                    file_id = %job.file_id,
                    error = %e,
                    "Ledger write failed; job left for recovery"
                );
                tally.abandoned += 1;
            }
        }

        finished += 1;
        if settings.reclaim_interval > 0 && finished % settings.reclaim_interval == 0 {
            if let Err(e) = db::reclaim_memory(&conn) {
                tracing::warn!(error = %e, "Memory reclamation failed");
            } else {
                tracing::debug!(finished, "Reclaimed connection memory");
            }
        }
    }

    tally
}
