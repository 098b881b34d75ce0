//! Explicit pipeline context.
//!
//! Built once at startup from a validated `PipelineConfig` and handed to
//! every operation. Owns the control connection to the ledger and the
//! shared `DocumentProcessor`; worker threads open their own connections.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::{ConfigError, PipelineConfig};
use crate::db;
use crate::models::{
    AggregateStatistics, ErrorKind, ErrorLogEntry, Job, JobError, JobState, TransitionFields,
};
use crate::pipeline::collaborators::CatalogSource;
use crate::pipeline::local::{FileSystemOutput, ImageRasterizer, LocalFetcher, TextSanitizer};
use crate::pipeline::pool::{run_pool, BatchSummary, PoolSettings};
use crate::pipeline::recognition::EnsembleCoordinator;
use crate::pipeline::retry::{self, RetrySweepSummary};
use crate::pipeline::{statistics, CancellationToken, DocumentProcessor, PipelineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// Catalog entries listed.
    pub seen: usize,
    /// Of those, newly added to the ledger.
    pub created: usize,
}

pub struct PipelineContext {
    config: PipelineConfig,
    conn: Connection,
    /// `None` for ledger-only contexts, which cannot process.
    processor: Option<DocumentProcessor>,
}

impl PipelineContext {
    /// Validate the configuration, build the configured backends and open
    /// the ledger. Any `ConfigError` surfaces here, before a job is claimed.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        config.validate_backends()?;
        let ensemble = EnsembleCoordinator::from_config(&config.ensemble)?;
        let processor = DocumentProcessor::new(
            Box::new(LocalFetcher::new(&config.source_dir)),
            Box::new(ImageRasterizer),
            ensemble,
            Box::new(TextSanitizer),
            Box::new(FileSystemOutput::new(&config.output_dir)),
            &config,
        );
        Self::with_processor(config, processor)
    }

    /// Context over caller-supplied collaborators.
    pub fn with_processor(
        config: PipelineConfig,
        processor: DocumentProcessor,
    ) -> Result<Self, PipelineError> {
        Self::open(config, Some(processor))
    }

    /// Context for sync, retry, statistics and inspection. Builds no
    /// recognition backends, so it works on a machine without OCR engines.
    pub fn ledger_only(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::open(config, None)
    }

    fn open(
        config: PipelineConfig,
        processor: Option<DocumentProcessor>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let conn = db::open_database(&config.db_path)?;
        tracing::info!(
            db = %config.db_path.display(),
            workers = config.workers,
            "Pipeline context ready"
        );
        Ok(Self {
            config,
            conn,
            processor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Add every catalog entry not yet tracked as a `pending` job. Each
    /// chunk commits on its own, so an interrupted sync keeps its progress.
    pub fn sync_catalog(&self, source: &dyn CatalogSource) -> Result<SyncSummary, PipelineError> {
        let mut summary = SyncSummary::default();
        for chunk in source.list_documents(self.config.catalog_chunk_size) {
            let chunk = chunk?;
            summary.seen += chunk.len();
            summary.created += db::upsert_chunk(&self.conn, &chunk, Utc::now())?;
        }
        tracing::info!(seen = summary.seen, created = summary.created, "Catalog sync finished");
        Ok(summary)
    }

    /// Recover orphans, then run the worker pool over pending jobs.
    pub fn process_pending(
        &self,
        batch_size: Option<usize>,
        limit: Option<usize>,
        token: &CancellationToken,
    ) -> Result<BatchSummary, PipelineError> {
        let processor = self.processor.as_ref().ok_or_else(|| ConfigError::Invalid {
            key: "ensemble".into(),
            reason: "context was opened without recognition backends".into(),
        })?;
        self.recover_orphans()?;
        let settings = PoolSettings {
            workers: self.config.workers,
            batch_size: batch_size.unwrap_or(self.config.batch_size).max(1),
            reclaim_interval: self.config.reclaim_interval,
            heartbeat_interval: self.config.heartbeat_interval,
        };
        run_pool(&self.config.db_path, processor, settings, limit, token)
    }

    /// Requeue failed jobs whose backoff has elapsed. `max_retries`
    /// overrides the configured limit for this sweep.
    pub fn retry_failed(
        &self,
        max_retries: Option<u32>,
    ) -> Result<RetrySweepSummary, PipelineError> {
        let mut policy = self.config.retry.clone();
        if let Some(max) = max_retries {
            policy.max_retries = max;
        }
        Ok(retry::sweep(&self.conn, &policy, Utc::now())?)
    }

    pub fn statistics(&self) -> Result<AggregateStatistics, PipelineError> {
        Ok(statistics::collect(&self.conn, &self.config, Utc::now())?)
    }

    /// Reset in-flight jobs left behind by a dead process: those whose
    /// last heartbeat is older than `orphan_grace`. Claims held by a live
    /// pool are refreshed well inside the grace and are left alone.
    pub fn recover_orphans(&self) -> Result<Vec<Job>, PipelineError> {
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(self.config.orphan_grace)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.recover_stale_before(stale_before, now)
    }

    /// Reset every in-flight job regardless of heartbeat. Only safe when
    /// the operator knows no other pool is running on this ledger.
    pub fn force_recover(&self) -> Result<Vec<Job>, PipelineError> {
        let now = Utc::now();
        self.recover_stale_before(now, now)
    }

    fn recover_stale_before(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, PipelineError> {
        let recovered = db::recover_in_flight(&self.conn, stale_before, now)?;
        for job in &recovered {
            tracing::warn!(file_id = %job.file_id, "Recovered orphaned job");
        }
        Ok(recovered)
    }

    /// Move an exhausted `failed` job to `quarantined` for manual review.
    pub fn quarantine(&self, file_id: &str, reason: &str) -> Result<Job, PipelineError> {
        let job = self.require_job(file_id)?;
        if job.state != JobState::Failed {
            return Err(PipelineError::WrongState {
                file_id: file_id.to_string(),
                state: job.state.to_string(),
                expected: JobState::Failed.to_string(),
            });
        }
        let kind = job
            .last_error
            .as_ref()
            .map(|e| e.kind)
            .unwrap_or(ErrorKind::Internal);
        let fields = TransitionFields {
            error: Some(JobError::new(kind, format!("quarantined by operator: {reason}"))),
            ..TransitionFields::default()
        };
        let quarantined = db::record_transition(
            &self.conn,
            job.id,
            JobState::Failed,
            JobState::Quarantined,
            fields,
            Utc::now(),
        )?;
        tracing::info!(file_id, reason, "Job quarantined by operator");
        Ok(quarantined)
    }

    pub fn job(&self, file_id: &str) -> Result<Option<Job>, PipelineError> {
        Ok(db::get_job_by_file_id(&self.conn, file_id)?)
    }

    pub fn job_errors(&self, file_id: &str) -> Result<Vec<ErrorLogEntry>, PipelineError> {
        self.require_job(file_id)?;
        Ok(db::list_job_errors(&self.conn, file_id)?)
    }

    fn require_job(&self, file_id: &str) -> Result<Job, PipelineError> {
        self.job(file_id)?
            .ok_or_else(|| PipelineError::UnknownJob(file_id.to_string()))
    }
}
