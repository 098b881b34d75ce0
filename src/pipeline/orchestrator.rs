//! Per-job stage driver.
//!
//! Takes one claimed job through fetch → rasterize → recognize → quality
//! gate → persist, recording every state change in the ledger. Stage
//! failures become `failed` rows; nothing here aborts the batch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use rusqlite::Connection;

use crate::config::{PipelineConfig, QualityThresholds};
use crate::db::{self, DatabaseError};
use crate::models::{ErrorKind, Job, JobState, OutputFormat, TransitionFields};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::collaborators::*;
use crate::pipeline::quality::{self, Verdict};
use crate::pipeline::recognition::EnsembleCoordinator;

/// Separates page texts in the assembled document.
pub const PAGE_BREAK: &str = "\n\n--- Page Break ---\n\n";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Quarantined,
    Failed(ErrorKind),
    /// Handed back to `pending` on cancellation.
    Released,
    /// Another claimant moved the row; this worker stopped writing to it.
    Abandoned,
}

/// Why a stage could not produce its result.
#[derive(Debug)]
struct StageFailure {
    kind: ErrorKind,
    message: String,
}

impl StageFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<FetchError> for StageFailure {
    fn from(e: FetchError) -> Self {
        Self::new(ErrorKind::Fetch, e.to_string())
    }
}

impl From<RasterizeError> for StageFailure {
    fn from(e: RasterizeError) -> Self {
        Self::new(ErrorKind::Rasterize, e.to_string())
    }
}

impl From<PersistError> for StageFailure {
    fn from(e: PersistError) -> Self {
        Self::new(ErrorKind::Persist, e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Shared by every worker; all collaborators are `Send + Sync`.
pub struct DocumentProcessor {
    fetcher: Box<dyn Fetcher>,
    rasterizer: Box<dyn Rasterizer>,
    ensemble: EnsembleCoordinator,
    normalizer: Box<dyn Normalizer>,
    output: Box<dyn OutputSink>,
    scratch_root: PathBuf,
    max_pages: u32,
    formats: Vec<OutputFormat>,
    thresholds: QualityThresholds,
}

impl DocumentProcessor {
    pub fn new(
        fetcher: Box<dyn Fetcher>,
        rasterizer: Box<dyn Rasterizer>,
        ensemble: EnsembleCoordinator,
        normalizer: Box<dyn Normalizer>,
        output: Box<dyn OutputSink>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            rasterizer,
            ensemble,
            normalizer,
            output,
            scratch_root: config.scratch_dir.clone(),
            max_pages: config.max_pages_per_document,
            formats: config.output_formats.clone(),
            thresholds: config.quality,
        }
    }

    /// Drive a job claimed into `fetching` to its next resting state.
    ///
    /// Only ledger errors other than conflicts are returned; the job is then
    /// left in flight for startup recovery.
    pub fn process(
        &self,
        conn: &Connection,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<JobOutcome, DatabaseError> {
        let started = Instant::now();
        let _span = tracing::info_span!("job", file_id = %job.file_id, job_id = job.id).entered();

        // Dropped on every return path, which removes the job's scratch files.
        let scratch = match std::fs::create_dir_all(&self.scratch_root).and_then(|_| {
            tempfile::Builder::new()
                .prefix("job-")
                .tempdir_in(&self.scratch_root)
        }) {
            Ok(dir) => dir,
            Err(e) => {
                let failure = StageFailure::new(
                    ErrorKind::Internal,
                    format!("scratch directory: {e}"),
                );
                return self.fail(conn, job, JobState::Fetching, failure);
            }
        };

        // Fetch
        let fetched = match run_stage("fetch", || {
            self.fetcher.fetch(job, scratch.path()).map_err(StageFailure::from)
        }) {
            Ok(doc) => doc,
            Err(failure) => return self.fail(conn, job, JobState::Fetching, failure),
        };
        if token.is_cancelled() {
            return release(conn, job, JobState::Fetching);
        }
        if !advance(
            conn,
            job,
            JobState::Fetching,
            JobState::Rasterizing,
            TransitionFields::none(),
        )? {
            return Ok(JobOutcome::Abandoned);
        }

        // Rasterize
        let pages = match run_stage("rasterize", || {
            let pages = self.rasterizer.to_pages(&fetched)?;
            if pages.page_count() > self.max_pages as usize {
                return Err(RasterizeError::TooManyPages {
                    pages: pages.page_count(),
                    max: self.max_pages,
                }
                .into());
            }
            Ok(pages)
        }) {
            Ok(pages) => pages,
            Err(failure) => return self.fail(conn, job, JobState::Rasterizing, failure),
        };
        let page_count = pages.page_count();
        if token.is_cancelled() {
            return release(conn, job, JobState::Rasterizing);
        }
        if !advance(
            conn,
            job,
            JobState::Rasterizing,
            JobState::Recognizing,
            TransitionFields::with_page_count(page_count as u32),
        )? {
            return Ok(JobOutcome::Abandoned);
        }

        // Recognize
        let page_texts = match run_stage("recognize", || self.recognize_pages(pages.as_ref())) {
            Ok(texts) => texts,
            Err(failure) => return self.fail(conn, job, JobState::Recognizing, failure),
        };
        drop(pages);
        if token.is_cancelled() {
            return release(conn, job, JobState::Recognizing);
        }

        // Quality gate and output
        let confidences: Vec<f32> = page_texts.iter().map(|p| p.confidence).collect();
        let report = quality::evaluate(&confidences, &self.thresholds);
        let document = RecognizedDocument {
            file_id: job.file_id.clone(),
            display_name: job.display_name.clone(),
            text: page_texts
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(PAGE_BREAK),
            pages: page_texts,
            quality: report.clone(),
        };
        let namespace = job.namespace();

        let (target, output_refs) = if report.verdict == Verdict::Quarantine {
            let refs = match run_stage("quarantine", || {
                self.output
                    .persist_quarantined(&namespace, &document)
                    .map_err(StageFailure::from)
            }) {
                Ok(refs) => refs,
                Err(failure) => {
                    tracing::warn!(error = %failure.message, "Quarantined output not kept");
                    Default::default()
                }
            };
            (JobState::Quarantined, refs)
        } else {
            match run_stage("persist", || {
                self.output
                    .persist(&namespace, &document, &self.formats)
                    .map_err(StageFailure::from)
            }) {
                Ok(refs) => (JobState::Completed, refs),
                Err(failure) => return self.fail(conn, job, JobState::Recognizing, failure),
            }
        };

        let fields = TransitionFields {
            quality: Some(report.to_job_quality(&confidences)),
            output_refs: Some(output_refs),
            processing_time_ms: Some(started.elapsed().as_millis() as u64),
            ..TransitionFields::default()
        };
        if !advance(conn, job, JobState::Recognizing, target, fields)? {
            return Ok(JobOutcome::Abandoned);
        }

        tracing::info!(
            state = %target,
            pages = page_count,
            confidence = report.aggregate_confidence,
            needs_review = report.needs_review,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
        Ok(match target {
            JobState::Quarantined => JobOutcome::Quarantined,
            _ => JobOutcome::Completed,
        })
    }

    /// Render and recognize in windows of the ensemble's parallelism, so at
    /// most that many rasters are alive at once.
    fn recognize_pages(&self, pages: &dyn PageSource) -> Result<Vec<PageText>, StageFailure> {
        let count = pages.page_count();
        let window = self.ensemble.parallelism().max(1);
        let mut texts = Vec::with_capacity(count);

        let mut start = 0;
        while start < count {
            let end = (start + window).min(count);
            let images = (start..end)
                .map(|i| pages.render(i))
                .collect::<Result<Vec<_>, _>>()?;
            for (image, result) in images.iter().zip(self.ensemble.recognize_batch(&images)) {
                tracing::debug!(
                    page = image.index,
                    confidence = result.confidence,
                    "Page recognized"
                );
                texts.push(PageText {
                    index: image.index,
                    text: self.normalizer.normalize(&result.text),
                    confidence: result.confidence,
                    backend: result.backend,
                });
            }
            start = end;
        }
        Ok(texts)
    }

    fn fail(
        &self,
        conn: &Connection,
        job: &Job,
        from: JobState,
        failure: StageFailure,
    ) -> Result<JobOutcome, DatabaseError> {
        tracing::warn!(kind = %failure.kind, error = %failure.message, state = %from, "Job failed");
        let fields = TransitionFields::with_error(failure.kind, failure.message);
        if advance(conn, job, from, JobState::Failed, fields)? {
            Ok(JobOutcome::Failed(failure.kind))
        } else {
            Ok(JobOutcome::Abandoned)
        }
    }
}

/// Run one stage inside its span, turning a panic into an `InternalError`.
fn run_stage<T>(
    stage: &'static str,
    f: impl FnOnce() -> Result<T, StageFailure>,
) -> Result<T, StageFailure> {
    let _span = tracing::debug_span!("stage", stage).entered();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!(stage, panic = %message, "Stage panicked");
            Err(StageFailure::new(ErrorKind::Internal, format!("{stage} panicked: {message}")))
        }
    }
}

/// `Ok(false)` when the row has moved on without us.
fn advance(
    conn: &Connection,
    job: &Job,
    from: JobState,
    to: JobState,
    fields: TransitionFields,
) -> Result<bool, DatabaseError> {
    match db::record_transition(conn, job.id, from, to, fields, Utc::now()) {
        Ok(_) => Ok(true),
        Err(e) if e.is_conflict() => {
            tracing::warn!(error = %e, "Lost ownership of job, abandoning");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn release(
    conn: &Connection,
    job: &Job,
    from: JobState,
) -> Result<JobOutcome, DatabaseError> {
    match db::release_claim(conn, job.id, from, Utc::now()) {
        Ok(_) => {
            tracing::info!(file_id = %job.file_id, state = %from, "Released job on cancellation");
            Ok(JobOutcome::Released)
        }
        Err(e) if e.is_conflict() => Ok(JobOutcome::Abandoned),
        Err(e) => Err(e),
    }
}
