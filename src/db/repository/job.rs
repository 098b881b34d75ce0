use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{decode_opt_ts, decode_ts, encode_ts, map_write_error};
use crate::db::DatabaseError;
use crate::models::*;

const JOB_COLUMNS: &str = "id, file_id, display_name, source_ref, byte_size, page_count, state,
    created_at, stage_started_at, completed_at, last_retry_at, retry_count,
    last_error_kind, last_error_message, worker_id, processing_time_ms,
    page_confidences, aggregate_confidence, low_confidence_pages, needs_review, output_refs";

/// Insert a job for a newly discovered document. Returns `false` when the
/// identifier is already tracked; the existing row is left untouched.
pub fn upsert_if_absent(
    conn: &Connection,
    entry: &CatalogEntry,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let inserted = conn
        .execute(
            "INSERT INTO jobs (file_id, display_name, source_ref, byte_size, state, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
             ON CONFLICT(file_id) DO NOTHING",
            params![
                entry.file_id,
                entry.name,
                entry.parent,
                entry.byte_size.map(|b| b as i64),
                encode_ts(now),
            ],
        )
        .map_err(map_write_error)?;
    Ok(inserted == 1)
}

/// Upsert a chunk of catalog entries in one transaction. Returns how many
/// rows were created.
pub fn upsert_chunk(
    conn: &Connection,
    entries: &[CatalogEntry],
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let mut created = 0;
    for entry in entries {
        if upsert_if_absent(&tx, entry, now)? {
            created += 1;
        }
    }
    tx.commit()?;
    Ok(created)
}

/// Atomically move up to `limit` pending jobs into `fetching` and hand them
/// to `worker_id`.
///
/// Selection and state change happen in one statement, so two claimants
/// can never receive the same row.
pub fn claim_batch(
    conn: &Connection,
    worker_id: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, DatabaseError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        "UPDATE jobs SET state = 'fetching', stage_started_at = ?1, heartbeat_at = ?1,
            worker_id = ?2
         WHERE id IN (SELECT id FROM jobs WHERE state = 'pending' ORDER BY id LIMIT ?3)
           AND state = 'pending'
         RETURNING {JOB_COLUMNS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![encode_ts(now), worker_id, limit as i64], read_job_row)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_write_error)?;

    let mut jobs = rows
        .into_iter()
        .map(job_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    jobs.sort_by_key(|j| j.id);
    Ok(jobs)
}

/// Move a job from `from` to `to`, writing the fields that edge carries.
///
/// Fails with `Conflict` when the row is no longer in `from`, which means
/// another worker or process owns it now. Entering `failed` also appends
/// to the error log in the same transaction.
pub fn record_transition(
    conn: &Connection,
    id: i64,
    from: JobState,
    to: JobState,
    fields: TransitionFields,
    now: DateTime<Utc>,
) -> Result<Job, DatabaseError> {
    if !from.can_transition_to(to) {
        return Err(DatabaseError::IllegalTransition { from, to });
    }
    if (fields.quality.is_some() || fields.output_refs.is_some()) && !to.is_terminal() {
        return Err(DatabaseError::ConstraintViolation(format!(
            "quality and output fields are only written on entering a terminal state, not {to}"
        )));
    }
    if to == JobState::Failed && fields.error.is_none() {
        return Err(DatabaseError::ConstraintViolation(
            "a transition into failed must carry an error".into(),
        ));
    }

    let is_retry = from == JobState::Failed && to == JobState::Pending;
    let now_s = encode_ts(now);
    let quality = fields.quality.as_ref();
    let page_confidences = quality
        .map(|q| serde_json::to_string(&q.page_confidences))
        .transpose()?;
    let low_pages = quality
        .map(|q| serde_json::to_string(&q.low_confidence_pages))
        .transpose()?;
    let output_refs = fields
        .output_refs
        .as_ref()
        .map(encode_output_refs)
        .transpose()?;

    let sql = format!(
        "UPDATE jobs SET
            state = ?3,
            stage_started_at = ?4,
            completed_at = COALESCE(?5, completed_at),
            last_retry_at = COALESCE(?6, last_retry_at),
            retry_count = retry_count + ?7,
            worker_id = CASE WHEN ?8 THEN worker_id ELSE NULL END,
            heartbeat_at = CASE WHEN ?8 THEN ?4 ELSE NULL END,
            page_count = COALESCE(?9, page_count),
            last_error_kind = COALESCE(?10, last_error_kind),
            last_error_message = COALESCE(?11, last_error_message),
            processing_time_ms = COALESCE(?12, processing_time_ms),
            page_confidences = COALESCE(?13, page_confidences),
            aggregate_confidence = COALESCE(?14, aggregate_confidence),
            low_confidence_pages = COALESCE(?15, low_confidence_pages),
            needs_review = COALESCE(?16, needs_review),
            output_refs = COALESCE(?17, output_refs)
         WHERE id = ?1 AND state = ?2
         RETURNING {JOB_COLUMNS}"
    );

    let tx = conn.unchecked_transaction()?;
    let result = tx.query_row(
        &sql,
        params![
            id,
            from.as_str(),
            to.as_str(),
            now_s,
            to.is_terminal().then(|| now_s.clone()),
            is_retry.then(|| now_s.clone()),
            is_retry as i64,
            to.is_in_flight(),
            fields.page_count.map(i64::from),
            fields.error.as_ref().map(|e| e.kind.as_str()),
            fields.error.as_ref().map(|e| e.message.as_str()),
            fields.processing_time_ms.map(|ms| ms as i64),
            page_confidences,
            quality.map(|q| q.aggregate_confidence as f64),
            low_pages,
            quality.map(|q| q.needs_review as i32),
            output_refs,
        ],
        read_job_row,
    );

    let row = match result {
        Ok(row) => row,
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            return Err(conflict_or_missing(&tx, id, from)?);
        }
        Err(e) => return Err(map_write_error(e)),
    };

    if let (JobState::Failed, Some(error)) = (to, fields.error.as_ref()) {
        tx.execute(
            "INSERT INTO job_errors (file_id, error_kind, message, retry_attempt, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.file_id, error.kind.as_str(), error.message, row.retry_count, now_s],
        )
        .map_err(map_write_error)?;
    }

    tx.commit()?;
    job_from_row(row)
}

/// Hand a claimed job back to `pending` without counting a retry.
/// Used when a worker is cancelled between stages.
pub fn release_claim(
    conn: &Connection,
    id: i64,
    from: JobState,
    now: DateTime<Utc>,
) -> Result<Job, DatabaseError> {
    if !from.is_in_flight() {
        return Err(DatabaseError::IllegalTransition {
            from,
            to: JobState::Pending,
        });
    }
    let sql = format!(
        "UPDATE jobs SET state = 'pending', stage_started_at = ?3, worker_id = NULL,
            heartbeat_at = NULL,
            last_error_kind = 'Interrupted', last_error_message = 'released on cancellation'
         WHERE id = ?1 AND state = ?2
         RETURNING {JOB_COLUMNS}"
    );
    match conn.query_row(&sql, params![id, from.as_str(), encode_ts(now)], read_job_row) {
        Ok(row) => job_from_row(row),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(conflict_or_missing(conn, id, from)?),
        Err(e) => Err(map_write_error(e)),
    }
}

/// Refresh the liveness stamp on every in-flight job owned by `worker_id`.
/// Returns how many rows were touched.
pub fn touch_claims(
    conn: &Connection,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let touched = conn
        .execute(
            "UPDATE jobs SET heartbeat_at = ?2
             WHERE worker_id = ?1 AND state IN ('fetching', 'rasterizing', 'recognizing')",
            params![worker_id, encode_ts(now)],
        )
        .map_err(map_write_error)?;
    Ok(touched)
}

/// Reset in-flight jobs whose last sign of life (heartbeat, or stage entry
/// for rows never stamped) is at or before `stale_before` to `pending`.
/// Their workers are gone; `retry_count` is not touched because no attempt
/// was completed.
pub fn recover_in_flight(
    conn: &Connection,
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, DatabaseError> {
    let sql = format!(
        "UPDATE jobs SET state = 'pending', stage_started_at = ?1, worker_id = NULL,
            heartbeat_at = NULL,
            last_error_kind = 'Interrupted', last_error_message = 'recovered after interrupted run'
         WHERE state IN ('fetching', 'rasterizing', 'recognizing')
           AND COALESCE(heartbeat_at, stage_started_at, '') <= ?2
         RETURNING {JOB_COLUMNS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![encode_ts(now), encode_ts(stale_before)], read_job_row)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_write_error)?;
    let mut jobs = rows
        .into_iter()
        .map(job_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    jobs.sort_by_key(|j| j.id);
    Ok(jobs)
}

pub fn get_job(conn: &Connection, id: i64) -> Result<Option<Job>, DatabaseError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    conn.query_row(&sql, params![id], read_job_row)
        .optional()?
        .map(job_from_row)
        .transpose()
}

pub fn get_job_by_file_id(conn: &Connection, file_id: &str) -> Result<Option<Job>, DatabaseError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE file_id = ?1");
    conn.query_row(&sql, params![file_id], read_job_row)
        .optional()?
        .map(job_from_row)
        .transpose()
}

/// Keyset page through one state: jobs with `id > after_id`, in id order.
pub fn list_page(
    conn: &Connection,
    state: JobState,
    after_id: i64,
    limit: usize,
) -> Result<Vec<Job>, DatabaseError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE state = ?1 AND id > ?2
         ORDER BY id LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![state.as_str(), after_id, limit as i64], read_job_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(job_from_row).collect()
}

pub fn list_job_errors(
    conn: &Connection,
    file_id: &str,
) -> Result<Vec<ErrorLogEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_id, error_kind, message, retry_attempt, occurred_at
         FROM job_errors WHERE file_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![file_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, file_id, kind, message, attempt, occurred_at)| {
            Ok(ErrorLogEntry {
                id,
                file_id,
                kind: kind.parse()?,
                message,
                retry_attempt: attempt as u32,
                occurred_at: decode_ts("occurred_at", &occurred_at)?,
            })
        })
        .collect()
}

fn conflict_or_missing(
    conn: &Connection,
    id: i64,
    expected: JobState,
) -> Result<DatabaseError, DatabaseError> {
    let actual: Option<String> = conn
        .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(match actual {
        Some(state) => DatabaseError::Conflict {
            job_id: id,
            expected,
            actual: state.parse()?,
        },
        None => DatabaseError::NotFound {
            entity_type: "Job".into(),
            id: id.to_string(),
        },
    })
}

fn encode_output_refs(refs: &BTreeMap<OutputFormat, String>) -> Result<String, serde_json::Error> {
    let plain: BTreeMap<&str, &str> = refs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    serde_json::to_string(&plain)
}

struct JobRow {
    id: i64,
    file_id: String,
    display_name: String,
    source_ref: Option<String>,
    byte_size: Option<i64>,
    page_count: Option<i64>,
    state: String,
    created_at: String,
    stage_started_at: Option<String>,
    completed_at: Option<String>,
    last_retry_at: Option<String>,
    retry_count: i64,
    last_error_kind: Option<String>,
    last_error_message: Option<String>,
    worker_id: Option<String>,
    processing_time_ms: Option<i64>,
    page_confidences: Option<String>,
    aggregate_confidence: Option<f64>,
    low_confidence_pages: Option<String>,
    needs_review: i32,
    output_refs: Option<String>,
}

fn read_job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        file_id: row.get(1)?,
        display_name: row.get(2)?,
        source_ref: row.get(3)?,
        byte_size: row.get(4)?,
        page_count: row.get(5)?,
        state: row.get(6)?,
        created_at: row.get(7)?,
        stage_started_at: row.get(8)?,
        completed_at: row.get(9)?,
        last_retry_at: row.get(10)?,
        retry_count: row.get(11)?,
        last_error_kind: row.get(12)?,
        last_error_message: row.get(13)?,
        worker_id: row.get(14)?,
        processing_time_ms: row.get(15)?,
        page_confidences: row.get(16)?,
        aggregate_confidence: row.get(17)?,
        low_confidence_pages: row.get(18)?,
        needs_review: row.get(19)?,
        output_refs: row.get(20)?,
    })
}

fn job_from_row(row: JobRow) -> Result<Job, DatabaseError> {
    let last_error = match row.last_error_kind {
        Some(kind) => Some(JobError {
            kind: kind.parse()?,
            message: row.last_error_message.unwrap_or_default(),
        }),
        None => None,
    };

    let quality = match row.aggregate_confidence {
        Some(aggregate) => Some(JobQuality {
            page_confidences: match row.page_confidences {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            },
            aggregate_confidence: aggregate as f32,
            low_confidence_pages: match row.low_confidence_pages {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            },
            needs_review: row.needs_review != 0,
        }),
        None => None,
    };

    let mut output_refs = BTreeMap::new();
    if let Some(json) = row.output_refs {
        let plain: BTreeMap<String, String> = serde_json::from_str(&json)?;
        for (format, reference) in plain {
            output_refs.insert(format.parse::<OutputFormat>()?, reference);
        }
    }

    Ok(Job {
        id: row.id,
        file_id: row.file_id,
        display_name: row.display_name,
        source_ref: row.source_ref,
        byte_size: row.byte_size.map(|b| b as u64),
        page_count: row.page_count.map(|p| p as u32),
        state: row.state.parse()?,
        created_at: decode_ts("created_at", &row.created_at)?,
        stage_started_at: decode_opt_ts("stage_started_at", row.stage_started_at)?,
        completed_at: decode_opt_ts("completed_at", row.completed_at)?,
        last_retry_at: decode_opt_ts("last_retry_at", row.last_retry_at)?,
        retry_count: row.retry_count as u32,
        last_error,
        worker_id: row.worker_id,
        processing_time_ms: row.processing_time_ms.map(|ms| ms as u64),
        quality,
        output_refs,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::db::sqlite::{open_database, open_memory_database};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn entry(file_id: &str) -> CatalogEntry {
        CatalogEntry {
            file_id: file_id.into(),
            name: format!("{file_id}.pdf"),
            byte_size: Some(2048),
            parent: Some("scans/2019".into()),
        }
    }

    fn seed(conn: &Connection, n: usize) {
        let entries: Vec<_> = (0..n).map(|i| entry(&format!("doc-{i:04}"))).collect();
        upsert_chunk(conn, &entries, t0()).unwrap();
    }

    fn to_recognizing(conn: &Connection) -> Job {
        let job = claim_batch(conn, "w1", 1, t0()).unwrap().remove(0);
        record_transition(
            conn,
            job.id,
            JobState::Fetching,
            JobState::Rasterizing,
            TransitionFields::none(),
            t0(),
        )
        .unwrap();
        record_transition(
            conn,
            job.id,
            JobState::Rasterizing,
            JobState::Recognizing,
            TransitionFields::with_page_count(3),
            t0(),
        )
        .unwrap()
    }

    fn quality(scores: &[f32]) -> JobQuality {
        JobQuality {
            page_confidences: scores.to_vec(),
            aggregate_confidence: scores.iter().sum::<f32>() / scores.len() as f32,
            low_confidence_pages: vec![],
            needs_review: false,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let conn = open_memory_database().unwrap();
        assert!(upsert_if_absent(&conn, &entry("a"), t0()).unwrap());
        assert!(!upsert_if_absent(&conn, &entry("a"), t0() + Duration::hours(1)).unwrap());

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        let job = get_job_by_file_id(&conn, "a").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.created_at, t0());
        assert_eq!(job.byte_size, Some(2048));
        assert_eq!(job.source_ref.as_deref(), Some("scans/2019"));
    }

    #[test]
    fn resync_does_not_reset_progress() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = to_recognizing(&conn);
        assert!(!upsert_if_absent(&conn, &entry(&job.file_id), t0()).unwrap());
        let after = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(after.state, JobState::Recognizing);
    }

    #[test]
    fn upsert_chunk_counts_only_new_rows() {
        let conn = open_memory_database().unwrap();
        assert_eq!(upsert_chunk(&conn, &[entry("a"), entry("b")], t0()).unwrap(), 2);
        assert_eq!(upsert_chunk(&conn, &[entry("b"), entry("c")], t0()).unwrap(), 1);
    }

    #[test]
    fn claim_moves_to_fetching_in_id_order() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 5);
        let claimed = claim_batch(&conn, "worker-7", 3, t0()).unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.windows(2).all(|w| w[0].id < w[1].id));
        for job in &claimed {
            assert_eq!(job.state, JobState::Fetching);
            assert_eq!(job.worker_id.as_deref(), Some("worker-7"));
            assert_eq!(job.stage_started_at, Some(t0()));
        }
        assert_eq!(claimed[0].file_id, "doc-0000");

        let rest = claim_batch(&conn, "worker-8", 10, t0()).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(claim_batch(&conn, "worker-9", 10, t0()).unwrap().is_empty());
    }

    #[test]
    fn claim_with_zero_limit_is_noop() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 2);
        assert!(claim_batch(&conn, "w", 0, t0()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_claimants_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        seed(&open_database(&path).unwrap(), 200);

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|w| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let conn = open_database(&path).unwrap();
                    barrier.wait();
                    let mut mine = Vec::new();
                    loop {
                        let batch = claim_batch(&conn, &format!("w{w}"), 3, Utc::now()).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        mine.extend(batch.into_iter().map(|j| j.id));
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn forward_path_records_fields_once() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = to_recognizing(&conn);
        assert_eq!(job.page_count, Some(3));
        assert!(job.quality.is_none());

        let mut refs = BTreeMap::new();
        refs.insert(OutputFormat::Txt, "out/doc-0000/text.txt".to_string());
        let done = record_transition(
            &conn,
            job.id,
            JobState::Recognizing,
            JobState::Completed,
            TransitionFields {
                quality: Some(quality(&[0.95, 0.95, 0.95])),
                output_refs: Some(refs.clone()),
                processing_time_ms: Some(1234),
                ..TransitionFields::default()
            },
            t0() + Duration::seconds(5),
        )
        .unwrap();

        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.completed_at, Some(t0() + Duration::seconds(5)));
        assert_eq!(done.worker_id, None);
        assert_eq!(done.processing_time_ms, Some(1234));
        assert_eq!(done.output_refs, refs);
        let q = done.quality.unwrap();
        assert_eq!(q.page_confidences.len(), 3);
        assert!((q.aggregate_confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn illegal_edge_is_rejected_before_the_database() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let err = record_transition(
            &conn,
            1,
            JobState::Pending,
            JobState::Failed,
            TransitionFields::with_error(ErrorKind::Fetch, "x"),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::IllegalTransition { .. }));
        let err = record_transition(
            &conn,
            1,
            JobState::Completed,
            JobState::Pending,
            TransitionFields::none(),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::IllegalTransition { .. }));
    }

    #[test]
    fn stale_from_state_is_a_conflict() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = claim_batch(&conn, "w1", 1, t0()).unwrap().remove(0);
        record_transition(
            &conn,
            job.id,
            JobState::Fetching,
            JobState::Rasterizing,
            TransitionFields::none(),
            t0(),
        )
        .unwrap();

        let err = record_transition(
            &conn,
            job.id,
            JobState::Fetching,
            JobState::Rasterizing,
            TransitionFields::none(),
            t0(),
        )
        .unwrap_err();
        match err {
            DatabaseError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, JobState::Fetching);
                assert_eq!(actual, JobState::Rasterizing);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn missing_job_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = record_transition(
            &conn,
            42,
            JobState::Pending,
            JobState::Fetching,
            TransitionFields::none(),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn quality_only_on_terminal_transitions() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = claim_batch(&conn, "w1", 1, t0()).unwrap().remove(0);
        let err = record_transition(
            &conn,
            job.id,
            JobState::Fetching,
            JobState::Rasterizing,
            TransitionFields {
                quality: Some(quality(&[0.9])),
                ..TransitionFields::default()
            },
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::ConstraintViolation(_)));
    }

    #[test]
    fn failure_is_logged_and_retry_increments_count() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = claim_batch(&conn, "w1", 1, t0()).unwrap().remove(0);

        let err = record_transition(
            &conn,
            job.id,
            JobState::Fetching,
            JobState::Failed,
            TransitionFields::none(),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::ConstraintViolation(_)));

        let failed = record_transition(
            &conn,
            job.id,
            JobState::Fetching,
            JobState::Failed,
            TransitionFields::with_error(ErrorKind::Fetch, "connection reset"),
            t0(),
        )
        .unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.worker_id, None);
        assert_eq!(failed.last_error, Some(JobError::new(ErrorKind::Fetch, "connection reset")));
        assert_eq!(failed.retry_count, 0);

        let later = t0() + Duration::seconds(61);
        let retried = record_transition(
            &conn,
            job.id,
            JobState::Failed,
            JobState::Pending,
            TransitionFields::none(),
            later,
        )
        .unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.last_retry_at, Some(later));
        assert_eq!(retried.completed_at, None);

        let log = list_job_errors(&conn, &job.file_id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, ErrorKind::Fetch);
        assert_eq!(log[0].retry_attempt, 0);
    }

    #[test]
    fn terminal_rows_stay_frozen() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = to_recognizing(&conn);
        record_transition(
            &conn,
            job.id,
            JobState::Recognizing,
            JobState::Quarantined,
            TransitionFields {
                quality: Some(quality(&[0.1])),
                ..TransitionFields::default()
            },
            t0(),
        )
        .unwrap();

        let err = record_transition(
            &conn,
            job.id,
            JobState::Recognizing,
            JobState::Completed,
            TransitionFields::none(),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { actual: JobState::Quarantined, .. }));
        assert!(recover_in_flight(&conn, t0() + Duration::hours(1), t0()).unwrap().is_empty());
    }

    #[test]
    fn crash_recovery_resets_in_flight_without_counting_a_retry() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 2);
        let stuck = to_recognizing(&conn);
        let fresh = claim_batch(&conn, "w2", 1, t0() + Duration::minutes(10))
            .unwrap()
            .remove(0);

        let recovered = recover_in_flight(
            &conn,
            t0() + Duration::minutes(5),
            t0() + Duration::minutes(11),
        )
        .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, stuck.id);
        assert_eq!(recovered[0].state, JobState::Pending);
        assert_eq!(recovered[0].retry_count, 0);
        assert_eq!(recovered[0].worker_id, None);
        assert_eq!(
            recovered[0].last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Interrupted)
        );

        let still = get_job(&conn, fresh.id).unwrap().unwrap();
        assert_eq!(still.state, JobState::Fetching);

        let again = claim_batch(&conn, "w3", 5, t0() + Duration::minutes(12)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, stuck.id);
    }

    #[test]
    fn heartbeat_keeps_a_long_claim_out_of_recovery() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 2);
        let live = claim_batch(&conn, "folio-live", 1, t0()).unwrap().remove(0);
        let dead = claim_batch(&conn, "folio-dead", 1, t0()).unwrap().remove(0);

        let beat = t0() + Duration::minutes(30);
        assert_eq!(touch_claims(&conn, "folio-live", beat).unwrap(), 1);

        let recovered = recover_in_flight(
            &conn,
            beat - Duration::minutes(5),
            beat + Duration::seconds(1),
        )
        .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, dead.id);
        assert_eq!(get_job(&conn, live.id).unwrap().unwrap().state, JobState::Fetching);
    }

    #[test]
    fn heartbeat_ignores_rows_that_left_flight() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = claim_batch(&conn, "folio-a", 1, t0()).unwrap().remove(0);
        record_transition(
            &conn,
            job.id,
            JobState::Fetching,
            JobState::Failed,
            TransitionFields::with_error(ErrorKind::Fetch, "gone"),
            t0(),
        )
        .unwrap();
        assert_eq!(touch_claims(&conn, "folio-a", t0()).unwrap(), 0);
    }

    #[test]
    fn stage_entry_counts_as_a_heartbeat() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = claim_batch(&conn, "folio-a", 1, t0()).unwrap().remove(0);
        let entered = t0() + Duration::minutes(20);
        record_transition(
            &conn,
            job.id,
            JobState::Fetching,
            JobState::Rasterizing,
            TransitionFields::none(),
            entered,
        )
        .unwrap();

        let stale_before = t0() + Duration::minutes(10);
        assert!(recover_in_flight(&conn, stale_before, entered).unwrap().is_empty());
    }

    #[test]
    fn release_claim_returns_job_to_pending() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 1);
        let job = claim_batch(&conn, "w1", 1, t0()).unwrap().remove(0);
        let released = release_claim(&conn, job.id, JobState::Fetching, t0()).unwrap();
        assert_eq!(released.state, JobState::Pending);
        assert_eq!(released.retry_count, 0);

        let err = release_claim(&conn, job.id, JobState::Fetching, t0()).unwrap_err();
        assert!(err.is_conflict());
        let err = release_claim(&conn, job.id, JobState::Pending, t0()).unwrap_err();
        assert!(matches!(err, DatabaseError::IllegalTransition { .. }));
    }

    #[test]
    fn list_page_walks_by_keyset() {
        let conn = open_memory_database().unwrap();
        seed(&conn, 7);
        let first = list_page(&conn, JobState::Pending, 0, 3).unwrap();
        assert_eq!(first.len(), 3);
        let second = list_page(&conn, JobState::Pending, first[2].id, 3).unwrap();
        assert_eq!(second.len(), 3);
        assert!(second[0].id > first[2].id);
        let third = list_page(&conn, JobState::Pending, second[2].id, 3).unwrap();
        assert_eq!(third.len(), 1);
        assert!(list_page(&conn, JobState::Failed, 0, 3).unwrap().is_empty());
    }
}
