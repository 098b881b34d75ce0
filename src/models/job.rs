use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::enums::{ErrorKind, JobState, OutputFormat};

/// One tracked source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Stable external identifier from the source catalog. Unique.
    pub file_id: String,
    pub display_name: String,
    pub source_ref: Option<String>,
    pub byte_size: Option<u64>,
    pub page_count: Option<u32>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub stage_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<JobError>,
    pub worker_id: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub quality: Option<JobQuality>,
    pub output_refs: BTreeMap<OutputFormat, String>,
}

impl Job {
    /// Namespace used for scratch and output paths.
    pub fn namespace(&self) -> String {
        namespace_for(&self.file_id)
    }
}

/// Longest readable prefix kept in a namespace.
const NAMESPACE_SLUG_LEN: usize = 64;

/// A path-safe slug of `file_id` followed by a hash of the raw identifier.
///
/// Identifiers come from remote catalogs, so the slug keeps only
/// `[A-Za-z0-9._-]`. The slug alone is lossy (`box/a.png` and `box_a.png`
/// share one); the hash suffix keeps namespaces distinct per identifier.
pub fn namespace_for(file_id: &str) -> String {
    let cleaned: String = file_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(NAMESPACE_SLUG_LEN)
        .collect();
    let digest = format!("{:x}", Sha256::digest(file_id.as_bytes()));
    let hash = &digest[..16];
    match cleaned.trim_matches('.') {
        "" => hash.to_string(),
        slug => format!("{slug}-{hash}"),
    }
}

/// Last recorded failure of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Quality figures written once, when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQuality {
    /// One score per page, in page order.
    pub page_confidences: Vec<f32>,
    pub aggregate_confidence: f32,
    /// 0-based indices of pages under the low-confidence threshold.
    pub low_confidence_pages: Vec<usize>,
    pub needs_review: bool,
}

/// A document discovered by catalog sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub file_id: String,
    pub name: String,
    pub byte_size: Option<u64>,
    /// Parent folder / location reference in the source catalog.
    pub parent: Option<String>,
}

/// One row of the append-only failure history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: i64,
    pub file_id: String,
    pub kind: ErrorKind,
    pub message: String,
    /// `retry_count` of the job when the failure happened.
    pub retry_attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Optional fields carried by a state transition.
///
/// Which fields are legal depends on the edge; the repository rejects
/// quality data on anything but a terminal transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub page_count: Option<u32>,
    pub error: Option<JobError>,
    pub quality: Option<JobQuality>,
    pub output_refs: Option<BTreeMap<OutputFormat, String>>,
    pub processing_time_ms: Option<u64>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(JobError::new(kind, message)),
            ..Self::default()
        }
    }

    pub fn with_page_count(page_count: u32) -> Self {
        Self {
            page_count: Some(page_count),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug(namespace: &str) -> &str {
        namespace.rsplit_once('-').map(|(slug, _)| slug).unwrap_or("")
    }

    #[test]
    fn namespace_replaces_path_separators() {
        assert_eq!(slug(&namespace_for("1AbC-x_y.z")), "1AbC-x_y.z");
        assert_eq!(slug(&namespace_for("../../etc/passwd")), "_.._etc_passwd");
        assert_eq!(slug(&namespace_for("a b/c")), "a_b_c");
        assert!(!namespace_for("a/b").contains('/'));
    }

    #[test]
    fn namespace_is_stable_and_distinct_per_identifier() {
        assert_eq!(namespace_for("box/a.png"), namespace_for("box/a.png"));
        assert_ne!(namespace_for("box/a.png"), namespace_for("box_a.png"));
        assert_ne!(namespace_for("a b"), namespace_for("a?b"));
        // Long identifiers sharing a prefix past the slug length.
        let long = "x".repeat(200);
        assert_ne!(namespace_for(&format!("{long}1")), namespace_for(&format!("{long}2")));
        assert!(namespace_for(&format!("{long}1")).len() <= NAMESPACE_SLUG_LEN + 17);
    }

    #[test]
    fn namespace_never_empty_or_dot() {
        let empty = namespace_for("");
        assert_eq!(empty.len(), 16);
        let dots = namespace_for("..");
        assert_eq!(dots.len(), 16);
        assert_ne!(empty, dots);
    }

    #[test]
    fn quality_serializes_as_expected_json() {
        let quality = JobQuality {
            page_confidences: vec![0.5, 1.0],
            aggregate_confidence: 0.75,
            low_confidence_pages: vec![0],
            needs_review: true,
        };
        let json = serde_json::to_value(&quality).unwrap();
        assert_eq!(json["low_confidence_pages"], serde_json::json!([0]));
        assert_eq!(json["needs_review"], true);
    }
}
