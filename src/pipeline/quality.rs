//! Quality gate: turns per-page recognition confidences into a verdict.

use serde::{Deserialize, Serialize};

use crate::config::QualityThresholds;
use crate::models::JobQuality;

/// Default thresholds, also the values `QualityThresholds::default()` uses.
pub mod thresholds {
    /// Below this a page is low-confidence and the document needs review.
    pub const MIN_CONFIDENCE: f32 = 0.70;

    /// Below this aggregate the document is quarantined.
    pub const MANUAL_REVIEW: f32 = 0.50;

    /// At or above this the ensemble skips its fallback backend.
    pub const HIGH: f32 = 0.90;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    AcceptWithReview,
    Quarantine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub aggregate_confidence: f32,
    /// 0-based, ascending.
    pub low_confidence_pages: Vec<usize>,
    pub needs_review: bool,
    pub min_confidence: f32,
    pub max_confidence: f32,
    pub verdict: Verdict,
}

impl QualityReport {
    /// Ledger form of the report together with the scores it was built from.
    pub fn to_job_quality(&self, page_confidences: &[f32]) -> JobQuality {
        JobQuality {
            page_confidences: page_confidences.to_vec(),
            aggregate_confidence: self.aggregate_confidence,
            low_confidence_pages: self.low_confidence_pages.clone(),
            needs_review: self.needs_review,
        }
    }
}

/// Classify a document from its page scores.
///
/// The aggregate is the arithmetic mean (0.0 with no pages). Quarantine
/// wins over review: a document below `manual_review` is quarantined even
/// though it also has low pages.
pub fn evaluate(page_confidences: &[f32], thresholds: &QualityThresholds) -> QualityReport {
    if page_confidences.is_empty() {
        return QualityReport {
            aggregate_confidence: 0.0,
            low_confidence_pages: Vec::new(),
            needs_review: false,
            min_confidence: 0.0,
            max_confidence: 0.0,
            verdict: if 0.0 < thresholds.manual_review {
                Verdict::Quarantine
            } else {
                Verdict::Accept
            },
        };
    }

    let sum: f64 = page_confidences.iter().map(|c| *c as f64).sum();
    let aggregate = (sum / page_confidences.len() as f64) as f32;

    let low_confidence_pages: Vec<usize> = page_confidences
        .iter()
        .enumerate()
        .filter(|(_, c)| **c < thresholds.min_confidence)
        .map(|(i, _)| i)
        .collect();
    let needs_review = !low_confidence_pages.is_empty();

    let min_confidence = page_confidences.iter().copied().fold(f32::INFINITY, f32::min);
    let max_confidence = page_confidences.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let verdict = if aggregate < thresholds.manual_review {
        Verdict::Quarantine
    } else if needs_review {
        Verdict::AcceptWithReview
    } else {
        Verdict::Accept
    };

    QualityReport {
        aggregate_confidence: aggregate,
        low_confidence_pages,
        needs_review,
        min_confidence,
        max_confidence,
        verdict,
    }
}
