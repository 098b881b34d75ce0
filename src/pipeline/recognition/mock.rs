//! Mock backend for tests and dry runs without an OCR engine.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{RecognitionBackend, RecognitionError, RecognitionOutput};
use crate::pipeline::collaborators::PageImage;

/// Returns scripted results and counts its calls.
///
/// Results are served per page index when a per-page script is set,
/// otherwise the fixed result is returned for every page.
pub struct MockBackend {
    name: String,
    text: String,
    confidence: f32,
    per_page: Option<Vec<f32>>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(name: &str, text: &str, confidence: f32) -> Self {
        Self {
            name: name.to_string(),
            text: text.to_string(),
            confidence,
            per_page: None,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// A backend whose every call fails.
    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, "", 0.0)
        }
    }

    /// Confidence per page index; pages past the end reuse the fixed value.
    pub fn with_page_confidences(mut self, scores: Vec<f32>) -> Self {
        self.per_page = Some(scores);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecognitionBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, page: &PageImage) -> Result<RecognitionOutput, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RecognitionError::Backend {
                backend: self.name.clone(),
                reason: "scripted failure".into(),
            });
        }
        let confidence = self
            .per_page
            .as_ref()
            .and_then(|scores| scores.get(page.index).copied())
            .unwrap_or(self.confidence);
        Ok(RecognitionOutput {
            text: format!("{} p{}", self.text, page.index + 1),
            confidence,
        })
    }
}
