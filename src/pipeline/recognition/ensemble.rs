use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use super::{build_backend, clamp_confidence, GatedBackend};
use crate::config::{ConfigError, EnsembleConfig, EnsembleStrategy};
use crate::pipeline::collaborators::PageImage;

/// Chosen result for one page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageRecognition {
    pub text: String,
    pub confidence: f32,
    pub backend: Option<String>,
}

impl PageRecognition {
    /// What a page gets when no backend produced anything.
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            backend: None,
        }
    }
}

/// Runs one or two backends per page and keeps the more confident answer.
pub struct EnsembleCoordinator {
    primary: GatedBackend,
    secondary: Option<GatedBackend>,
    strategy: EnsembleStrategy,
    high_confidence: f32,
    parallelism: usize,
}

impl EnsembleCoordinator {
    pub fn new(
        primary: GatedBackend,
        secondary: Option<GatedBackend>,
        config: &EnsembleConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            strategy: config.strategy,
            high_confidence: config.high_confidence,
            parallelism: config.batch_parallelism.max(1),
        }
    }

    /// Build the configured backends.
    pub fn from_config(config: &EnsembleConfig) -> Result<Self, ConfigError> {
        let primary_config = config.primary.as_ref().ok_or_else(|| ConfigError::Invalid {
            key: "primary backend".into(),
            reason: "no backend configured".into(),
        })?;
        let primary = GatedBackend::new(
            build_backend(primary_config)?,
            primary_config.max_concurrency(),
        );
        let secondary = match &config.secondary {
            Some(c) => Some(GatedBackend::new(build_backend(c)?, c.max_concurrency())),
            None => None,
        };
        tracing::info!(
            primary = primary.name(),
            secondary = secondary.as_ref().map(|s| s.name()).unwrap_or("none"),
            strategy = ?config.strategy,
            "Recognition ensemble ready"
        );
        Ok(Self::new(primary, secondary, config))
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Recognize one page. Never fails: a page no backend could read comes
    /// back empty with confidence 0.0.
    pub fn recognize(&self, page: &PageImage) -> PageRecognition {
        let primary = attempt(&self.primary, page);

        match self.strategy {
            EnsembleStrategy::PrimaryOnly => primary.unwrap_or_else(PageRecognition::empty),
            EnsembleStrategy::FastPrimaryThenFallback => {
                if let Some(p) = &primary {
                    if p.confidence >= self.high_confidence {
                        return primary.unwrap_or_else(PageRecognition::empty);
                    }
                }
                let secondary = self.secondary.as_ref().and_then(|s| attempt(s, page));
                pick(primary, secondary)
            }
            EnsembleStrategy::BestOfBoth => {
                let secondary = self.secondary.as_ref().and_then(|s| attempt(s, page));
                pick(primary, secondary)
            }
        }
    }

    /// Recognize an ordered batch; results come back in input order.
    /// Up to `parallelism` pages are in flight at once.
    pub fn recognize_batch(&self, pages: &[PageImage]) -> Vec<PageRecognition> {
        if self.parallelism <= 1 || pages.len() <= 1 {
            return pages.iter().map(|p| self.recognize(p)).collect();
        }

        let next = AtomicUsize::new(0);
        let mut slots: Vec<Option<PageRecognition>> = vec![None; pages.len()];

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.parallelism.min(pages.len()))
                .map(|_| {
                    scope.spawn(|| {
                        let mut done = Vec::new();
                        loop {
                            let i = next.fetch_add(1, Ordering::SeqCst);
                            let Some(page) = pages.get(i) else { break };
                            done.push((i, self.recognize(page)));
                        }
                        done
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (i, result) in done {
                            slots[i] = Some(result);
                        }
                    }
                    Err(_) => tracing::error!("Recognition thread panicked; its pages score 0.0"),
                }
            }
        });

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(PageRecognition::empty))
            .collect()
    }
}

fn attempt(backend: &GatedBackend, page: &PageImage) -> Option<PageRecognition> {
    match backend.run(page) {
        Ok(output) => Some(PageRecognition {
            text: output.text,
            confidence: clamp_confidence(output.confidence),
            backend: Some(backend.name().to_string()),
        }),
        Err(e) => {
            tracing::warn!(
                backend = backend.name(),
                page = page.index,
                error = %e,
                "Recognition backend failed"
            );
            None
        }
    }
}

/// Higher confidence wins; ties go to the primary.
fn pick(primary: Option<PageRecognition>, secondary: Option<PageRecognition>) -> PageRecognition {
    match (primary, secondary) {
        (Some(p), Some(s)) => {
            if s.confidence > p.confidence {
                s
            } else {
                p
            }
        }
        (Some(p), None) => p,
        (None, Some(s)) => s,
        (None, None) => PageRecognition::empty(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::recognition::mock::MockBackend;

    fn page(index: usize) -> PageImage {
        PageImage {
            index,
            width: 1,
            height: 1,
            pixels: vec![255],
        }
    }

    fn config(strategy: EnsembleStrategy, parallelism: usize) -> EnsembleConfig {
        EnsembleConfig {
            strategy,
            batch_parallelism: parallelism,
            ..EnsembleConfig::default()
        }
    }

    fn ensemble(
        primary: &Arc<MockBackend>,
        secondary: Option<&Arc<MockBackend>>,
        strategy: EnsembleStrategy,
    ) -> EnsembleCoordinator {
        EnsembleCoordinator::new(
            GatedBackend::new(Box::new(Arc::clone(primary)), None),
            secondary.map(|s| GatedBackend::new(Box::new(Arc::clone(s)), Some(1))),
            &config(strategy, 1),
        )
    }

    #[test]
    fn confident_primary_skips_fallback() {
        let primary = Arc::new(MockBackend::new("primary", "clear", 0.95));
        let secondary = Arc::new(MockBackend::new("secondary", "other", 0.99));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::FastPrimaryThenFallback);

        let result = e.recognize(&page(0));
        assert_eq!(result.backend.as_deref(), Some("primary"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let primary = Arc::new(MockBackend::new("primary", "t", 0.9));
        let secondary = Arc::new(MockBackend::new("secondary", "t", 1.0));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::FastPrimaryThenFallback);
        e.recognize(&page(0));
        assert_eq!(secondary.calls(), 0);
    }

    #[test]
    fn weak_primary_falls_back_to_better_secondary() {
        let primary = Arc::new(MockBackend::new("primary", "smudged", 0.4));
        let secondary = Arc::new(MockBackend::new("secondary", "readable", 0.8));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::FastPrimaryThenFallback);

        let result = e.recognize(&page(0));
        assert_eq!(result.backend.as_deref(), Some("secondary"));
        assert!((result.confidence - 0.8).abs() < 1e-6);
        assert_eq!(secondary.calls(), 1);
    }

    #[test]
    fn tie_goes_to_primary() {
        let primary = Arc::new(MockBackend::new("primary", "a", 0.6));
        let secondary = Arc::new(MockBackend::new("secondary", "b", 0.6));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::FastPrimaryThenFallback);
        assert_eq!(e.recognize(&page(0)).backend.as_deref(), Some("primary"));
    }

    #[test]
    fn weak_primary_without_secondary_is_kept() {
        let primary = Arc::new(MockBackend::new("primary", "faint", 0.3));
        let e = ensemble(&primary, None, EnsembleStrategy::FastPrimaryThenFallback);
        let result = e.recognize(&page(0));
        assert_eq!(result.backend.as_deref(), Some("primary"));
        assert!((result.confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn failing_primary_uses_secondary() {
        let primary = Arc::new(MockBackend::failing("primary"));
        let secondary = Arc::new(MockBackend::new("secondary", "ok", 0.5));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::FastPrimaryThenFallback);
        assert_eq!(e.recognize(&page(0)).backend.as_deref(), Some("secondary"));
    }

    #[test]
    fn no_output_degrades_to_zero() {
        let primary = Arc::new(MockBackend::failing("primary"));
        let secondary = Arc::new(MockBackend::failing("secondary"));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::FastPrimaryThenFallback);
        let result = e.recognize(&page(0));
        assert_eq!(result, PageRecognition::empty());
    }

    #[test]
    fn primary_only_never_consults_secondary() {
        let primary = Arc::new(MockBackend::new("primary", "x", 0.1));
        let secondary = Arc::new(MockBackend::new("secondary", "y", 0.9));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::PrimaryOnly);
        assert_eq!(e.recognize(&page(0)).backend.as_deref(), Some("primary"));
        assert_eq!(secondary.calls(), 0);
    }

    #[test]
    fn best_of_both_always_runs_both() {
        let primary = Arc::new(MockBackend::new("primary", "x", 0.95));
        let secondary = Arc::new(MockBackend::new("secondary", "y", 0.97));
        let e = ensemble(&primary, Some(&secondary), EnsembleStrategy::BestOfBoth);
        assert_eq!(e.recognize(&page(0)).backend.as_deref(), Some("secondary"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let primary = Arc::new(MockBackend::new("primary", "x", 1.7));
        let e = ensemble(&primary, None, EnsembleStrategy::FastPrimaryThenFallback);
        assert_eq!(e.recognize(&page(0)).confidence, 1.0);

        let nan = Arc::new(MockBackend::new("primary", "x", f32::NAN));
        let secondary = Arc::new(MockBackend::new("secondary", "y", 0.2));
        let e = ensemble(&nan, Some(&secondary), EnsembleStrategy::FastPrimaryThenFallback);
        let result = e.recognize(&page(0));
        assert_eq!(result.backend.as_deref(), Some("secondary"));
        assert_eq!(secondary.calls(), 1);
    }

    #[test]
    fn parallel_batch_keeps_page_order() {
        let scores: Vec<f32> = (0..12).map(|i| 0.5 + i as f32 * 0.01).collect();
        let primary = Arc::new(
            MockBackend::new("primary", "page", 0.0).with_page_confidences(scores.clone()),
        );
        let e = EnsembleCoordinator::new(
            GatedBackend::new(Box::new(Arc::clone(&primary)), None),
            None,
            &config(EnsembleStrategy::PrimaryOnly, 4),
        );

        let pages: Vec<_> = (0..12).map(page).collect();
        let results = e.recognize_batch(&pages);
        assert_eq!(results.len(), 12);
        for (i, r) in results.iter().enumerate() {
            assert!((r.confidence - scores[i]).abs() < 1e-6);
            assert_eq!(r.text, format!("page p{}", i + 1));
        }
        assert_eq!(primary.calls(), 12);
    }

    #[test]
    fn empty_batch_is_empty() {
        let primary = Arc::new(MockBackend::new("primary", "x", 0.9));
        let e = ensemble(&primary, None, EnsembleStrategy::PrimaryOnly);
        assert!(e.recognize_batch(&[]).is_empty());
    }
}
