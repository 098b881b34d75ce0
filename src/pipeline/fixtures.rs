//! Scripted collaborators shared by the pipeline tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;

use crate::config::{EnsembleConfig, EnsembleStrategy, PipelineConfig};
use crate::db;
use crate::models::{CatalogEntry, Job, OutputFormat};
use crate::pipeline::collaborators::*;
use crate::pipeline::local::{FileSystemOutput, TextSanitizer};
use crate::pipeline::orchestrator::DocumentProcessor;
use crate::pipeline::recognition::mock::MockBackend;
use crate::pipeline::recognition::{EnsembleCoordinator, GatedBackend};

pub struct ScriptedFetcher {
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, job: &Job, scratch: &Path) -> Result<FetchedDocument, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FetchError::Remote(format!("{} unavailable", job.file_id)));
        }
        Ok(FetchedDocument {
            path: scratch.join(job.namespace()),
            byte_len: 0,
        })
    }
}

impl Fetcher for Arc<ScriptedFetcher> {
    fn fetch(&self, job: &Job, scratch: &Path) -> Result<FetchedDocument, FetchError> {
        self.as_ref().fetch(job, scratch)
    }
}

/// Every document has `pages` blank 2x2 pages.
pub struct BlankPages {
    pub pages: usize,
}

struct BlankSource {
    pages: usize,
}

impl PageSource for BlankSource {
    fn page_count(&self) -> usize {
        self.pages
    }

    fn render(&self, index: usize) -> Result<PageImage, RasterizeError> {
        Ok(PageImage {
            index,
            width: 2,
            height: 2,
            pixels: vec![255; 4],
        })
    }
}

impl Rasterizer for BlankPages {
    fn to_pages(&self, _document: &FetchedDocument) -> Result<Box<dyn PageSource>, RasterizeError> {
        Ok(Box::new(BlankSource { pages: self.pages }))
    }
}

pub struct PanickingRasterizer;

impl Rasterizer for PanickingRasterizer {
    fn to_pages(&self, _document: &FetchedDocument) -> Result<Box<dyn PageSource>, RasterizeError> {
        panic!("decoder blew up")
    }
}

pub struct BrokenOutput;

impl OutputSink for BrokenOutput {
    fn persist(
        &self,
        namespace: &str,
        _document: &RecognizedDocument,
        _formats: &[OutputFormat],
    ) -> Result<BTreeMap<OutputFormat, String>, PersistError> {
        Err(PersistError::Io {
            path: namespace.into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }

    fn persist_quarantined(
        &self,
        namespace: &str,
        document: &RecognizedDocument,
    ) -> Result<BTreeMap<OutputFormat, String>, PersistError> {
        self.persist(namespace, document, &[])
    }
}

pub fn test_config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::with_data_dir(dir);
    config.log_dir = None;
    config.workers = 2;
    config.batch_size = 4;
    config.ensemble = EnsembleConfig {
        strategy: EnsembleStrategy::FastPrimaryThenFallback,
        ..EnsembleConfig::default()
    };
    config
}

pub fn ensemble_with(confidence: f32, config: &PipelineConfig) -> EnsembleCoordinator {
    EnsembleCoordinator::new(
        GatedBackend::new(Box::new(MockBackend::new("mock", "text", confidence)), None),
        None,
        &config.ensemble,
    )
}

/// Processor over blank pages, a scripted fetcher and real file output.
pub fn processor(
    config: &PipelineConfig,
    fetcher: Box<dyn Fetcher>,
    rasterizer: Box<dyn Rasterizer>,
    confidence: f32,
) -> DocumentProcessor {
    DocumentProcessor::new(
        fetcher,
        rasterizer,
        ensemble_with(confidence, config),
        Box::new(TextSanitizer),
        Box::new(FileSystemOutput::new(&config.output_dir)),
        config,
    )
}

pub fn seed(conn: &Connection, count: usize) -> Vec<String> {
    let ids: Vec<String> = (0..count).map(|i| format!("scan/{i:04}.png")).collect();
    let entries: Vec<CatalogEntry> = ids
        .iter()
        .map(|id| CatalogEntry {
            file_id: id.clone(),
            name: id.rsplit('/').next().unwrap_or(id).to_string(),
            byte_size: Some(1024),
            parent: Some("scan".into()),
        })
        .collect();
    db::upsert_chunk(conn, &entries, Utc::now()).unwrap();
    ids
}
