//! Contracts for everything the pipeline consumes but does not implement:
//! catalog listing, byte fetch, rasterization, text normalization and
//! artifact output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::models::{CatalogEntry, Job, OutputFormat};
use crate::pipeline::quality::QualityReport;

// ═══════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Catalog walk failed: {0}")]
    Walk(String),

    #[error("Catalog I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Source document not found: {0}")]
    NotFound(String),

    #[error("Fetch I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote fetch failed: {0}")]
    Remote(String),
}

#[derive(Error, Debug)]
pub enum RasterizeError {
    #[error("Unsupported document format: {0}")]
    Unsupported(String),

    #[error("Failed to decode page {page}: {reason}")]
    Decode { page: usize, reason: String },

    #[error("Document has {pages} pages, limit is {max}")]
    TooManyPages { pages: usize, max: u32 },

    #[error("Rasterize I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Output I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Metadata serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ═══════════════════════════════════════════
// Data passed between stages
// ═══════════════════════════════════════════

/// Local handle to a fetched document.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedDocument {
    pub path: PathBuf,
    pub byte_len: u64,
}

/// One rasterized page: 8-bit grayscale pixels, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Recognized and normalized text of one page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageText {
    pub index: usize,
    pub text: String,
    pub confidence: f32,
    /// Backend that produced the text, `None` when every backend failed.
    pub backend: Option<String>,
}

/// Everything an output writer needs for one document.
#[derive(Debug, Clone, Serialize)]
pub struct RecognizedDocument {
    pub file_id: String,
    pub display_name: String,
    /// Page texts joined with the page-break marker.
    pub text: String,
    pub pages: Vec<PageText>,
    pub quality: QualityReport,
}

// ═══════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════

pub type CatalogChunks<'a> = Box<dyn Iterator<Item = Result<Vec<CatalogEntry>, CatalogError>> + 'a>;

/// Source catalog. Yields every document it knows about in chunks of at
/// most `chunk_size`; deduplication against the ledger is the caller's job.
pub trait CatalogSource: Send + Sync {
    fn list_documents(&self, chunk_size: usize) -> CatalogChunks<'_>;
}

/// Materializes a job's bytes locally. Must be idempotent: fetching the
/// same job into the same scratch directory twice yields the same handle.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, job: &Job, scratch: &Path) -> Result<FetchedDocument, FetchError>;
}

/// Ordered pages of one document, rendered on demand so a long document
/// never has every raster in memory at once.
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;
    fn render(&self, index: usize) -> Result<PageImage, RasterizeError>;
}

pub trait Rasterizer: Send + Sync {
    fn to_pages(&self, document: &FetchedDocument) -> Result<Box<dyn PageSource>, RasterizeError>;
}

pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> String;
}

/// Artifact writer. References returned are opaque strings recorded in the
/// ledger.
pub trait OutputSink: Send + Sync {
    fn persist(
        &self,
        namespace: &str,
        document: &RecognizedDocument,
        formats: &[OutputFormat],
    ) -> Result<BTreeMap<OutputFormat, String>, PersistError>;

    /// Keep partial output of a quarantined document for audit, apart from
    /// accepted output.
    fn persist_quarantined(
        &self,
        namespace: &str,
        document: &RecognizedDocument,
    ) -> Result<BTreeMap<OutputFormat, String>, PersistError>;
}
