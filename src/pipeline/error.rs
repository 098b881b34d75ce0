//! Top-level error of the operational surface.

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::pipeline::collaborators::{CatalogError, FetchError, PersistError, RasterizeError};
use crate::pipeline::recognition::RecognitionError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Rasterize error: {0}")]
    Rasterize(#[from] RasterizeError),

    #[error("Recognition error: {0}")]
    Recognition(#[from] RecognitionError),

    #[error("Persist error: {0}")]
    Persist(#[from] PersistError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No job for file id {0}")]
    UnknownJob(String),

    #[error("Job {file_id} is {state}, expected {expected}")]
    WrongState {
        file_id: String,
        state: String,
        expected: String,
    },

    #[error("Worker thread panicked: {0}")]
    WorkerPanic(String),
}
