pub mod cancel;
pub mod collaborators;
pub mod error;
pub mod local;
pub mod orchestrator; // Per-job stage driver
pub mod pool; // Worker pool + dispatcher
pub mod quality;
pub mod recognition;
pub mod retry;
pub mod statistics;

#[cfg(test)]
pub(crate) mod fixtures;

pub use cancel::CancellationToken;
pub use error::PipelineError;
pub use orchestrator::{DocumentProcessor, JobOutcome, PAGE_BREAK};
pub use pool::{BatchSummary, PoolSettings};
pub use retry::RetrySweepSummary;
