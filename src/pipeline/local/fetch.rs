use std::path::{Component, Path, PathBuf};

use crate::models::Job;
use crate::pipeline::collaborators::{FetchError, FetchedDocument, Fetcher};

/// Copies a document from the catalog root into the job's scratch space.
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an identifier to a path under the root, refusing anything
    /// that would escape it.
    fn source_path(&self, file_id: &str) -> Result<PathBuf, FetchError> {
        let relative = Path::new(file_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || file_id.is_empty() {
            return Err(FetchError::NotFound(format!("{file_id} is outside the catalog root")));
        }
        Ok(self.root.join(relative))
    }
}

impl Fetcher for LocalFetcher {
    fn fetch(&self, job: &Job, scratch: &Path) -> Result<FetchedDocument, FetchError> {
        let source = self.source_path(&job.file_id)?;
        let metadata = std::fs::metadata(&source).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound(job.file_id.clone()),
            _ => FetchError::Io {
                path: source.clone(),
                source: e,
            },
        })?;

        let file_name = source
            .file_name()
            .map(|n| n.to_owned())
            .ok_or_else(|| FetchError::NotFound(job.file_id.clone()))?;
        let target = scratch.join(file_name);

        // A previous attempt may already have materialized it.
        if let Ok(existing) = std::fs::metadata(&target) {
            if existing.len() == metadata.len() {
                return Ok(FetchedDocument {
                    path: target,
                    byte_len: existing.len(),
                });
            }
        }

        std::fs::create_dir_all(scratch).map_err(|e| FetchError::Io {
            path: scratch.to_path_buf(),
            source: e,
        })?;
        let byte_len = std::fs::copy(&source, &target).map_err(|e| FetchError::Io {
            path: target.clone(),
            source: e,
        })?;
        tracing::debug!(file_id = %job.file_id, bytes = byte_len, "Fetched into scratch");

        Ok(FetchedDocument {
            path: target,
            byte_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::models::JobState;

    fn job(file_id: &str) -> Job {
        Job {
            id: 1,
            file_id: file_id.into(),
            display_name: file_id.into(),
            source_ref: None,
            byte_size: None,
            page_count: None,
            state: JobState::Fetching,
            created_at: Utc::now(),
            stage_started_at: None,
            completed_at: None,
            last_retry_at: None,
            retry_count: 0,
            last_error: None,
            worker_id: None,
            processing_time_ms: None,
            quality: None,
            output_refs: BTreeMap::new(),
        }
    }

    #[test]
    fn fetch_copies_and_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("box")).unwrap();
        std::fs::write(root.path().join("box/a.png"), b"12345").unwrap();

        let fetcher = LocalFetcher::new(root.path());
        let first = fetcher.fetch(&job("box/a.png"), scratch.path()).unwrap();
        assert_eq!(first.byte_len, 5);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"12345");

        let second = fetcher.fetch(&job("box/a.png"), scratch.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_source_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let err = LocalFetcher::new(root.path())
            .fetch(&job("gone.png"), scratch.path())
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[test]
    fn traversal_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let fetcher = LocalFetcher::new(root.path());
        assert!(fetcher.fetch(&job("../etc/passwd"), scratch.path()).is_err());
        assert!(fetcher.fetch(&job("/etc/passwd"), scratch.path()).is_err());
    }
}
