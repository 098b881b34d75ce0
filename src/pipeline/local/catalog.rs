use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::has_image_extension;
use crate::models::CatalogEntry;
use crate::pipeline::collaborators::{CatalogChunks, CatalogError, CatalogSource};

/// Treats every page image under `root` as one document. The identifier is
/// the path relative to `root` with `/` separators, so it stays stable
/// across runs and machines.
pub struct LocalDirectoryCatalog {
    root: PathBuf,
}

impl LocalDirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CatalogSource for LocalDirectoryCatalog {
    fn list_documents(&self, chunk_size: usize) -> CatalogChunks<'_> {
        if !self.root.is_dir() {
            return Box::new(std::iter::once(Err(CatalogError::RootNotFound(self.root.clone()))));
        }

        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(e) if e.file_type().is_file() && has_image_extension(e.path()) => {
                    Some(to_entry(&self.root, e.path()))
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable catalog entry");
                    None
                }
            });

        Box::new(Chunked {
            inner: Box::new(walker),
            size: chunk_size.max(1),
            done: false,
        })
    }
}

fn to_entry(root: &Path, path: &Path) -> Result<CatalogEntry, CatalogError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| CatalogError::Walk(e.to_string()))?;
    let file_id = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let byte_size = std::fs::metadata(path)
        .map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    let parent = relative
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().replace('\\', "/"));

    Ok(CatalogEntry {
        file_id,
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        byte_size: Some(byte_size),
        parent,
    })
}

/// Groups a fallible entry stream into chunks; an error ends the stream.
struct Chunked<'a> {
    inner: Box<dyn Iterator<Item = Result<CatalogEntry, CatalogError>> + 'a>,
    size: usize,
    done: bool,
}

impl Iterator for Chunked<'_> {
    type Item = Result<Vec<CatalogEntry>, CatalogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.size);
        while chunk.len() < self.size {
            match self.inner.next() {
                Some(Ok(entry)) => chunk.push(entry),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}
