use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::OutputFormat;
use crate::pipeline::collaborators::{OutputSink, PersistError, RecognizedDocument};

const QUARANTINE_DIR: &str = "_quarantine";

/// Writes artifacts under `<root>/<namespace>/`, quarantined output under
/// `<root>/_quarantine/<namespace>/`. Each file is written to a temporary
/// sibling and renamed into place, so a reader never sees half a file.
pub struct FileSystemOutput {
    root: PathBuf,
}

impl FileSystemOutput {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn write_all(
        &self,
        dir: &Path,
        document: &RecognizedDocument,
        formats: &[OutputFormat],
    ) -> Result<BTreeMap<OutputFormat, String>, PersistError> {
        std::fs::create_dir_all(dir).map_err(|source| PersistError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut refs = BTreeMap::new();
        for format in formats {
            let path = dir.join(format!("document.{}", format.extension()));
            let bytes = match format {
                OutputFormat::Txt => document.text.as_bytes().to_vec(),
                OutputFormat::Json => serde_json::to_vec_pretty(document)?,
            };
            write_atomic(&path, &bytes)?;
            refs.insert(*format, path.to_string_lossy().into_owned());
        }
        Ok(refs)
    }
}

impl OutputSink for FileSystemOutput {
    fn persist(
        &self,
        namespace: &str,
        document: &RecognizedDocument,
        formats: &[OutputFormat],
    ) -> Result<BTreeMap<OutputFormat, String>, PersistError> {
        self.write_all(&self.root.join(namespace), document, formats)
    }

    fn persist_quarantined(
        &self,
        namespace: &str,
        document: &RecognizedDocument,
    ) -> Result<BTreeMap<OutputFormat, String>, PersistError> {
        self.write_all(
            &self.root.join(QUARANTINE_DIR).join(namespace),
            document,
            OutputFormat::all(),
        )
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
