//! Tesseract command-line backend.
//!
//! Runs `tesseract <page.png> stdout -l <lang> tsv` and derives both the
//! text and the page confidence from the word-level TSV rows.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{encode_png, RecognitionBackend, RecognitionError, RecognitionOutput};
use crate::config::ConfigError;
use crate::pipeline::collaborators::PageImage;

pub struct TesseractCli {
    binary: PathBuf,
    language: String,
}

impl TesseractCli {
    /// Fails when the binary cannot be found, so a missing engine is a
    /// startup error rather than a stream of failed jobs.
    pub fn new(binary: &Path, language: &str) -> Result<Self, ConfigError> {
        let resolved = resolve_binary(binary).ok_or_else(|| {
            ConfigError::BackendUnavailable(format!(
                "tesseract binary '{}' not found",
                binary.display()
            ))
        })?;
        tracing::debug!(binary = %resolved.display(), language, "Tesseract backend configured");
        Ok(Self {
            binary: resolved,
            language: language.to_string(),
        })
    }

    fn backend_error(&self, reason: impl Into<String>) -> RecognitionError {
        RecognitionError::Backend {
            backend: "tesseract".into(),
            reason: reason.into(),
        }
    }
}

impl RecognitionBackend for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn run(&self, page: &PageImage) -> Result<RecognitionOutput, RecognitionError> {
        let png = encode_png(page)?;
        let mut input = tempfile::Builder::new()
            .prefix("folio-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| self.backend_error(format!("temp file: {e}")))?;
        input
            .write_all(&png)
            .map_err(|e| self.backend_error(format!("temp file: {e}")))?;

        let output = Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .args(["-l", &self.language])
            .arg("tsv")
            .output()
            .map_err(|e| self.backend_error(format!("spawn failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.backend_error(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv(&tsv))
    }
}

/// Build page text and confidence from Tesseract TSV.
///
/// TSV columns: level page_num block_num par_num line_num word_num left
/// top width height conf text. Level 5 rows are words; confidence is
/// 0-100 and -1 means unassigned, which counts as 0.
pub fn parse_tsv(tsv: &str) -> RecognitionOutput {
    let mut lines: Vec<((u32, u32, u32), Vec<String>)> = Vec::new();
    let mut confidences: Vec<f32> = Vec::new();

    // Skip header row
    for row in tsv.lines().skip(1) {
        let fields: Vec<&str> = row.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }
        if fields[0].parse::<i32>().ok() != Some(5) {
            continue;
        }
        let word = fields[11].trim();
        if word.is_empty() {
            continue;
        }
        let conf: f32 = match fields[10].trim().parse() {
            Ok(c) => c,
            Err(_) => continue,
        };
        confidences.push(if conf < 0.0 { 0.0 } else { conf / 100.0 });

        let key = (
            fields[2].parse().unwrap_or(0),
            fields[3].parse().unwrap_or(0),
            fields[4].parse().unwrap_or(0),
        );
        match lines.last_mut() {
            Some((last, words)) if *last == key => words.push(word.to_string()),
            _ => lines.push((key, vec![word.to_string()])),
        }
    }

    let text = lines
        .iter()
        .map(|(_, words)| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32
    };

    RecognitionOutput { text, confidence }
}

fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
