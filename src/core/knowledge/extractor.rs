use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ExtractionOutcome, FailedDocument, KnowledgeContext};

/// Errors that abort extraction entirely.
///
/// Per-document failures never surface here; they are collected into the
/// [`ExtractionOutcome`] so the session can proceed with the documents that
/// did parse.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("failed to read knowledge directory {path}: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Extraction boundary: turns a directory of source documents into plain
/// text, one entry per document.
#[async_trait]
pub trait KnowledgeExtractor: Send + Sync {
    async fn extract(&self, dir: &Path) -> Result<ExtractionOutcome, KnowledgeError>;
}

/// Plain-text directory extractor.
///
/// Scans the top level of the knowledge directory for `.txt` and `.md`
/// files. The document id is the file stem. Unreadable and empty files are
/// skipped with a warning and reported in the outcome.
#[derive(Debug, Default, Clone)]
pub struct TextDirExtractor;

impl TextDirExtractor {
    fn is_supported(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("md")
        )
    }

    fn document_id(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl KnowledgeExtractor for TextDirExtractor {
    async fn extract(&self, dir: &Path) -> Result<ExtractionOutcome, KnowledgeError> {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Knowledge directory {} does not exist, starting with empty corpus",
                    dir.display()
                );
                return Ok(ExtractionOutcome::default());
            }
            Err(e) => {
                return Err(KnowledgeError::DirectoryUnreadable {
                    path: dir.to_path_buf(),
                    source: e,
                });
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) =
            read_dir
                .next_entry()
                .await
                .map_err(|e| KnowledgeError::DirectoryUnreadable {
                    path: dir.to_path_buf(),
                    source: e,
                })?
        {
            let path = entry.path();
            if path.is_file() && Self::is_supported(&path) {
                paths.push(path);
            } else {
                debug!("Skipping non-document entry: {}", path.display());
            }
        }

        // Stable scan order keeps logs and failure reports reproducible.
        paths.sort();

        let mut outcome = ExtractionOutcome::default();
        for path in paths {
            let document_id = Self::document_id(&path);
            match tokio::fs::read_to_string(&path).await {
                Ok(text) if text.trim().is_empty() => {
                    warn!("Knowledge document {} is empty, skipping", path.display());
                    outcome.failed.push(FailedDocument {
                        document_id,
                        reason: "empty document".to_string(),
                    });
                }
                Ok(text) => {
                    debug!(
                        "Extracted {} chars from knowledge document {}",
                        text.len(),
                        path.display()
                    );
                    outcome
                        .documents
                        .push(KnowledgeContext::new(document_id, text));
                }
                Err(e) => {
                    warn!(
                        "Failed to read knowledge document {}: {}",
                        path.display(),
                        e
                    );
                    outcome.failed.push(FailedDocument {
                        document_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Knowledge extraction complete: {} documents, {} failed",
            outcome.documents.len(),
            outcome.failed.len()
        );

        Ok(outcome)
    }
}
