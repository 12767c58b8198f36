//! Knowledge corpus boundary
//!
//! Documents are extracted once at session start and stay immutable for the
//! session's lifetime. Extraction is behind a trait so richer extractors
//! (PDF pipelines, remote stores) can plug in; the in-repo implementation
//! reads plain-text files from a directory.

mod extractor;

pub use extractor::{KnowledgeError, KnowledgeExtractor, TextDirExtractor};

/// Rough token estimate from text length.
///
/// The ~4 chars/token ratio is the usual English-prose approximation. It is
/// only used for cache-eligibility decisions, which tolerate being off by a
/// fair margin, so no tokenizer dependency is warranted.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Extracted text of one source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeContext {
    /// Stable identifier of the source document (file stem for the
    /// directory extractor).
    pub document_id: String,
    /// Extracted plain text; opaque to the session engine.
    pub text: String,
    /// Length-based token estimate, fixed at extraction time.
    pub estimated_tokens: usize,
}

impl KnowledgeContext {
    pub fn new(document_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let estimated_tokens = estimate_tokens(&text);
        Self {
            document_id: document_id.into(),
            text,
            estimated_tokens,
        }
    }
}

/// A document the extractor could not use, kept for the one-time warning
/// surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDocument {
    pub document_id: String,
    pub reason: String,
}

/// Result of scanning the knowledge directory: the usable documents plus
/// whatever failed. A partially failed extraction is not an error; the
/// session proceeds with what parsed.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub documents: Vec<KnowledgeContext>,
    pub failed: Vec<FailedDocument>,
}

impl ExtractionOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
