//! Typed error taxonomy for the ingestion pipeline.
//!
//! Components return [`PipelineError`] so callers can match on the failure
//! class; the CLI boundary converts into `anyhow` for reporting.

use std::path::PathBuf;

use thiserror::Error;

/// Failure classes surfaced by the storage, ingestion, and index layers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Filesystem or serialization failure in the storage layer.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Attempt to overwrite an already-stored raw document.
    #[error("document '{document_id}' already exists in batch '{batch_id}'")]
    DuplicateDocument {
        batch_id: String,
        document_id: String,
    },

    /// An ingestion log entry with the same id but different content exists.
    #[error("ingestion log conflict for '{0}': a different record is already persisted")]
    Conflict(String),

    /// External source (chat/wiki API, export file) could not be reached.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The vector index already exists and `force` was not passed.
    #[error("vector index already exists at {}; pass --force or rebuild", .0.display())]
    AlreadyInitialized(PathBuf),

    /// The embedding service failed or is not configured.
    #[error("embedding backend failure: {0}")]
    EmbeddingBackend(String),
}

impl PipelineError {
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    pub fn source_unavailable(msg: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable(msg.to_string())
    }

    pub fn embedding(msg: impl std::fmt::Display) -> Self {
        Self::EmbeddingBackend(msg.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
