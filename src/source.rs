//! The source ingestor contract shared by the chat, wiki, and upload variants.
//!
//! Each variant translates one external source into a batch of stored raw
//! documents and returns a completed [`IngestionRecord`]. The selection of
//! an implementation happens at the orchestrator boundary via an explicit
//! [`SourceType`] tag; the selector enum carries the source-specific scope.
//!
//! # Contract
//!
//! 1. Exactly one batch is created per ingestion run.
//! 2. A failed item is counted and logged, never fatal to the run.
//! 3. The record is finalized and persisted exactly once, in every exit
//!    path; `status = failed` only when the source was unreachable before
//!    any item was processed.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::models::{IngestionRecord, SourceType};

/// Source-specific scope of one ingestion run.
#[derive(Debug, Clone)]
pub enum SourceSelector {
    /// A chat export directory (channels.json, users.json, per-channel days).
    ChatExport { path: PathBuf },
    /// A live chat channel, fetched over the chat API.
    ChatChannel { id: String },
    /// Every page of a wiki space.
    WikiSpace { key: String },
    /// A single wiki page.
    WikiPage { id: String },
    /// One file on disk.
    FilePath { path: PathBuf },
    /// One file received as bytes (e.g. from an upload endpoint).
    FileBytes { filename: String, bytes: Vec<u8> },
    /// Several files on disk, ingested as one batch.
    Files { paths: Vec<PathBuf> },
}

impl SourceSelector {
    /// Short description used in logs and record scopes.
    pub fn describe(&self) -> String {
        match self {
            SourceSelector::ChatExport { path } => format!("export:{}", path.display()),
            SourceSelector::ChatChannel { id } => format!("channel:{}", id),
            SourceSelector::WikiSpace { key } => format!("space:{}", key),
            SourceSelector::WikiPage { id } => format!("page:{}", id),
            SourceSelector::FilePath { path } => format!("file:{}", path.display()),
            SourceSelector::FileBytes { filename, .. } => format!("bytes:{}", filename),
            SourceSelector::Files { paths } => format!("files:{}", paths.len()),
        }
    }
}

/// Options shared across ingestion runs; variants read what applies to them.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Cap on source-native items fetched (messages, pages).
    pub limit: Option<usize>,
    /// How far back to fetch chat history, in days.
    pub days_history: Option<i64>,
    /// Principal that uploaded the file(s).
    pub uploaded_by: Option<String>,
}

/// One external source behind the common ingestion contract.
#[async_trait]
pub trait SourceIngestor: Send + Sync {
    /// The tag this ingestor answers to at the orchestrator boundary.
    fn source_type(&self) -> SourceType;

    /// One-line description for status output.
    fn describe(&self) -> &str;

    /// Run one ingestion: create a batch, store each item, persist the record.
    async fn ingest(
        &self,
        selector: SourceSelector,
        options: &IngestOptions,
    ) -> Result<IngestionRecord, PipelineError>;
}

/// Error for a selector handed to the wrong variant. The orchestrator's
/// tag dispatch makes this unreachable in normal operation.
pub(crate) fn selector_mismatch(expected: SourceType, selector: &SourceSelector) -> PipelineError {
    PipelineError::storage(format!(
        "selector {} is not valid for the {} ingestor",
        selector.describe(),
        expected
    ))
}
