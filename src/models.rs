//! Core data models used throughout Harbor.
//!
//! These types represent the raw documents, batches, ingestion audit records,
//! and chunks that flow through the ingestion and indexing pipeline. Batch and
//! document identities are value types with validation; the on-disk layout is
//! the wire format, but no component passes raw paths around.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Supported knowledge sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Chat,
    Wiki,
    Upload,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [SourceType::Chat, SourceType::Wiki, SourceType::Upload];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Chat => "chat",
            SourceType::Wiki => "wiki",
            SourceType::Upload => "upload",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(SourceType::Chat),
            "wiki" => Ok(SourceType::Wiki),
            "upload" => Ok(SourceType::Upload),
            other => Err(PipelineError::storage(format!(
                "unknown source type '{}' (expected chat, wiki, or upload)",
                other
            ))),
        }
    }
}

/// Replace filesystem-hostile characters, keeping alphanumerics and `-_.`.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Identity of one ingestion batch: `{YYYYMMDD_HHMMSSmicros}_{name}`.
///
/// The microsecond component keeps ids generated back-to-back in the same
/// process distinct; `create_batch` still checks for collisions on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate(name: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%6f");
        let safe = sanitize_component(name.trim());
        if safe.is_empty() {
            BatchId(stamp.to_string())
        } else {
            BatchId(format!("{}_{}", stamp, safe))
        }
    }

    /// Validate an externally supplied id (e.g. a CLI argument).
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let mut parts = raw.splitn(3, '_');
        let date = parts.next().unwrap_or_default();
        let time = parts.next().unwrap_or_default();
        let valid = date.len() == 8
            && date.chars().all(|c| c.is_ascii_digit())
            && time.len() >= 6
            && time.chars().all(|c| c.is_ascii_digit())
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(PipelineError::storage(format!(
                "invalid batch id '{}': expected {{timestamp}}_{{name}}",
                raw
            )));
        }
        Ok(BatchId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one raw document within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Build an id from source-native material, sanitizing for the filesystem.
    pub fn new(raw: &str) -> Result<Self, PipelineError> {
        let safe = sanitize_component(raw.trim());
        if safe.is_empty() || safe.chars().all(|c| c == '.') {
            return Err(PipelineError::storage(format!(
                "invalid document id '{}'",
                raw
            )));
        }
        Ok(DocumentId(safe))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata attached to every stored raw unit and every chunk derived from it.
///
/// `source_id` + `source_type` + the owning batch uniquely identify a raw
/// unit. Never edited in place; a correction requires a new ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source_type: SourceType,
    pub source_id: String,
    pub source_name: String,
    pub ingested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DocumentMetadata {
    pub fn new(source_type: SourceType, source_id: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            source_type,
            source_id: source_id.into(),
            source_name: source_name.into(),
            ingested_at: Utc::now(),
            source_timestamp: None,
            author: None,
            title: None,
            url: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Outcome of one ingestion operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestionStatus::InProgress => "in_progress",
            IngestionStatus::Completed => "completed",
            IngestionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Audit record for one ingestion operation (not per document).
///
/// Created at operation start, mutated only by the owning operation, and
/// persisted exactly once at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub source_type: SourceType,
    pub ingestion_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub documents_ingested: u64,
    pub documents_failed: u64,
    pub bytes_processed: u64,
    pub status: IngestionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub source_identifiers: Vec<String>,
}

impl IngestionRecord {
    /// Start a record for an operation scoped to `scope` (channel, space, file).
    pub fn begin(source_type: SourceType, scope: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        let ingestion_id = format!(
            "{}_{}_{}_{}",
            source_type,
            sanitize_component(scope),
            stamp,
            &suffix[..8]
        );
        Self {
            source_type,
            ingestion_id,
            started_at: Utc::now(),
            completed_at: None,
            documents_ingested: 0,
            documents_failed: 0,
            bytes_processed: 0,
            status: IngestionStatus::InProgress,
            error_message: None,
            source_identifiers: Vec::new(),
        }
    }

    pub fn complete(&mut self) {
        self.status = IngestionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.status = IngestionStatus::Failed;
        self.error_message = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }
}

/// What `list_batches` returns: one row per batch directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub document_count: u64,
}

/// An overlapping text window derived from one raw document.
///
/// Ephemeral: re-derivable from raw data at any time, never persisted on its
/// own. The flattened metadata map is the contract consumed by retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub chunk_index: u64,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A chunk with its similarity score, as returned by index search.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub score: f32,
    pub chunk: Chunk,
}

/// Which lifecycle operation last touched the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOperation {
    Initialize,
    Update,
    Rebuild,
}

impl fmt::Display for IndexOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexOperation::Initialize => "initialize",
            IndexOperation::Update => "update",
            IndexOperation::Rebuild => "rebuild",
        };
        f.write_str(s)
    }
}

/// Singleton record describing the current vector index.
///
/// Overwritten atomically on every initialize/update/rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexVersionRecord {
    pub embedding_model: String,
    pub document_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
    pub operation: IndexOperation,
    pub batches: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_id_carries_timestamp_and_name() {
        let id = BatchId::generate("eng-updates");
        assert!(id.as_str().ends_with("_eng-updates"));
        BatchId::parse(id.as_str()).unwrap();
    }

    #[test]
    fn batch_id_sanitizes_hostile_names() {
        let id = BatchId::generate("a/b c#d");
        assert!(id.as_str().ends_with("_a_b_c_d"));
    }

    #[test]
    fn batch_ids_generated_back_to_back_are_distinct() {
        let a = BatchId::generate("eng");
        let b = BatchId::generate("eng");
        assert_ne!(a, b);
    }

    #[test]
    fn batch_id_parse_rejects_garbage() {
        assert!(BatchId::parse("not-a-batch").is_err());
        assert!(BatchId::parse("20250101").is_err());
        assert!(BatchId::parse("20250101_120000_ok").is_ok());
    }

    #[test]
    fn document_id_rejects_empty() {
        assert!(DocumentId::new("   ").is_err());
        assert_eq!(DocumentId::new("thread 17.3").unwrap().as_str(), "thread_17.3");
    }

    #[test]
    fn metadata_roundtrips_through_json() {
        let mut meta = DocumentMetadata::new(SourceType::Wiki, "page_42", "Runbooks");
        meta.author = Some("dana".to_string());
        meta.title = Some("Oncall runbook".to_string());
        meta.url = Some("https://wiki.example.com/x/42".to_string());
        meta.extra
            .insert("space_key".to_string(), serde_json::json!("ENG"));

        let json = serde_json::to_string(&meta).unwrap();
        let back: DocumentMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn record_lifecycle_sets_status_and_completion() {
        let mut record = IngestionRecord::begin(SourceType::Chat, "C123");
        assert_eq!(record.status, IngestionStatus::InProgress);
        assert!(record.completed_at.is_none());
        assert!(record.ingestion_id.starts_with("chat_C123_"));

        record.documents_ingested = 10;
        record.documents_failed = 2;
        record.complete();
        assert_eq!(record.status, IngestionStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn failed_record_keeps_error_message() {
        let mut record = IngestionRecord::begin(SourceType::Wiki, "ENG");
        record.fail("space not reachable");
        assert_eq!(record.status, IngestionStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("space not reachable"));
    }
}
