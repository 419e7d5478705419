//! Append-only raw document store.
//!
//! Every knowledge source writes through this layer before anything else
//! happens. Raw content is preserved immutably so the vector index can be
//! rebuilt at any time: a duplicate write is an error, never an overwrite,
//! and nothing here ever edits a stored file in place.
//!
//! Directory layout (the persisted contract):
//!
//! ```text
//! data/raw/{source_type}/{batch_id}/
//!     metadata.json                 batch-level summary
//!     {document_id}.json            raw content
//!     {document_id}.meta.json       DocumentMetadata
//! data/ingestion_logs/{ingestion_id}.json
//! ```
//!
//! Writes go to a temporary sibling and are committed with an atomic rename.
//! For a document the `.meta.json` file lands first and the content file is
//! the commit point: readers ignore a metadata file whose content file never
//! appeared, so a crash mid-write leaves no partially visible document.
//!
//! The store assumes a single writer. Concurrent ingestion would need a
//! per-batch lock on top; batches are already the unit of isolation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::PipelineError;
use crate::models::{
    sanitize_component, BatchId, BatchSummary, DocumentId, DocumentMetadata, IngestionRecord,
    SourceType,
};

/// Batch-level `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchMeta {
    batch_id: BatchId,
    source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    created_at: DateTime<Utc>,
    documents: Vec<BatchDocEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchDocEntry {
    id: String,
    filename: String,
    stored_at: DateTime<Utc>,
}

/// A raw unit loaded back from a batch, ready for processing.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub content: serde_json::Value,
    pub metadata: DocumentMetadata,
}

pub struct RawStore {
    raw_root: PathBuf,
    logs_dir: PathBuf,
}

impl RawStore {
    /// Open the store, creating the directory skeleton if needed.
    pub fn open(storage: &StorageConfig) -> Result<Self, PipelineError> {
        let raw_root = storage.raw_root();
        let logs_dir = storage.logs_dir();
        for source_type in SourceType::ALL {
            fs::create_dir_all(raw_root.join(source_type.as_str()))?;
        }
        fs::create_dir_all(&logs_dir)?;
        info!(data_dir = %storage.data_dir.display(), "raw store opened");
        Ok(Self { raw_root, logs_dir })
    }

    fn source_dir(&self, source_type: SourceType) -> PathBuf {
        self.raw_root.join(source_type.as_str())
    }

    /// Resolve a batch id to its source type and directory.
    pub fn resolve_batch(&self, batch_id: &BatchId) -> Result<(SourceType, PathBuf), PipelineError> {
        for source_type in SourceType::ALL {
            let dir = self.source_dir(source_type).join(batch_id.as_str());
            if dir.is_dir() {
                return Ok((source_type, dir));
            }
        }
        Err(PipelineError::storage(format!(
            "batch '{}' not found",
            batch_id
        )))
    }

    /// Create a new batch directory for one ingestion run.
    ///
    /// The generated id embeds a timestamp; an existing directory at the
    /// target location is a hard error rather than a silent merge.
    pub fn create_batch(&self, source_type: SourceType, name: &str) -> Result<BatchId, PipelineError> {
        let batch_id = BatchId::generate(name);
        let dir = self.source_dir(source_type).join(batch_id.as_str());
        if dir.exists() {
            return Err(PipelineError::storage(format!(
                "batch location already exists: {}",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;

        let meta = BatchMeta {
            batch_id: batch_id.clone(),
            source_type,
            name: (!name.trim().is_empty()).then(|| name.trim().to_string()),
            created_at: Utc::now(),
            documents: Vec::new(),
        };
        write_json_atomic(&dir.join("metadata.json"), &meta)?;

        info!(batch = %batch_id, source = %source_type, "created ingestion batch");
        Ok(batch_id)
    }

    /// Store a raw document and its metadata as two linked records.
    ///
    /// A duplicate `document_id` within the batch is rejected with
    /// [`PipelineError::DuplicateDocument`]; the first write stays untouched.
    pub fn store_document(
        &self,
        batch_id: &BatchId,
        document_id: &DocumentId,
        content: &serde_json::Value,
        metadata: &DocumentMetadata,
    ) -> Result<PathBuf, PipelineError> {
        let (_, dir) = self.resolve_batch(batch_id)?;
        let content_path = dir.join(format!("{}.json", document_id));
        let meta_path = dir.join(format!("{}.meta.json", document_id));

        if content_path.exists() || meta_path.exists() {
            return Err(PipelineError::DuplicateDocument {
                batch_id: batch_id.to_string(),
                document_id: document_id.to_string(),
            });
        }

        // Metadata first; the content file commits the document.
        write_json_atomic(&meta_path, metadata)?;
        write_json_atomic(&content_path, content)?;

        self.append_batch_entry(&dir, document_id.as_str(), &content_path)?;
        debug!(batch = %batch_id, document = %document_id, "stored raw document");
        Ok(content_path)
    }

    /// Store a binary payload (e.g. an uploaded PDF) with its metadata.
    ///
    /// The payload name embeds a sha256 content hash, and the hash is copied
    /// into the stored metadata so callers can build de-duplication on top.
    pub fn store_binary(
        &self,
        batch_id: &BatchId,
        filename: &str,
        bytes: &[u8],
        metadata: &DocumentMetadata,
    ) -> Result<PathBuf, PipelineError> {
        let (_, dir) = self.resolve_batch(batch_id)?;

        let hash = format!("{:x}", Sha256::digest(bytes));
        let short_hash = &hash[..16];
        let path = Path::new(filename);
        let stem = sanitize_component(
            path.file_stem()
                .map(|s| s.to_string_lossy())
                .unwrap_or_default()
                .as_ref(),
        );
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let stored_id = format!("{}_{}", stem, short_hash);
        let payload_path = dir.join(format!("{}{}", stored_id, ext));
        let meta_path = dir.join(format!("{}.meta.json", stored_id));

        if payload_path.exists() || meta_path.exists() {
            return Err(PipelineError::DuplicateDocument {
                batch_id: batch_id.to_string(),
                document_id: stored_id,
            });
        }

        let mut stored_meta = metadata.clone();
        stored_meta
            .extra
            .insert("content_hash".to_string(), serde_json::json!(short_hash));
        stored_meta.extra.insert(
            "original_filename".to_string(),
            serde_json::json!(filename),
        );
        stored_meta
            .extra
            .insert("size_bytes".to_string(), serde_json::json!(bytes.len()));

        write_json_atomic(&meta_path, &stored_meta)?;
        write_atomic(&payload_path, bytes)?;

        self.append_batch_entry(&dir, &stored_id, &payload_path)?;
        info!(batch = %batch_id, file = %filename, size = bytes.len(), "stored binary payload");
        Ok(payload_path)
    }

    /// Append an ingestion record to the audit log.
    ///
    /// Writing the same record twice is a no-op; the same id with different
    /// content is a [`PipelineError::Conflict`].
    pub fn log_ingestion(&self, record: &IngestionRecord) -> Result<(), PipelineError> {
        let path = self.logs_dir.join(format!("{}.json", record.ingestion_id));
        let value = serde_json::to_value(record)?;

        if path.exists() {
            let existing: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if existing == value {
                return Ok(());
            }
            return Err(PipelineError::Conflict(record.ingestion_id.clone()));
        }

        write_json_atomic(&path, record)?;
        info!(ingestion = %record.ingestion_id, status = %record.status, "logged ingestion");
        Ok(())
    }

    /// List all batches for one source type, newest first.
    pub fn list_batches(&self, source_type: SourceType) -> Result<Vec<BatchSummary>, PipelineError> {
        let dir = self.source_dir(source_type);
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match read_batch_meta(&entry.path()) {
                Ok(meta) => summaries.push(summary_of(&meta)),
                Err(err) => {
                    warn!(dir = %entry.path().display(), %err, "skipping unreadable batch");
                }
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// All batches across every source type, newest first.
    pub fn all_batches(&self) -> Result<Vec<BatchSummary>, PipelineError> {
        let mut all = Vec::new();
        for source_type in SourceType::ALL {
            all.extend(self.list_batches(source_type)?);
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    /// Summary for one batch.
    pub fn read_batch(&self, batch_id: &BatchId) -> Result<BatchSummary, PipelineError> {
        let (_, dir) = self.resolve_batch(batch_id)?;
        Ok(summary_of(&read_batch_meta(&dir)?))
    }

    /// Load every committed document of a batch, in document-id order.
    ///
    /// A `.meta.json` without its content file (crash leftover, or the
    /// companion record of a binary payload) is not a visible document.
    pub fn load_documents(&self, batch_id: &BatchId) -> Result<Vec<StoredDocument>, PipelineError> {
        let (_, dir) = self.resolve_batch(batch_id)?;
        let mut documents = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(id_str) = file_name.strip_suffix(".meta.json") else {
                continue;
            };

            let content_path = dir.join(format!("{}.json", id_str));
            if !content_path.exists() {
                continue;
            }

            let metadata: DocumentMetadata =
                serde_json::from_str(&fs::read_to_string(entry.path())?)?;
            let content: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&content_path)?)?;
            documents.push(StoredDocument {
                id: DocumentId::new(id_str)?,
                content,
                metadata,
            });
        }

        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(documents)
    }

    /// Ingestion history, newest first, optionally filtered by source type.
    pub fn get_ingestion_history(
        &self,
        source_type: Option<SourceType>,
    ) -> Result<Vec<IngestionRecord>, PipelineError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.logs_dir)? {
            let entry = entry?;
            if entry.path().extension().map_or(true, |e| e != "json") {
                continue;
            }
            match serde_json::from_str::<IngestionRecord>(&fs::read_to_string(entry.path())?) {
                Ok(record) => {
                    if source_type.map_or(true, |st| st == record.source_type) {
                        records.push(record);
                    }
                }
                Err(err) => {
                    warn!(file = %entry.path().display(), %err, "skipping unreadable ingestion log");
                }
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    fn append_batch_entry(
        &self,
        batch_dir: &Path,
        id: &str,
        stored_path: &Path,
    ) -> Result<(), PipelineError> {
        let meta_path = batch_dir.join("metadata.json");
        let mut meta = read_batch_meta(batch_dir)?;
        meta.documents.push(BatchDocEntry {
            id: id.to_string(),
            filename: stored_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            stored_at: Utc::now(),
        });
        write_json_atomic(&meta_path, &meta)
    }
}

fn summary_of(meta: &BatchMeta) -> BatchSummary {
    BatchSummary {
        batch_id: meta.batch_id.clone(),
        source_type: meta.source_type,
        name: meta.name.clone(),
        created_at: meta.created_at,
        document_count: meta.documents.len() as u64,
    }
}

fn read_batch_meta(batch_dir: &Path) -> Result<BatchMeta, PipelineError> {
    let path = batch_dir.join("metadata.json");
    let content = fs::read_to_string(&path).map_err(|err| {
        PipelineError::storage(format!("not a batch directory ({}): {}", path.display(), err))
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Write bytes to a temporary sibling, then commit with an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tmp_name.push_str(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}
