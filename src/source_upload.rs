//! Upload ingestor: files from disk or raw bytes.
//!
//! Plain-text formats pass through unchanged; page-oriented formats (PDF,
//! DOCX) go through text extraction, and their original bytes are preserved
//! next to the parsed unit. One stored unit per file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::extract;
use crate::models::{BatchId, DocumentId, DocumentMetadata, IngestionRecord, SourceType};
use crate::source::{selector_mismatch, IngestOptions, SourceIngestor, SourceSelector};
use crate::store::RawStore;

const TEXT_EXTENSIONS: [&str; 3] = ["txt", "md", "markdown"];

pub struct UploadIngestor {
    store: Arc<RawStore>,
}

impl UploadIngestor {
    pub fn new(store: Arc<RawStore>) -> Self {
        Self { store }
    }

    fn read_file(path: &Path) -> Result<(String, Vec<u8>), PipelineError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::source_unavailable(format!(
                "not a file path: {}",
                path.display()
            )))?;
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::source_unavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok((filename, bytes))
    }

    /// Store one uploaded payload as a raw unit; returns its byte count.
    fn store_payload(
        &self,
        batch: &BatchId,
        filename: &str,
        bytes: &[u8],
        uploaded_by: Option<&str>,
    ) -> Result<u64, PipelineError> {
        let path = Path::new(filename);
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());

        let content: Value = if TEXT_EXTENSIONS.contains(&extension.as_str()) {
            let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
                PipelineError::storage(format!("{}: expected UTF-8 text", filename))
            })?;
            let line_count = text.lines().count();
            let char_count = text.chars().count();
            serde_json::json!({
                "filename": filename,
                "content": text,
                "line_count": line_count,
                "char_count": char_count,
            })
        } else if extract::is_paged_format(&extension) {
            let pages = extract::extract_pages(bytes, &extension)
                .map_err(|e| PipelineError::storage(e.to_string()))?;
            let rendered: Vec<Value> = pages
                .iter()
                .enumerate()
                .filter(|(_, text)| !text.trim().is_empty())
                .map(|(i, text)| serde_json::json!({"page": i + 1, "text": text}))
                .collect();
            serde_json::json!({
                "filename": filename,
                "total_pages": pages.len(),
                "extracted_pages": rendered.len(),
                "pages": rendered,
            })
        } else {
            return Err(PipelineError::storage(format!(
                "unsupported file extension: .{}",
                extension
            )));
        };

        let hash = format!("{:x}", Sha256::digest(bytes));
        let mut metadata = DocumentMetadata::new(
            SourceType::Upload,
            format!("upload_{}", &hash[..16]),
            filename,
        );
        metadata.title = Some(stem.clone());
        if let Some(user) = uploaded_by {
            metadata
                .extra
                .insert("uploaded_by".to_string(), serde_json::json!(user));
        }
        metadata
            .extra
            .insert("file_size_bytes".to_string(), serde_json::json!(bytes.len()));

        let document_id = DocumentId::new(&stem)?;
        self.store
            .store_document(batch, &document_id, &content, &metadata)?;

        // Keep the original bytes of page-oriented formats for re-extraction.
        if extract::is_paged_format(&extension) {
            self.store.store_binary(batch, filename, bytes, &metadata)?;
        }

        info!(file = filename, bytes = bytes.len(), "ingested upload");
        Ok(bytes.len() as u64)
    }

    fn run_single(
        &self,
        record: &mut IngestionRecord,
        filename: &str,
        bytes: &[u8],
        options: &IngestOptions,
    ) -> Result<(), PipelineError> {
        record.source_identifiers.push(filename.to_string());
        let batch = self.store.create_batch(SourceType::Upload, "uploads")?;
        match self.store_payload(&batch, filename, bytes, options.uploaded_by.as_deref()) {
            Ok(stored) => {
                record.documents_ingested = 1;
                record.bytes_processed = stored;
                Ok(())
            }
            Err(err) => {
                // A single-file run has no other items to continue with.
                record.documents_failed = 1;
                Err(err)
            }
        }
    }

    fn run_many(
        &self,
        record: &mut IngestionRecord,
        paths: &[std::path::PathBuf],
        options: &IngestOptions,
    ) -> Result<(), PipelineError> {
        let batch = self.store.create_batch(SourceType::Upload, "uploads")?;
        for path in paths {
            let outcome = Self::read_file(path).and_then(|(filename, bytes)| {
                record.source_identifiers.push(filename.clone());
                self.store_payload(&batch, &filename, &bytes, options.uploaded_by.as_deref())
            });
            match outcome {
                Ok(stored) => {
                    record.documents_ingested += 1;
                    record.bytes_processed += stored;
                }
                Err(err) => {
                    warn!(file = %path.display(), %err, "failed to ingest upload");
                    record.documents_failed += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceIngestor for UploadIngestor {
    fn source_type(&self) -> SourceType {
        SourceType::Upload
    }

    fn describe(&self) -> &str {
        "uploaded files from disk paths or raw bytes"
    }

    async fn ingest(
        &self,
        selector: SourceSelector,
        options: &IngestOptions,
    ) -> Result<IngestionRecord, PipelineError> {
        let scope = match &selector {
            SourceSelector::FilePath { path } => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string()),
            SourceSelector::FileBytes { filename, .. } => filename.clone(),
            SourceSelector::Files { .. } => "batch".to_string(),
            other => return Err(selector_mismatch(SourceType::Upload, other)),
        };

        let mut record = IngestionRecord::begin(SourceType::Upload, &scope);
        let outcome = match selector {
            SourceSelector::FilePath { path } => Self::read_file(&path)
                .and_then(|(filename, bytes)| self.run_single(&mut record, &filename, &bytes, options)),
            SourceSelector::FileBytes { filename, bytes } => {
                self.run_single(&mut record, &filename, &bytes, options)
            }
            SourceSelector::Files { paths } => self.run_many(&mut record, &paths, options),
            _ => unreachable!(),
        };

        match outcome {
            Ok(()) => record.complete(),
            Err(err) => {
                warn!(%err, "upload ingestion failed");
                record.fail(&err);
            }
        }
        self.store.log_ingestion(&record)?;
        Ok(record)
    }
}
