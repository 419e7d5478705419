//! Vector index lifecycle: initialize, update, rebuild, inspect, search.
//!
//! The index is the only mutable derived artifact in the system, and it is
//! always fully reconstructable from the raw store plus the configured
//! chunking parameters and embedding model. The live index lives under
//! `data/vectorstore/` as `records.jsonl` (one embedded chunk per line);
//! the singleton version record sits next to it as
//! `data/vectorstore_version.json`.
//!
//! Commit discipline: every embedding call for an operation completes before
//! any file is touched, and files are swapped in with atomic renames, so an
//! embedding-backend failure leaves the previous index untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{Config, EmbeddingConfig};
use crate::embedding::{self, blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::PipelineError;
use crate::models::{
    BatchId, Chunk, IndexOperation, IndexVersionRecord, ScoredChunk,
};
use crate::process::DocumentProcessor;
use crate::store::{write_json_atomic, RawStore};

/// One embedded chunk as persisted in `records.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    text: String,
    chunk_index: u64,
    metadata: std::collections::BTreeMap<String, Value>,
    /// Base64-encoded little-endian `f32` embedding vector.
    vector: String,
}

impl IndexRecord {
    fn into_chunk(self) -> (Chunk, Vec<f32>) {
        let vector = base64::engine::general_purpose::STANDARD
            .decode(&self.vector)
            .map(|blob| blob_to_vec(&blob))
            .unwrap_or_default();
        (
            Chunk {
                text: self.text,
                chunk_index: self.chunk_index,
                metadata: self.metadata,
            },
            vector,
        )
    }
}

pub struct VectorIndexManager {
    store: Arc<RawStore>,
    processor: DocumentProcessor,
    embedding: EmbeddingConfig,
    vectorstore_dir: PathBuf,
    version_file: PathBuf,
}

impl VectorIndexManager {
    pub fn new(store: Arc<RawStore>, processor: DocumentProcessor, config: &Config) -> Self {
        Self {
            store,
            processor,
            embedding: config.embedding.clone(),
            vectorstore_dir: config.storage.vectorstore_dir(),
            version_file: config.storage.version_file(),
        }
    }

    pub fn exists(&self) -> bool {
        self.vectorstore_dir.is_dir()
    }

    fn records_file(&self) -> PathBuf {
        self.vectorstore_dir.join("records.jsonl")
    }

    /// Build a fresh index from all raw batches, or a given subset.
    pub async fn initialize_index(
        &self,
        batches: Option<Vec<BatchId>>,
        force: bool,
    ) -> Result<IndexVersionRecord, PipelineError> {
        if self.exists() && !force {
            return Err(PipelineError::AlreadyInitialized(
                self.vectorstore_dir.clone(),
            ));
        }
        self.build(batches, IndexOperation::Initialize).await
    }

    /// Incrementally embed the given batches and merge them into the index.
    ///
    /// Existing entries are never touched. Not idempotent by design: callers
    /// track what is already indexed through the version record's batch list.
    pub async fn update_index(
        &self,
        batch_ids: &[BatchId],
    ) -> Result<IndexVersionRecord, PipelineError> {
        if !self.exists() {
            return Err(PipelineError::storage(
                "vector index not initialized; run `index init` first",
            ));
        }
        let mut version = self.get_index_info()?.ok_or_else(|| {
            PipelineError::storage("vector index version record missing; rebuild the index")
        })?;

        // Explicitly named batches: a missing one is an error, not a skip.
        let mut new_chunks = Vec::new();
        for batch_id in batch_ids {
            new_chunks.extend(self.processor.process_batch(batch_id)?);
        }
        if new_chunks.is_empty() {
            warn!("no new chunks to add, index unchanged");
            return Ok(version);
        }

        let records = self.embed_chunks(&new_chunks).await?;

        let mut lines = fs::read_to_string(self.records_file())?;
        if !lines.is_empty() && !lines.ends_with('\n') {
            lines.push('\n');
        }
        for record in &records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        crate::store::write_atomic(&self.records_file(), lines.as_bytes())?;

        version.document_count += records.len() as u64;
        version.last_updated = Utc::now();
        version.version += 1;
        version.operation = IndexOperation::Update;
        version
            .batches
            .extend(batch_ids.iter().map(|b| b.to_string()));
        write_json_atomic(&self.version_file, &version)?;

        info!(added = records.len(), total = version.document_count, "index updated");
        Ok(version)
    }

    /// Discard and re-derive the index from raw data, backing up first.
    ///
    /// The backup step is the default because this is the only destructive
    /// operation in the system.
    pub async fn rebuild_index(
        &self,
        batches: Option<Vec<BatchId>>,
        backup: bool,
    ) -> Result<IndexVersionRecord, PipelineError> {
        if !self.exists() {
            info!("no existing index, performing initial creation");
            return self.build(batches, IndexOperation::Initialize).await;
        }

        if backup {
            let backup_dir = self.backup_index()?;
            info!(backup = %backup_dir.display(), "backed up existing index");
        }

        self.build(batches, IndexOperation::Rebuild).await
    }

    /// Read-only view of the version record; `None` when no index exists.
    pub fn get_index_info(&self) -> Result<Option<IndexVersionRecord>, PipelineError> {
        if !self.exists() || !self.version_file.exists() {
            return Ok(None);
        }
        let record = serde_json::from_str(&fs::read_to_string(&self.version_file)?)?;
        Ok(Some(record))
    }

    /// Embed the query and return the `k` most similar chunks.
    ///
    /// This is the contract the retrieval side consumes: chunk objects
    /// exposing `text` plus the flattened metadata fields.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, PipelineError> {
        if !self.exists() {
            return Err(PipelineError::storage(
                "vector index not initialized; run `index init` first",
            ));
        }
        let query_vector = embedding::embed_query(&self.embedding, query).await?;

        let mut scored: Vec<ScoredChunk> = Vec::new();
        for line in fs::read_to_string(self.records_file())?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: IndexRecord = serde_json::from_str(line)?;
            let (chunk, vector) = record.into_chunk();
            scored.push(ScoredChunk {
                score: cosine_similarity(&query_vector, &vector),
                chunk,
            });
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Process, embed, and atomically swap in a fresh index.
    async fn build(
        &self,
        batches: Option<Vec<BatchId>>,
        operation: IndexOperation,
    ) -> Result<IndexVersionRecord, PipelineError> {
        let batch_ids: Vec<BatchId> = match batches {
            Some(ids) => ids,
            None => self
                .store
                .all_batches()?
                .into_iter()
                .map(|b| b.batch_id)
                .collect(),
        };
        info!(batches = batch_ids.len(), %operation, "building vector index");

        let mut chunks = Vec::new();
        let mut indexed_batches = Vec::new();
        for batch_id in &batch_ids {
            match self.processor.process_batch(batch_id) {
                Ok(batch_chunks) => {
                    if !batch_chunks.is_empty() {
                        indexed_batches.push(batch_id.to_string());
                    }
                    chunks.extend(batch_chunks);
                }
                Err(err) => {
                    warn!(batch = %batch_id, %err, "failed to process batch, skipping");
                }
            }
        }
        if chunks.is_empty() {
            return Err(PipelineError::storage("no documents to index"));
        }

        // All embedding happens before any file is touched.
        let records = self.embed_chunks(&chunks).await?;
        let provider = embedding::create_provider(&self.embedding)?;

        let staging = self
            .vectorstore_dir
            .with_file_name(".vectorstore.staging");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        let mut lines = String::new();
        for record in &records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        fs::write(staging.join("records.jsonl"), lines)?;

        if self.exists() {
            fs::remove_dir_all(&self.vectorstore_dir)?;
        }
        fs::rename(&staging, &self.vectorstore_dir)?;

        let now = Utc::now();
        let version = IndexVersionRecord {
            embedding_model: provider.model_name().to_string(),
            document_count: records.len() as u64,
            created_at: now,
            last_updated: now,
            version: 1,
            operation,
            batches: indexed_batches,
        };
        write_json_atomic(&self.version_file, &version)?;

        info!(chunks = records.len(), "vector index built");
        Ok(version)
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<IndexRecord>, PipelineError> {
        let mut records = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.embedding.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedding::embed_texts(&self.embedding, &texts).await?;
            for (chunk, vector) in batch.iter().zip(vectors) {
                records.push(IndexRecord {
                    text: chunk.text.clone(),
                    chunk_index: chunk.chunk_index,
                    metadata: chunk.metadata.clone(),
                    vector: base64::engine::general_purpose::STANDARD.encode(vec_to_blob(&vector)),
                });
            }
        }
        Ok(records)
    }

    fn backup_index(&self) -> Result<PathBuf, PipelineError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%6f");
        let backup_dir = self
            .vectorstore_dir
            .with_file_name(format!("vectorstore_backup_{}", stamp));
        copy_dir_all(&self.vectorstore_dir, &backup_dir)?;
        Ok(backup_dir)
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, StorageConfig};
    use crate::models::{DocumentId, DocumentMetadata, SourceType};
    use tempfile::TempDir;

    struct Env {
        _tmp: TempDir,
        config: Config,
        store: Arc<RawStore>,
    }

    fn setup() -> Env {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            storage: StorageConfig {
                data_dir: tmp.path().join("data"),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig {
                provider: "hash".to_string(),
                dims: Some(32),
                batch_size: 4,
                ..EmbeddingConfig::default()
            },
            chat: None,
            wiki: None,
        };
        let store = Arc::new(RawStore::open(&config.storage).unwrap());
        Env {
            _tmp: tmp,
            config,
            store,
        }
    }

    fn manager(env: &Env) -> VectorIndexManager {
        let processor = DocumentProcessor::new(Arc::clone(&env.store), &env.config.chunking);
        VectorIndexManager::new(Arc::clone(&env.store), processor, &env.config)
    }

    fn store_upload(env: &Env, name: &str, body: &str) -> BatchId {
        let batch = env.store.create_batch(SourceType::Upload, "uploads").unwrap();
        let metadata = DocumentMetadata::new(
            SourceType::Upload,
            format!("upload_{}", name),
            format!("{}.txt", name),
        );
        env.store
            .store_document(
                &batch,
                &DocumentId::new(name).unwrap(),
                &serde_json::json!({"filename": format!("{}.txt", name), "content": body}),
                &metadata,
            )
            .unwrap();
        batch
    }

    #[tokio::test]
    async fn initialize_counts_every_chunk() {
        let env = setup();
        let long_body = "release notes ".repeat(100);
        store_upload(&env, "notes", &long_body);
        store_upload(&env, "faq", "short answer");

        let mgr = manager(&env);
        let version = mgr.initialize_index(None, false).await.unwrap();

        let processor = DocumentProcessor::new(Arc::clone(&env.store), &env.config.chunking);
        let expected: usize = env
            .store
            .all_batches()
            .unwrap()
            .iter()
            .map(|b| processor.process_batch(&b.batch_id).unwrap().len())
            .sum();

        assert_eq!(version.document_count as usize, expected);
        assert_eq!(version.operation, IndexOperation::Initialize);
        assert_eq!(version.embedding_model, "hash-sha256");
        assert_eq!(version.batches.len(), 2);
        assert_eq!(mgr.get_index_info().unwrap().unwrap(), version);
    }

    #[tokio::test]
    async fn double_initialize_requires_force() {
        let env = setup();
        store_upload(&env, "notes", "body text");
        let mgr = manager(&env);

        mgr.initialize_index(None, false).await.unwrap();
        let err = mgr.initialize_index(None, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyInitialized(_)));

        mgr.initialize_index(None, true).await.unwrap();
    }

    #[tokio::test]
    async fn update_appends_and_is_deliberately_not_idempotent() {
        let env = setup();
        let first = store_upload(&env, "notes", "first document body");
        let mgr = manager(&env);
        let initial = mgr
            .initialize_index(Some(vec![first.clone()]), false)
            .await
            .unwrap();

        let second = store_upload(&env, "faq", "second document body");
        let updated = mgr.update_index(&[second.clone()]).await.unwrap();
        assert_eq!(updated.document_count, initial.document_count + 1);
        assert_eq!(updated.operation, IndexOperation::Update);
        assert_eq!(updated.version, initial.version + 1);
        assert!(updated.batches.contains(&second.to_string()));

        // Re-running the same update doubles the entries; the version
        // record's batch list is how callers notice.
        let again = mgr.update_index(&[second.clone()]).await.unwrap();
        assert_eq!(again.document_count, updated.document_count + 1);
        assert_eq!(
            again.batches.iter().filter(|b| **b == second.to_string()).count(),
            2
        );
    }

    #[tokio::test]
    async fn update_requires_an_existing_index() {
        let env = setup();
        let batch = store_upload(&env, "notes", "body");
        let mgr = manager(&env);
        let err = mgr.update_index(&[batch]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }

    #[tokio::test]
    async fn rebuild_backs_up_then_rederives_from_raw_data() {
        let env = setup();
        store_upload(&env, "notes", &"policy ".repeat(200));
        let mgr = manager(&env);
        let initial = mgr.initialize_index(None, false).await.unwrap();

        let rebuilt = mgr.rebuild_index(None, true).await.unwrap();
        assert_eq!(rebuilt.operation, IndexOperation::Rebuild);
        assert_eq!(rebuilt.document_count, initial.document_count);

        // The backup is a full snapshot of the pre-rebuild index.
        let data_dir = env.config.storage.data_dir.clone();
        let backup = fs::read_dir(&data_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("vectorstore_backup_")
            })
            .expect("backup directory created");
        let backup_records = fs::read_to_string(backup.path().join("records.jsonl")).unwrap();
        assert_eq!(
            backup_records.lines().count() as u64,
            initial.document_count
        );
    }

    #[tokio::test]
    async fn embedding_failure_commits_nothing() {
        let mut env = setup();
        env.config.embedding = EmbeddingConfig::default(); // disabled
        store_upload(&env, "notes", "body");
        let mgr = manager(&env);

        let err = mgr.initialize_index(None, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmbeddingBackend(_)));
        assert!(!mgr.exists());
        assert!(mgr.get_index_info().unwrap().is_none());
    }

    #[tokio::test]
    async fn search_returns_ranked_chunks_with_metadata() {
        let env = setup();
        store_upload(&env, "notes", "the deploy runbook says page the secondary");
        store_upload(&env, "faq", "lunch menu for tuesday");
        let mgr = manager(&env);
        mgr.initialize_index(None, false).await.unwrap();

        let results = mgr
            .search("the deploy runbook says page the secondary", 1)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        // The hash provider embeds identical text identically, so the exact
        // match scores 1.0 and wins.
        assert!((results[0].score - 1.0).abs() < 1e-4);
        assert_eq!(
            results[0].chunk.metadata.get("source"),
            Some(&serde_json::json!("notes.txt"))
        );
    }
}
