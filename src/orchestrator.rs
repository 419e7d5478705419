//! Stateless facade over the ingestion pipeline.
//!
//! One method per source-ingestion workflow, the index lifecycle methods,
//! and the read-only history queries. Argument marshaling and component
//! wiring only; every invariant is enforced by the components underneath.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::PipelineError;
use crate::index::VectorIndexManager;
use crate::models::{
    BatchId, BatchSummary, IndexVersionRecord, IngestionRecord, ScoredChunk, SourceType,
};
use crate::process::DocumentProcessor;
use crate::source::{IngestOptions, SourceIngestor, SourceSelector};
use crate::source_chat::ChatIngestor;
use crate::source_upload::UploadIngestor;
use crate::source_wiki::WikiIngestor;
use crate::store::RawStore;

pub struct Orchestrator {
    store: Arc<RawStore>,
    chat: ChatIngestor,
    wiki: WikiIngestor,
    upload: UploadIngestor,
    index: VectorIndexManager,
}

impl Orchestrator {
    /// Wire up the store, processor, index manager, and the three ingestors.
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        let store = Arc::new(RawStore::open(&config.storage)?);
        let processor = DocumentProcessor::new(Arc::clone(&store), &config.chunking);
        let index = VectorIndexManager::new(Arc::clone(&store), processor, config);

        let chat = ChatIngestor::new(Arc::clone(&store), config.chat.as_ref());
        let wiki = WikiIngestor::new(Arc::clone(&store), config.wiki.as_ref());
        let upload = UploadIngestor::new(Arc::clone(&store));

        info!("ingestion orchestrator initialized");
        Ok(Self {
            store,
            chat,
            wiki,
            upload,
            index,
        })
    }

    /// The variant answering to `source_type`; the single dispatch point.
    fn ingestor(&self, source_type: SourceType) -> &dyn SourceIngestor {
        match source_type {
            SourceType::Chat => &self.chat,
            SourceType::Wiki => &self.wiki,
            SourceType::Upload => &self.upload,
        }
    }

    async fn ingest(
        &self,
        source_type: SourceType,
        selector: SourceSelector,
        options: IngestOptions,
    ) -> Result<IngestionRecord, PipelineError> {
        self.ingestor(source_type).ingest(selector, &options).await
    }

    // ------------------------------------------------------------------
    // Source ingestion workflows
    // ------------------------------------------------------------------

    pub async fn ingest_chat_export(&self, path: PathBuf) -> Result<IngestionRecord, PipelineError> {
        self.ingest(
            SourceType::Chat,
            SourceSelector::ChatExport { path },
            IngestOptions::default(),
        )
        .await
    }

    pub async fn ingest_chat_channel(
        &self,
        channel_id: &str,
        days_history: Option<i64>,
    ) -> Result<IngestionRecord, PipelineError> {
        self.ingest(
            SourceType::Chat,
            SourceSelector::ChatChannel {
                id: channel_id.to_string(),
            },
            IngestOptions {
                days_history,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn ingest_wiki_space(
        &self,
        space_key: &str,
        limit: Option<usize>,
    ) -> Result<IngestionRecord, PipelineError> {
        self.ingest(
            SourceType::Wiki,
            SourceSelector::WikiSpace {
                key: space_key.to_string(),
            },
            IngestOptions {
                limit,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn ingest_wiki_page(&self, page_id: &str) -> Result<IngestionRecord, PipelineError> {
        self.ingest(
            SourceType::Wiki,
            SourceSelector::WikiPage {
                id: page_id.to_string(),
            },
            IngestOptions::default(),
        )
        .await
    }

    pub async fn ingest_file(
        &self,
        path: PathBuf,
        uploaded_by: Option<String>,
    ) -> Result<IngestionRecord, PipelineError> {
        self.ingest(
            SourceType::Upload,
            SourceSelector::FilePath { path },
            IngestOptions {
                uploaded_by,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn ingest_files(
        &self,
        paths: Vec<PathBuf>,
        uploaded_by: Option<String>,
    ) -> Result<IngestionRecord, PipelineError> {
        self.ingest(
            SourceType::Upload,
            SourceSelector::Files { paths },
            IngestOptions {
                uploaded_by,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn ingest_bytes(
        &self,
        filename: String,
        bytes: Vec<u8>,
        uploaded_by: Option<String>,
    ) -> Result<IngestionRecord, PipelineError> {
        self.ingest(
            SourceType::Upload,
            SourceSelector::FileBytes { filename, bytes },
            IngestOptions {
                uploaded_by,
                ..Default::default()
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Index lifecycle
    // ------------------------------------------------------------------

    pub async fn initialize_index(
        &self,
        force: bool,
    ) -> Result<IndexVersionRecord, PipelineError> {
        self.index.initialize_index(None, force).await
    }

    pub async fn update_index(
        &self,
        batch_ids: &[BatchId],
    ) -> Result<IndexVersionRecord, PipelineError> {
        self.index.update_index(batch_ids).await
    }

    pub async fn rebuild_index(&self, backup: bool) -> Result<IndexVersionRecord, PipelineError> {
        self.index.rebuild_index(None, backup).await
    }

    pub fn index_info(&self) -> Result<Option<IndexVersionRecord>, PipelineError> {
        self.index.get_index_info()
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>, PipelineError> {
        self.index.search(query, limit).await
    }

    // ------------------------------------------------------------------
    // Read-only history
    // ------------------------------------------------------------------

    pub fn ingestion_history(
        &self,
        source_type: Option<SourceType>,
    ) -> Result<Vec<IngestionRecord>, PipelineError> {
        self.store.get_ingestion_history(source_type)
    }

    pub fn batches(&self, source_type: SourceType) -> Result<Vec<BatchSummary>, PipelineError> {
        self.store.list_batches(source_type)
    }
}
