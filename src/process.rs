//! Batch-to-chunk processing.
//!
//! Reads a stored batch, renders each raw unit to plain text, splits it into
//! overlapping character windows, and attaches the flattened metadata
//! envelope to every window. Processing is pure with respect to the raw
//! store: it never mutates raw data, and the same batch always yields the
//! same chunk text and boundaries, which is what makes index rebuilds safe.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ChunkingConfig;
use crate::error::PipelineError;
use crate::models::{BatchId, Chunk, DocumentMetadata, SourceType};
use crate::store::RawStore;

pub struct DocumentProcessor {
    store: Arc<RawStore>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentProcessor {
    pub fn new(store: Arc<RawStore>, chunking: &ChunkingConfig) -> Self {
        Self {
            store,
            chunk_size: chunking.chunk_size,
            chunk_overlap: chunking.chunk_overlap,
        }
    }

    /// Process every committed document of one batch into chunks.
    ///
    /// A document that fails to render is logged and skipped so one malformed
    /// raw unit cannot poison a rebuild.
    pub fn process_batch(&self, batch_id: &BatchId) -> Result<Vec<Chunk>, PipelineError> {
        let summary = self.store.read_batch(batch_id)?;
        let documents = self.store.load_documents(batch_id)?;

        let mut chunks = Vec::new();
        for doc in &documents {
            let text = match render_document(summary.source_type, &doc.content) {
                Some(text) if !text.trim().is_empty() => text,
                Some(_) => {
                    warn!(batch = %batch_id, document = %doc.id, "empty document, skipping");
                    continue;
                }
                None => {
                    warn!(batch = %batch_id, document = %doc.id, "unrenderable document, skipping");
                    continue;
                }
            };

            let envelope = flatten_metadata(&doc.metadata, batch_id);
            let windows = split_text(&text, self.chunk_size, self.chunk_overlap);
            debug!(batch = %batch_id, document = %doc.id, chunks = windows.len(), "processed document");
            for (index, window) in windows.into_iter().enumerate() {
                chunks.push(Chunk {
                    text: window,
                    chunk_index: index as u64,
                    metadata: envelope.clone(),
                });
            }
        }

        info!(
            batch = %batch_id,
            documents = documents.len(),
            chunks = chunks.len(),
            "processed batch"
        );
        Ok(chunks)
    }
}

/// Render one raw unit to plain text, by source type.
fn render_document(source_type: SourceType, content: &Value) -> Option<String> {
    match source_type {
        SourceType::Chat => render_chat(content),
        SourceType::Wiki => render_wiki(content),
        SourceType::Upload => render_upload(content),
    }
}

/// Chat threads get a channel/participant header so chunks keep their
/// conversational context even after splitting.
fn render_chat(content: &Value) -> Option<String> {
    let channel = content.get("channel_name")?.as_str()?;
    let thread_ts = content.get("thread_ts")?.as_str().unwrap_or("unknown");
    let participants: Vec<&str> = content
        .get("participants")
        .and_then(|p| p.as_array())
        .map(|p| p.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut lines = vec![
        format!("# Chat conversation: #{}", channel),
        format!("Thread: {}", thread_ts),
        format!("Participants: {}", participants.join(", ")),
        String::new(),
        "---".to_string(),
        String::new(),
    ];
    for msg in content.get("messages")?.as_array()? {
        lines.push(format!(
            "[{}] {}: {}",
            msg.get("timestamp").and_then(|t| t.as_str()).unwrap_or(""),
            msg.get("author").and_then(|a| a.as_str()).unwrap_or("unknown"),
            msg.get("text").and_then(|t| t.as_str()).unwrap_or(""),
        ));
    }
    Some(lines.join("\n"))
}

fn render_wiki(content: &Value) -> Option<String> {
    let title = content.get("title")?.as_str()?;
    let lines = vec![
        format!("# {}", title),
        format!(
            "Space: {}",
            content.get("space_key").and_then(|s| s.as_str()).unwrap_or("unknown")
        ),
        format!(
            "Path: {}",
            content
                .get("hierarchy_path")
                .and_then(|p| p.as_str())
                .unwrap_or(title)
        ),
        format!(
            "Last updated: {} by {}",
            content.get("last_updated").and_then(|w| w.as_str()).unwrap_or("unknown"),
            content.get("author").and_then(|a| a.as_str()).unwrap_or("Unknown"),
        ),
        String::new(),
        "---".to_string(),
        String::new(),
        content
            .get("text_content")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string(),
    ];
    Some(lines.join("\n"))
}

fn render_upload(content: &Value) -> Option<String> {
    if let Some(text) = content.get("content").and_then(|c| c.as_str()) {
        return Some(text.to_string());
    }

    // Page-oriented formats store extracted pages.
    let pages = content.get("pages")?.as_array()?;
    let filename = content
        .get("filename")
        .and_then(|f| f.as_str())
        .unwrap_or("document");
    let mut lines = vec![format!("# {}", filename), String::new()];
    for page in pages {
        lines.push(format!(
            "--- Page {} ---",
            page.get("page").and_then(|p| p.as_u64()).unwrap_or(0)
        ));
        lines.push(
            page.get("text")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string(),
        );
    }
    Some(lines.join("\n"))
}

/// Flattened metadata envelope attached to every chunk of a document.
///
/// This map is the contract the retrieval side consumes; keys follow the
/// stored metadata plus the owning `batch_id`.
fn flatten_metadata(metadata: &DocumentMetadata, batch_id: &BatchId) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();
    flat.insert("source".to_string(), Value::String(metadata.source_name.clone()));
    flat.insert(
        "source_type".to_string(),
        Value::String(metadata.source_type.as_str().to_string()),
    );
    flat.insert("source_id".to_string(), Value::String(metadata.source_id.clone()));
    flat.insert("batch_id".to_string(), Value::String(batch_id.to_string()));
    flat.insert(
        "ingested_at".to_string(),
        Value::String(metadata.ingested_at.to_rfc3339()),
    );
    if let Some(ts) = metadata.source_timestamp {
        flat.insert("source_timestamp".to_string(), Value::String(ts.to_rfc3339()));
    }
    if let Some(author) = &metadata.author {
        flat.insert("author".to_string(), Value::String(author.clone()));
    }
    if let Some(title) = &metadata.title {
        flat.insert("title".to_string(), Value::String(title.clone()));
    }
    if let Some(url) = &metadata.url {
        flat.insert("url".to_string(), Value::String(url.clone()));
    }
    for (key, value) in &metadata.extra {
        flat.insert(key.clone(), value.clone());
    }
    flat
}

/// Split text into overlapping character windows.
///
/// Windows target `chunk_size` characters and overlap by `chunk_overlap`,
/// preferring to break at the last whitespace inside the trailing overlap
/// region. The split is a pure function of its inputs: re-processing the
/// same raw document always yields the same boundaries.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len == 0 {
        return Vec::new();
    }
    if len <= chunk_size {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let hard_end = (start + chunk_size).min(len);
        let mut end = hard_end;
        if hard_end < len {
            let floor = hard_end.saturating_sub(chunk_overlap).max(start + 1);
            if let Some(pos) = (floor..hard_end).rev().find(|&i| chars[i].is_whitespace()) {
                end = pos + 1;
            }
        }

        let window: String = chars[start..end].iter().collect();
        let trimmed = window.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= len {
            break;
        }
        let next = end.saturating_sub(chunk_overlap);
        start = if next > start { next } else { end };
    }
    chunks
}
