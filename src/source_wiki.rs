//! Wiki ingestor: spaces and single pages over the wiki REST API.
//!
//! Pages arrive as storage-format markup; they are stored with both the raw
//! markup and a plain-text rendering that keeps the heading structure, one
//! unit per page.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::WikiConfig;
use crate::error::PipelineError;
use crate::models::{BatchId, DocumentId, DocumentMetadata, IngestionRecord, SourceType};
use crate::source::{selector_mismatch, IngestOptions, SourceIngestor, SourceSelector};
use crate::store::RawStore;

const PAGE_EXPAND: &str = "body.storage,version,space,ancestors";

/// Read client for the wiki platform REST API.
pub struct WikiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    token: String,
}

impl WikiClient {
    pub fn new(base_url: &str, username: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            token: token.to_string(),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, PipelineError> {
        let url = format!("{}/rest/api/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.token))
            .query(query)
            .send()
            .await
            .map_err(|e| PipelineError::source_unavailable(format!("wiki API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::source_unavailable(format!(
                "wiki API returned {} for {}",
                status, path
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| PipelineError::source_unavailable(format!("wiki API: {}", e)))
    }

    /// All current pages of a space, paging until `limit` is reached.
    pub async fn space_pages(&self, space_key: &str, limit: usize) -> Result<Vec<Value>, PipelineError> {
        let mut pages = Vec::new();
        let mut start = 0usize;
        let page_size = limit.min(100).max(1);

        loop {
            let body = self
                .get(
                    "content",
                    &[
                        ("spaceKey", space_key.to_string()),
                        ("type", "page".to_string()),
                        ("status", "current".to_string()),
                        ("expand", PAGE_EXPAND.to_string()),
                        ("start", start.to_string()),
                        ("limit", page_size.to_string()),
                    ],
                )
                .await?;

            let results = body
                .get("results")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            let fetched = results.len();
            pages.extend(results);

            if fetched < page_size || pages.len() >= limit {
                break;
            }
            start += fetched;
        }

        pages.truncate(limit);
        Ok(pages)
    }

    pub async fn page(&self, page_id: &str) -> Result<Value, PipelineError> {
        self.get(
            &format!("content/{}", page_id),
            &[("expand", PAGE_EXPAND.to_string())],
        )
        .await
    }
}

pub struct WikiIngestor {
    store: Arc<RawStore>,
    client: Option<WikiClient>,
    page_limit: usize,
    base_url: String,
}

impl WikiIngestor {
    pub fn new(store: Arc<RawStore>, config: Option<&WikiConfig>) -> Self {
        let client = config.and_then(|cfg| {
            std::env::var(&cfg.token_env)
                .ok()
                .map(|token| WikiClient::new(&cfg.base_url, &cfg.username, &token))
        });
        Self {
            store,
            client,
            page_limit: config.map_or(500, |c| c.page_limit),
            base_url: config.map_or(String::new(), |c| c.base_url.trim_end_matches('/').to_string()),
        }
    }

    fn client(&self) -> Result<&WikiClient, PipelineError> {
        self.client.as_ref().ok_or_else(|| {
            PipelineError::source_unavailable(
                "wiki API not configured; set [wiki] in the config and export the API token",
            )
        })
    }

    async fn run_space(
        &self,
        record: &mut IngestionRecord,
        space_key: &str,
        options: &IngestOptions,
    ) -> Result<(), PipelineError> {
        let limit = options.limit.unwrap_or(self.page_limit);
        let pages = self.client()?.space_pages(space_key, limit).await?;
        record.source_identifiers.push(space_key.to_string());
        info!(space = space_key, pages = pages.len(), "retrieved wiki space");

        let batch = self.store.create_batch(SourceType::Wiki, space_key)?;
        for page in &pages {
            match self.store_page(&batch, page, space_key) {
                Ok(()) => record.documents_ingested += 1,
                Err(err) => {
                    warn!(page = ?page.get("id"), %err, "failed to store wiki page");
                    record.documents_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn run_page(
        &self,
        record: &mut IngestionRecord,
        page_id: &str,
    ) -> Result<(), PipelineError> {
        let page = self.client()?.page(page_id).await?;
        record.source_identifiers.push(page_id.to_string());

        let space_key = page
            .pointer("/space/key")
            .and_then(|k| k.as_str())
            .unwrap_or("unknown")
            .to_string();
        let batch = self
            .store
            .create_batch(SourceType::Wiki, &format!("{}_page_{}", space_key, page_id))?;

        self.store_page(&batch, &page, &space_key)?;
        record.documents_ingested = 1;
        Ok(())
    }

    /// Store one wiki page as a raw unit.
    fn store_page(
        &self,
        batch: &BatchId,
        page: &Value,
        space_key: &str,
    ) -> Result<(), PipelineError> {
        let page_id = page
            .get("id")
            .map(json_as_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::storage("wiki page without id"))?;
        let title = page
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or("Untitled")
            .to_string();

        let markup = page
            .pointer("/body/storage/value")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        // Fall back to the raw markup when the rendering walker chokes.
        let text_content = html_to_text(&markup).unwrap_or_else(|| markup.clone());

        let version = page.get("version").cloned().unwrap_or(Value::Null);
        let version_number = version.get("number").and_then(|n| n.as_u64()).unwrap_or(1);
        let last_updated = version
            .get("when")
            .and_then(|w| w.as_str())
            .unwrap_or_default()
            .to_string();
        let author = version
            .pointer("/by/displayName")
            .and_then(|a| a.as_str())
            .unwrap_or("Unknown")
            .to_string();

        let hierarchy_path = build_hierarchy_path(page);
        let url = page
            .pointer("/_links/webui")
            .and_then(|l| l.as_str())
            .map(|webui| format!("{}/wiki{}", self.base_url, webui));

        let mut metadata = DocumentMetadata::new(SourceType::Wiki, page_id.clone(), title.clone());
        metadata.source_timestamp = DateTime::parse_from_rfc3339(&last_updated)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
        metadata.author = Some(author.clone());
        metadata.title = Some(title.clone());
        metadata.url = url.clone();
        metadata
            .extra
            .insert("space_key".to_string(), serde_json::json!(space_key));
        metadata
            .extra
            .insert("version".to_string(), serde_json::json!(version_number));
        metadata.extra.insert(
            "hierarchy_path".to_string(),
            serde_json::json!(hierarchy_path.clone()),
        );

        let page_data = serde_json::json!({
            "page_id": page_id.clone(),
            "title": title,
            "space_key": space_key,
            "markup": markup,
            "text_content": text_content,
            "version_number": version_number,
            "last_updated": last_updated,
            "author": author,
            "hierarchy_path": hierarchy_path,
            "url": url,
        });

        let document_id = DocumentId::new(&format!("page_{}", page_id))?;
        self.store
            .store_document(batch, &document_id, &page_data, &metadata)?;
        Ok(())
    }
}

#[async_trait]
impl SourceIngestor for WikiIngestor {
    fn source_type(&self) -> SourceType {
        SourceType::Wiki
    }

    fn describe(&self) -> &str {
        "wiki pages fetched per space or per page over the wiki REST API"
    }

    async fn ingest(
        &self,
        selector: SourceSelector,
        options: &IngestOptions,
    ) -> Result<IngestionRecord, PipelineError> {
        let scope = match &selector {
            SourceSelector::WikiSpace { key } => key.clone(),
            SourceSelector::WikiPage { id } => format!("page_{}", id),
            other => return Err(selector_mismatch(SourceType::Wiki, other)),
        };

        let mut record = IngestionRecord::begin(SourceType::Wiki, &scope);
        let outcome = match selector {
            SourceSelector::WikiSpace { key } => self.run_space(&mut record, &key, options).await,
            SourceSelector::WikiPage { id } => self.run_page(&mut record, &id).await,
            _ => unreachable!(),
        };

        match outcome {
            Ok(()) => record.complete(),
            Err(err) => {
                warn!(%err, "wiki ingestion failed");
                record.fail(&err);
            }
        }
        self.store.log_ingestion(&record)?;
        Ok(record)
    }
}

fn json_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `Engineering / Backend / API Documentation` from the page's ancestors.
fn build_hierarchy_path(page: &Value) -> String {
    let title = page.get("title").and_then(|t| t.as_str()).unwrap_or("");
    let ancestors = page
        .get("ancestors")
        .and_then(|a| a.as_array())
        .cloned()
        .unwrap_or_default();
    if ancestors.is_empty() {
        return title.to_string();
    }
    let mut parts: Vec<String> = ancestors
        .iter()
        .map(|a| {
            a.get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("Unknown")
                .to_string()
        })
        .collect();
    parts.push(title.to_string());
    parts.join(" / ")
}

/// Render storage-format markup to plain text, keeping heading structure as
/// `#`-prefixed lines. Returns `None` when the markup cannot be walked.
pub fn html_to_text(markup: &str) -> Option<String> {
    if markup.trim().is_empty() {
        return Some(String::new());
    }

    let mut reader = quick_xml::Reader::from_str(markup);
    reader.config_mut().check_end_names = false;

    let mut out = String::new();
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if let Some(depth) = heading_depth(name) {
                    ensure_paragraph_break(&mut out);
                    out.push_str(&"#".repeat(depth));
                    out.push(' ');
                } else if name == b"p" || name == b"div" || name == b"table" || name == b"tr" {
                    ensure_paragraph_break(&mut out);
                } else if name == b"li" {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                    out.push_str("- ");
                }
            }
            Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"br" {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if heading_depth(name).is_some()
                    || name == b"p"
                    || name == b"ul"
                    || name == b"ol"
                    || name == b"table"
                {
                    ensure_paragraph_break(&mut out);
                } else if name == b"li" || name == b"tr" {
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                } else if name == b"td" || name == b"th" {
                    out.push(' ');
                }
            }
            Ok(quick_xml::events::Event::Text(t)) => match t.unescape() {
                Ok(text) => out.push_str(&text),
                Err(_) => out.push_str(String::from_utf8_lossy(t.as_ref()).as_ref()),
            },
            Ok(quick_xml::events::Event::CData(c)) => {
                out.push_str(String::from_utf8_lossy(c.as_ref()).as_ref());
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    // Collapse runs of blank lines left by nested block elements.
    let mut cleaned = String::with_capacity(out.len());
    let mut blank_run = 0usize;
    for line in out.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            cleaned.push('\n');
        } else {
            blank_run = 0;
            cleaned.push_str(line);
            cleaned.push('\n');
        }
    }
    Some(cleaned.trim().to_string())
}

fn heading_depth(name: &[u8]) -> Option<usize> {
    match name {
        [b'h', level @ b'1'..=b'6'] => Some((level - b'0') as usize),
        _ => None,
    }
}

fn ensure_paragraph_break(out: &mut String) {
    if out.is_empty() {
        return;
    }
    while !out.ends_with("\n\n") {
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::models::IngestionStatus;
    use tempfile::TempDir;

    #[test]
    fn headings_and_paragraphs_survive_rendering() {
        let markup = "<h1>Runbook</h1><p>First step.</p><h2>Rollback</h2><p>Second step.</p>";
        let text = html_to_text(markup).unwrap();
        assert!(text.starts_with("# Runbook"));
        assert!(text.contains("\n## Rollback"));
        assert!(text.contains("First step."));
        assert!(text.contains("Second step."));
    }

    #[test]
    fn lists_become_dashed_lines() {
        let markup = "<p>Checklist:</p><ul><li>alerts</li><li>dashboards</li></ul>";
        let text = html_to_text(markup).unwrap();
        assert!(text.contains("- alerts"));
        assert!(text.contains("- dashboards"));
    }

    #[test]
    fn empty_markup_renders_empty() {
        assert_eq!(html_to_text("  ").unwrap(), "");
    }

    #[test]
    fn hierarchy_path_joins_ancestors() {
        let page = serde_json::json!({
            "title": "API Documentation",
            "ancestors": [{"title": "Engineering"}, {"title": "Backend"}],
        });
        assert_eq!(
            build_hierarchy_path(&page),
            "Engineering / Backend / API Documentation"
        );

        let orphan = serde_json::json!({"title": "Lonely"});
        assert_eq!(build_hierarchy_path(&orphan), "Lonely");
    }

    #[test]
    fn store_page_persists_markup_and_rendering() {
        let tmp = TempDir::new().unwrap();
        let storage = StorageConfig {
            data_dir: tmp.path().join("data"),
        };
        let store = Arc::new(RawStore::open(&storage).unwrap());
        let ingestor = WikiIngestor::new(Arc::clone(&store), None);

        let batch = store.create_batch(SourceType::Wiki, "ENG").unwrap();
        let page = serde_json::json!({
            "id": "42",
            "title": "Oncall runbook",
            "body": {"storage": {"value": "<h1>Oncall</h1><p>Page the secondary.</p>"}},
            "version": {"number": 7, "when": "2024-06-01T10:00:00+00:00",
                        "by": {"displayName": "Dana"}},
            "ancestors": [{"title": "Engineering"}],
            "_links": {"webui": "/spaces/ENG/pages/42"},
        });
        ingestor.store_page(&batch, &page, "ENG").unwrap();

        let docs = store.load_documents(&batch).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id.as_str(), "page_42");
        assert_eq!(docs[0].metadata.author.as_deref(), Some("Dana"));
        assert_eq!(
            docs[0].metadata.extra.get("hierarchy_path"),
            Some(&serde_json::json!("Engineering / Oncall runbook"))
        );
        let text = docs[0].content.get("text_content").unwrap().as_str().unwrap();
        assert!(text.starts_with("# Oncall"));
        assert!(docs[0].metadata.source_timestamp.is_some());
    }

    #[tokio::test]
    async fn space_mode_without_api_client_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let storage = StorageConfig {
            data_dir: tmp.path().join("data"),
        };
        let store = Arc::new(RawStore::open(&storage).unwrap());
        let ingestor = WikiIngestor::new(Arc::clone(&store), None);

        let record = ingestor
            .ingest(
                SourceSelector::WikiSpace {
                    key: "ENG".to_string(),
                },
                &IngestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(record.status, IngestionStatus::Failed);
        assert_eq!(record.documents_ingested, 0);
        assert_eq!(store.get_ingestion_history(None).unwrap().len(), 1);
    }
}
