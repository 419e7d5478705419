//! Chat ingestor: export directories and the live chat read API.
//!
//! Raw messages are grouped into conversation threads before storage, one
//! stored unit per thread. Author ids are resolved to display names when the
//! export's user roster is available.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ChatConfig;
use crate::error::PipelineError;
use crate::models::{BatchId, DocumentId, DocumentMetadata, IngestionRecord, SourceType};
use crate::source::{selector_mismatch, IngestOptions, SourceIngestor, SourceSelector};
use crate::store::RawStore;

/// Read client for the chat platform API.
pub struct ChatApiClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl ChatApiClient {
    pub fn new(api_base: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, PipelineError> {
        let url = format!("{}/{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| PipelineError::source_unavailable(format!("chat API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::source_unavailable(format!(
                "chat API returned {} for {}",
                status, path
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| PipelineError::source_unavailable(format!("chat API: {}", e)))
    }

    /// Channel metadata; used to resolve the human-readable channel name.
    pub async fn channel_info(&self, channel_id: &str) -> Result<Value, PipelineError> {
        let body = self
            .get("conversations.info", &[("channel", channel_id.to_string())])
            .await?;
        body.get("channel")
            .cloned()
            .ok_or_else(|| PipelineError::source_unavailable("chat API: no channel in response"))
    }

    /// Channel history no older than `oldest` (unix seconds), newest-first.
    pub async fn history(
        &self,
        channel_id: &str,
        oldest: i64,
        limit: usize,
    ) -> Result<Vec<Value>, PipelineError> {
        let body = self
            .get(
                "conversations.history",
                &[
                    ("channel", channel_id.to_string()),
                    ("oldest", oldest.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(body
            .get("messages")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

pub struct ChatIngestor {
    store: Arc<RawStore>,
    client: Option<ChatApiClient>,
    days_history: i64,
    message_limit: usize,
}

impl ChatIngestor {
    /// The API client is only built when `[chat]` is configured and the bot
    /// token environment variable is set; export ingestion works without it.
    pub fn new(store: Arc<RawStore>, config: Option<&ChatConfig>) -> Self {
        let client = config.and_then(|cfg| {
            std::env::var(&cfg.token_env)
                .ok()
                .map(|token| ChatApiClient::new(&cfg.api_base, &token))
        });
        Self {
            store,
            client,
            days_history: config.map_or(30, |c| c.days_history),
            message_limit: config.map_or(1000, |c| c.message_limit),
        }
    }

    fn run_export(
        &self,
        record: &mut IngestionRecord,
        export_dir: &Path,
    ) -> Result<(), PipelineError> {
        let channels = load_json_array(&export_dir.join("channels.json")).map_err(|e| {
            PipelineError::source_unavailable(format!(
                "not a chat export directory ({}): {}",
                export_dir.display(),
                e
            ))
        })?;
        let users = load_users(export_dir);
        info!(
            channels = channels.len(),
            users = users.len(),
            "loaded chat export roster"
        );

        let batch = self.store.create_batch(SourceType::Chat, "chat_export")?;

        for channel in &channels {
            let channel_name = channel
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            let channel_id = channel
                .get("id")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");

            match self.process_channel_export(export_dir, channel_name, channel_id, &users, &batch)
            {
                Ok((stored, failed)) => {
                    record.documents_ingested += stored;
                    record.documents_failed += failed;
                    record.source_identifiers.push(channel_name.to_string());
                }
                Err(err) => {
                    warn!(channel = channel_name, %err, "failed to process channel export");
                    record.documents_failed += 1;
                }
            }
        }
        Ok(())
    }

    fn process_channel_export(
        &self,
        export_dir: &Path,
        channel_name: &str,
        channel_id: &str,
        users: &HashMap<String, String>,
        batch: &BatchId,
    ) -> Result<(u64, u64), PipelineError> {
        let channel_dir = export_dir.join(channel_name);
        if !channel_dir.is_dir() {
            warn!(channel = channel_name, "channel directory not found in export");
            return Ok((0, 0));
        }

        let mut day_files: Vec<_> = std::fs::read_dir(&channel_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |e| e == "json"))
            .collect();
        day_files.sort();

        let mut messages = Vec::new();
        for file in &day_files {
            messages.extend(load_json_array(file)?);
        }
        if messages.is_empty() {
            warn!(channel = channel_name, "no messages found in export");
            return Ok((0, 0));
        }

        let threads = group_messages_by_thread(&messages);
        let mut stored = 0u64;
        let mut failed = 0u64;
        for (thread_ts, thread_messages) in threads {
            match self.store_thread(batch, thread_messages, channel_id, channel_name, Some(users)) {
                Ok(()) => stored += 1,
                Err(err) => {
                    warn!(thread = %thread_ts, %err, "failed to store thread");
                    failed += 1;
                }
            }
        }
        info!(channel = channel_name, threads = stored, "stored channel export");
        Ok((stored, failed))
    }

    async fn run_channel(
        &self,
        record: &mut IngestionRecord,
        channel_id: &str,
        options: &IngestOptions,
    ) -> Result<(), PipelineError> {
        let client = self.client.as_ref().ok_or_else(|| {
            PipelineError::source_unavailable(
                "chat API not configured; set [chat] in the config and export the bot token",
            )
        })?;

        let info = client.channel_info(channel_id).await?;
        let channel_name = info
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or(channel_id)
            .to_string();
        record.source_identifiers.push(channel_id.to_string());

        let days = options.days_history.unwrap_or(self.days_history);
        let oldest = Utc::now().timestamp() - days * 86400;
        let limit = options.limit.unwrap_or(self.message_limit);
        let messages = client.history(channel_id, oldest, limit).await?;
        info!(
            channel = %channel_name,
            messages = messages.len(),
            "retrieved channel history"
        );

        let batch = self.store.create_batch(SourceType::Chat, &channel_name)?;
        for (thread_ts, thread_messages) in group_messages_by_thread(&messages) {
            match self.store_thread(&batch, thread_messages, channel_id, &channel_name, None) {
                Ok(()) => record.documents_ingested += 1,
                Err(err) => {
                    warn!(thread = %thread_ts, %err, "failed to store thread");
                    record.documents_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Store one conversation thread as a raw unit.
    fn store_thread(
        &self,
        batch: &BatchId,
        mut messages: Vec<Value>,
        channel_id: &str,
        channel_name: &str,
        users: Option<&HashMap<String, String>>,
    ) -> Result<(), PipelineError> {
        messages.sort_by(|a, b| {
            message_ts(a)
                .partial_cmp(&message_ts(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let first = messages
            .first()
            .ok_or_else(|| PipelineError::storage("empty thread"))?;
        let thread_ts = thread_key(first);

        let mut participants = BTreeSet::new();
        let mut rendered = Vec::with_capacity(messages.len());
        for msg in &messages {
            let author_id = msg.get("user").and_then(|u| u.as_str()).unwrap_or("unknown");
            let author = users
                .and_then(|u| u.get(author_id))
                .map(String::as_str)
                .unwrap_or(author_id);
            participants.insert(author.to_string());

            let ts = message_ts(msg);
            let timestamp = DateTime::<Utc>::from_timestamp(ts as i64, 0)
                .unwrap_or_else(Utc::now)
                .to_rfc3339();
            rendered.push(serde_json::json!({
                "author_id": author_id,
                "author": author,
                "text": msg.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                "timestamp": timestamp,
                "ts": msg.get("ts").cloned().unwrap_or(Value::Null),
            }));
        }

        let participants: Vec<String> = participants.into_iter().collect();
        let conversation = serde_json::json!({
            "thread_ts": thread_ts.clone(),
            "channel_id": channel_id,
            "channel_name": channel_name,
            "message_count": messages.len(),
            "participants": participants.clone(),
            "messages": rendered,
        });

        let mut metadata = DocumentMetadata::new(
            SourceType::Chat,
            thread_ts.clone(),
            format!("#{}", channel_name),
        );
        metadata.source_timestamp = DateTime::<Utc>::from_timestamp(message_ts(first) as i64, 0);
        metadata
            .extra
            .insert("channel_id".to_string(), serde_json::json!(channel_id));
        metadata
            .extra
            .insert("channel_name".to_string(), serde_json::json!(channel_name));
        metadata
            .extra
            .insert("participants".to_string(), serde_json::json!(participants));
        metadata.extra.insert(
            "message_count".to_string(),
            serde_json::json!(messages.len()),
        );

        let document_id = DocumentId::new(&format!("thread_{}", thread_ts))?;
        self.store
            .store_document(batch, &document_id, &conversation, &metadata)?;
        Ok(())
    }
}

#[async_trait]
impl SourceIngestor for ChatIngestor {
    fn source_type(&self) -> SourceType {
        SourceType::Chat
    }

    fn describe(&self) -> &str {
        "chat threads from an export directory or the chat read API"
    }

    async fn ingest(
        &self,
        selector: SourceSelector,
        options: &IngestOptions,
    ) -> Result<IngestionRecord, PipelineError> {
        let scope = match &selector {
            SourceSelector::ChatExport { .. } => "export".to_string(),
            SourceSelector::ChatChannel { id } => id.clone(),
            other => return Err(selector_mismatch(SourceType::Chat, other)),
        };

        let mut record = IngestionRecord::begin(SourceType::Chat, &scope);
        let outcome = match selector {
            SourceSelector::ChatExport { path } => self.run_export(&mut record, &path),
            SourceSelector::ChatChannel { id } => {
                self.run_channel(&mut record, &id, options).await
            }
            _ => unreachable!(),
        };

        match outcome {
            Ok(()) => record.complete(),
            Err(err) => {
                warn!(%err, "chat ingestion failed");
                record.fail(&err);
            }
        }
        self.store.log_ingestion(&record)?;
        Ok(record)
    }
}

/// Group messages into conversation threads by `thread_ts`, falling back to
/// the message's own `ts` for top-level messages.
fn group_messages_by_thread(messages: &[Value]) -> BTreeMap<String, Vec<Value>> {
    let mut threads: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for msg in messages {
        threads
            .entry(thread_key(msg))
            .or_default()
            .push(msg.clone());
    }
    threads
}

fn thread_key(msg: &Value) -> String {
    msg.get("thread_ts")
        .or_else(|| msg.get("ts"))
        .and_then(|v| v.as_str())
        .unwrap_or("0")
        .to_string()
}

fn message_ts(msg: &Value) -> f64 {
    msg.get("ts")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn load_json_array(path: &Path) -> Result<Vec<Value>, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    value
        .as_array()
        .cloned()
        .ok_or_else(|| PipelineError::storage(format!("expected a JSON array in {}", path.display())))
}

fn load_users(export_dir: &Path) -> HashMap<String, String> {
    let Ok(users) = load_json_array(&export_dir.join("users.json")) else {
        return HashMap::new();
    };
    users
        .iter()
        .filter_map(|u| {
            let id = u.get("id")?.as_str()?;
            let name = u.get("name")?.as_str()?;
            Some((id.to_string(), name.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::models::IngestionStatus;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> Arc<RawStore> {
        let storage = StorageConfig {
            data_dir: tmp.path().join("data"),
        };
        Arc::new(RawStore::open(&storage).unwrap())
    }

    fn write_export(tmp: &TempDir) -> std::path::PathBuf {
        let export = tmp.path().join("export");
        std::fs::create_dir_all(export.join("eng")).unwrap();
        std::fs::create_dir_all(export.join("broken")).unwrap();

        std::fs::write(
            export.join("channels.json"),
            r#"[{"id": "C1", "name": "eng"}, {"id": "C2", "name": "broken"}]"#,
        )
        .unwrap();
        std::fs::write(
            export.join("users.json"),
            r#"[{"id": "U1", "name": "dana"}, {"id": "U2", "name": "amir"}]"#,
        )
        .unwrap();
        std::fs::write(
            export.join("eng").join("2024-01-01.json"),
            r#"[
                {"user": "U1", "ts": "1704100000.0001", "text": "deploy is failing"},
                {"user": "U2", "ts": "1704100060.0002", "thread_ts": "1704100000.0001", "text": "looking"},
                {"user": "U2", "ts": "1704200000.0001", "text": "lunch?"}
            ]"#,
        )
        .unwrap();
        std::fs::write(export.join("broken").join("2024-01-01.json"), "not json").unwrap();
        export
    }

    #[test]
    fn messages_group_into_threads() {
        let messages = vec![
            serde_json::json!({"ts": "1.0", "text": "root"}),
            serde_json::json!({"ts": "2.0", "thread_ts": "1.0", "text": "reply"}),
            serde_json::json!({"ts": "3.0", "text": "other"}),
        ];
        let threads = group_messages_by_thread(&messages);
        assert_eq!(threads.len(), 2);
        assert_eq!(threads.get("1.0").unwrap().len(), 2);
        assert_eq!(threads.get("3.0").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn export_ingestion_counts_threads_and_channel_failures() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let export = write_export(&tmp);

        let ingestor = ChatIngestor::new(Arc::clone(&store), None);
        let record = ingestor
            .ingest(
                SourceSelector::ChatExport { path: export },
                &IngestOptions::default(),
            )
            .await
            .unwrap();

        // Two threads from #eng, one failure for the unparseable channel.
        assert_eq!(record.documents_ingested, 2);
        assert_eq!(record.documents_failed, 1);
        assert_eq!(record.status, IngestionStatus::Completed);
        assert!(record.source_identifiers.contains(&"eng".to_string()));

        let batches = store.list_batches(SourceType::Chat).unwrap();
        assert_eq!(batches.len(), 1);
        let docs = store.load_documents(&batches[0].batch_id).unwrap();
        assert_eq!(docs.len(), 2);

        // Author ids resolved through the roster; participants sorted.
        let thread = docs
            .iter()
            .find(|d| d.metadata.source_id == "1704100000.0001")
            .unwrap();
        assert_eq!(
            thread.metadata.extra.get("participants"),
            Some(&serde_json::json!(["amir", "dana"]))
        );
        assert_eq!(thread.metadata.source_name, "#eng");

        // The audit record was persisted exactly once.
        let history = store.get_ingestion_history(Some(SourceType::Chat)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], record);
    }

    #[tokio::test]
    async fn unreachable_export_yields_failed_record_with_zero_documents() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let ingestor = ChatIngestor::new(Arc::clone(&store), None);
        let record = ingestor
            .ingest(
                SourceSelector::ChatExport {
                    path: tmp.path().join("missing"),
                },
                &IngestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(record.status, IngestionStatus::Failed);
        assert_eq!(record.documents_ingested, 0);
        assert!(record.error_message.is_some());
        // Even a failed run leaves an audit entry.
        assert_eq!(store.get_ingestion_history(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn channel_mode_without_api_client_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let ingestor = ChatIngestor::new(Arc::clone(&store), None);
        let record = ingestor
            .ingest(
                SourceSelector::ChatChannel {
                    id: "C123".to_string(),
                },
                &IngestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(record.status, IngestionStatus::Failed);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("chat API not configured"));
    }

    #[tokio::test]
    async fn upload_selector_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let ingestor = ChatIngestor::new(store, None);

        let err = ingestor
            .ingest(
                SourceSelector::FilePath {
                    path: "x.txt".into(),
                },
                &IngestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }
}
