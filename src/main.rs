//! # Harbor CLI
//!
//! The `harbor` binary is the interface to the ingestion pipeline. It
//! provides commands for data-layout initialization, per-source ingestion,
//! vector index lifecycle management, search, and audit queries.
//!
//! ## Usage
//!
//! ```bash
//! harbor --config ./config/harbor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harbor init` | Create the data directory layout |
//! | `harbor ingest chat-export <dir>` | Ingest a chat export directory |
//! | `harbor ingest chat <channel>` | Ingest a channel over the chat API |
//! | `harbor ingest wiki-space <key>` | Ingest every page of a wiki space |
//! | `harbor ingest wiki-page <id>` | Ingest a single wiki page |
//! | `harbor ingest upload <files…>` | Ingest uploaded files |
//! | `harbor index init` | Build the vector index from all raw batches |
//! | `harbor index update <batch-ids…>` | Add new batches to the index |
//! | `harbor index rebuild` | Back up, discard, and re-derive the index |
//! | `harbor index info` | Show the index version record |
//! | `harbor search "<query>"` | Similarity search over indexed chunks |
//! | `harbor history` | Show the ingestion audit trail |
//! | `harbor batches <source>` | List raw batches for a source |

mod config;
mod embedding;
mod error;
mod extract;
mod index;
mod models;
mod orchestrator;
mod process;
mod source;
mod source_chat;
mod source_upload;
mod source_wiki;
mod store;

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::models::{BatchId, IngestionRecord, SourceType};
use crate::orchestrator::Orchestrator;

/// Harbor — an append-only knowledge ingestion and vector indexing pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harbor.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harbor",
    about = "Harbor — an append-only knowledge ingestion and vector indexing pipeline",
    version,
    long_about = "Harbor ingests heterogeneous knowledge sources (chat threads, wiki pages, \
    uploaded files) into an immutable raw store, chunks them with a standard metadata envelope, \
    and maintains a searchable vector index that can always be rebuilt from raw data."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harbor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directory layout.
    ///
    /// This command is idempotent; running it multiple times is safe.
    Init,

    /// Ingest data from one source into a new immutable batch.
    Ingest {
        #[command(subcommand)]
        source: IngestSource,
    },

    /// Manage the vector index lifecycle.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Similarity search over the indexed chunks.
    ///
    /// Embeds the query and prints the most similar chunks with their
    /// source attribution.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Show the ingestion audit trail, newest first.
    History {
        /// Filter by source type: chat, wiki, or upload.
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of records to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// List raw batches for a source type, newest first.
    Batches {
        /// Source type: chat, wiki, or upload.
        source: String,
    },
}

/// Per-source ingestion subcommands.
#[derive(Subcommand)]
enum IngestSource {
    /// Ingest a chat export directory (channels.json, users.json, per-channel days).
    ChatExport {
        /// Path to the unzipped export directory.
        path: PathBuf,
    },

    /// Ingest a channel's history over the chat API.
    ///
    /// Requires `[chat]` in the config and the bot token environment variable.
    Chat {
        /// Channel id.
        channel: String,

        /// Days of history to retrieve.
        #[arg(long)]
        days: Option<i64>,
    },

    /// Ingest every current page of a wiki space.
    ///
    /// Requires `[wiki]` in the config and the API token environment variable.
    WikiSpace {
        /// Space key (e.g. `ENG`).
        key: String,

        /// Maximum pages to retrieve.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ingest a single wiki page by id.
    WikiPage {
        /// Page id.
        id: String,
    },

    /// Ingest one or more uploaded files (txt, md, pdf, docx).
    Upload {
        /// File paths to ingest as one batch.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Principal to record as the uploader.
        #[arg(long)]
        uploaded_by: Option<String>,
    },
}

/// Index lifecycle subcommands.
#[derive(Subcommand)]
enum IndexAction {
    /// Build a fresh index from all raw batches.
    ///
    /// Fails if an index already exists unless `--force` is passed.
    Init {
        /// Replace an existing index without a backup.
        #[arg(long)]
        force: bool,
    },

    /// Incrementally add the given batches to the existing index.
    ///
    /// Never touches chunks already indexed. Adding the same batch twice
    /// duplicates its entries; check `index info` for what is indexed.
    Update {
        /// Batch ids to add (see `harbor batches <source>`).
        #[arg(required = true)]
        batch_ids: Vec<String>,
    },

    /// Discard and re-derive the index from raw data.
    ///
    /// A timestamped backup of the live index is taken first unless
    /// `--no-backup` is passed.
    Rebuild {
        /// Skip the backup step.
        #[arg(long)]
        no_backup: bool,
    },

    /// Show the index version record.
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let orchestrator = Orchestrator::new(&cfg)?;

    match cli.command {
        Commands::Init => {
            println!("Data store initialized at {}", cfg.storage.data_dir.display());
        }
        Commands::Ingest { source } => {
            let record = match source {
                IngestSource::ChatExport { path } => {
                    orchestrator.ingest_chat_export(path).await?
                }
                IngestSource::Chat { channel, days } => {
                    orchestrator.ingest_chat_channel(&channel, days).await?
                }
                IngestSource::WikiSpace { key, limit } => {
                    orchestrator.ingest_wiki_space(&key, limit).await?
                }
                IngestSource::WikiPage { id } => orchestrator.ingest_wiki_page(&id).await?,
                IngestSource::Upload { mut files, uploaded_by } => {
                    if files.len() == 1 {
                        orchestrator.ingest_file(files.remove(0), uploaded_by).await?
                    } else {
                        orchestrator.ingest_files(files, uploaded_by).await?
                    }
                }
            };
            print_record(&record);
        }
        Commands::Index { action } => match action {
            IndexAction::Init { force } => {
                let version = orchestrator.initialize_index(force).await?;
                println!("index init");
                print_version(&version);
            }
            IndexAction::Update { batch_ids } => {
                let ids = batch_ids
                    .iter()
                    .map(|raw| BatchId::parse(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                let version = orchestrator.update_index(&ids).await?;
                println!("index update");
                print_version(&version);
            }
            IndexAction::Rebuild { no_backup } => {
                let version = orchestrator.rebuild_index(!no_backup).await?;
                println!("index rebuild");
                print_version(&version);
            }
            IndexAction::Info => match orchestrator.index_info()? {
                Some(version) => {
                    println!("index info");
                    print_version(&version);
                }
                None => println!("No index found. Run `harbor index init` first."),
            },
        },
        Commands::Search { query, limit } => {
            let results = orchestrator.search(&query, limit).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (rank, result) in results.iter().enumerate() {
                let source = result
                    .chunk
                    .metadata
                    .get("source")
                    .and_then(|s| s.as_str())
                    .unwrap_or("unknown");
                let snippet: String = result.chunk.text.chars().take(200).collect();
                println!("{}. [{:.3}] {}", rank + 1, result.score, source);
                println!("   {}", snippet.replace('\n', " "));
            }
        }
        Commands::History { source, limit } => {
            let source_type = source.as_deref().map(SourceType::from_str).transpose()?;
            let records = orchestrator.ingestion_history(source_type)?;
            if records.is_empty() {
                println!("No ingestion history.");
            }
            for record in records.iter().take(limit) {
                println!(
                    "{}  {}  ingested={} failed={}  {}",
                    record.started_at.format("%Y-%m-%d %H:%M:%S"),
                    record.status,
                    record.documents_ingested,
                    record.documents_failed,
                    record.ingestion_id,
                );
            }
        }
        Commands::Batches { source } => {
            let source_type = SourceType::from_str(&source)?;
            let batches = orchestrator.batches(source_type)?;
            if batches.is_empty() {
                println!("No batches for source '{}'.", source_type);
            }
            for batch in &batches {
                println!(
                    "{}  documents={}  {}",
                    batch.created_at.format("%Y-%m-%d %H:%M:%S"),
                    batch.document_count,
                    batch.batch_id,
                );
            }
        }
    }

    Ok(())
}

fn print_record(record: &IngestionRecord) {
    println!("ingest {}", record.source_type);
    println!("  ingestion id: {}", record.ingestion_id);
    println!("  status: {}", record.status);
    println!("  documents ingested: {}", record.documents_ingested);
    println!("  documents failed: {}", record.documents_failed);
    if record.bytes_processed > 0 {
        println!("  bytes processed: {}", record.bytes_processed);
    }
    if let Some(error) = &record.error_message {
        println!("  error: {}", error);
    }
}

fn print_version(version: &crate::models::IndexVersionRecord) {
    println!("  embedding model: {}", version.embedding_model);
    println!("  document count: {}", version.document_count);
    println!("  last updated: {}", version.last_updated.to_rfc3339());
    println!("  operation: {}", version.operation);
    println!("  batches indexed: {}", version.batches.len());
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
