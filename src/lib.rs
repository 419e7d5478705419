//! # Harbor
//!
//! An append-only knowledge ingestion and vector indexing pipeline.
//!
//! Harbor pulls heterogeneous knowledge sources (chat threads, wiki pages,
//! uploaded files) into an immutable raw store, processes them into
//! uniformly chunked, metadata-rich units, and maintains a searchable vector
//! index derived from those units. Raw data is the source of truth: the
//! index can always be discarded and rebuilt from it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌────────────┐   ┌─────────────┐
//! │  Ingestors    │──▶│ RawStore  │──▶│ Processor  │──▶│ VectorIndex │
//! │ chat/wiki/up  │   │ immutable │   │ chunk+meta │   │ embed+search│
//! └──────────────┘   └───────────┘   └────────────┘   └─────────────┘
//!         ▲                                                  ▲
//!         └──────────────── Orchestrator ────────────────────┘
//!                               ▲
//!                             CLI
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harbor init                           # create the data layout
//! harbor ingest upload notes.md         # store a file immutably
//! harbor ingest chat-export ./export    # store chat threads
//! harbor index init                     # build the vector index
//! harbor search "deploy runbook"        # query it
//! harbor history                        # audit what was ingested
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and identities |
//! | [`store`] | Immutable raw store and audit log |
//! | [`source`] | Ingestor contract (selector + options) |
//! | [`source_chat`] | Chat export / chat API ingestor |
//! | [`source_wiki`] | Wiki space / page ingestor |
//! | [`source_upload`] | File upload ingestor |
//! | [`extract`] | PDF/DOCX text extraction |
//! | [`process`] | Batch-to-chunk processing |
//! | [`embedding`] | Embedding backend clients |
//! | [`index`] | Vector index lifecycle and search |
//! | [`orchestrator`] | Facade tying it all together |

pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod source;
pub mod source_chat;
pub mod source_upload;
pub mod source_wiki;
pub mod store;
