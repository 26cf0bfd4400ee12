//! Grove — a local-first knowledge graph with hybrid retrieval.
//!
//! The source of truth is a tree of append-only JSONL records on disk
//! (`nodes/<slug>/node.jsonl` + `meta.jsonl`); the derived artifact is a
//! rebuildable SQLite index supporting hybrid keyword+vector retrieval.
//! Users and LLM clients add atomic facts ("bullets") to named groups
//! ("nodes"); at query time Grove returns a ranked, deduplicated,
//! budgeted context block for LLM injection.
//!
//! # Architecture
//!
//! - **Records**: append-only JSONL logs, one directory per node; every
//!   mutation is a new line, replayed into a live view
//! - **Derived store**: SQLite with FTS5 for keyword search, plus
//!   backlinks, per-bullet embeddings, and budget counters — a pure
//!   projection, dropped and rebuilt on any schema change
//! - **Watcher**: the single writer; debounces file events into per-node
//!   reindex jobs
//! - **Vector server**: a separate process holding the embedding model
//!   and an in-memory cosine index
//! - **Ranker**: keyword + vector retrieval made comparable by quantile
//!   calibration, fused, session-adjusted, cross-encoder reranked
//!
//! # Modules
//!
//! - [`config`] — `grove.toml` loading and defaults
//! - [`store`] — the append-only record store
//! - [`db`] / [`index`] — the derived store and its projection
//! - [`embedding`] — local and remote embedding providers with a shared cache
//! - [`vector`] — the vector server, its client, and the in-memory index
//! - [`rank`] — calibration, hybrid ranking, sessions, rerank, formatting
//! - [`review`] — served-budget accounting
//! - [`watcher`] — the filesystem watcher / index writer
//! - [`tools`] / [`server`] — the MCP stdio surface

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod rank;
pub mod review;
pub mod server;
pub mod sources;
pub mod store;
pub mod tools;
pub mod vector;
pub mod watcher;
