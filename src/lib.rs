//! # Transcript Retrieval
//!
//! Turns sales-call transcripts into independently retrievable, scored
//! passages for grounding chat-assistant answers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  Ingest    │──▶│   Indexer    │──▶│     SQLite       │
//! │  (chunker) │   │ extract+embed│   │ chunks/FTS5/vecs │
//! └────────────┘   └──────┬───────┘   └────────┬─────────┘
//!                         │ reclaim            │
//!                   ┌─────┴─────┐        ┌─────┴─────┐
//!                   │ Watchdog  │        │ Retriever │◀── CLI / HTTP
//!                   └───────────┘        └───────────┘
//! ```
//!
//! The pure logic (models, chunker, status machine, scoring, the `Store`
//! trait) lives in `transcript_retrieval_core`. This crate adds SQLite,
//! remote service clients, the worker pool, and the CLI and HTTP surfaces.
//!
//! ## Quick Start
//!
//! ```bash
//! trx init
//! trx ingest call.txt --id call-42
//! trx index
//! trx search "pricing objections" --transcript call-42
//! trx serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `Store` implementation |
//! | [`embedding`] | Embedding provider clients |
//! | [`extract`] | Extraction service clients |
//! | [`ingest`] | Transcript ingestion |
//! | [`indexer`] | Indexing worker pool |
//! | [`watchdog`] | Stale-claim recovery |
//! | [`search`] | Retrieval entry points |
//! | [`stats`] | Operator status and requeue |
//! | [`server`] | HTTP server |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod indexer;
pub mod ingest;
pub mod migrate;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod watchdog;

pub use transcript_retrieval_core as core;
