//! # Transcript Retrieval Core
//!
//! Shared, I/O-free logic for the transcript chunk retrieval engine: data
//! models, closed tag vocabularies, the `extraction_status` state machine,
//! the boundary-aware chunker, lexical scoring, service traits for
//! embedding and extraction, the [`store::Store`] abstraction, and the
//! hybrid retriever.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The application
//! crate supplies the SQLite store, the remote service clients, the
//! indexer worker pool, and the watchdog.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod lexical;
pub mod models;
pub mod retrieve;
pub mod status;
pub mod store;
pub mod vocab;

pub use error::{RetrievalError, ServiceError, TransitionError};
pub use models::{Chunk, ChunkMetadata, EntityMention, Transcript};
pub use retrieve::{RetrievalQuery, RetrievalWeights, Retriever, ScoredChunk};
pub use status::ExtractionStatus;
