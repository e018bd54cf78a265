//! Error taxonomy shared by the indexing pipeline and the retriever.

use thiserror::Error;

use crate::status::ExtractionStatus;

/// Failure reported by the embedding or extraction service.
///
/// The indexer retries [`ServiceError::Transient`] up to its attempt
/// budget and fails the chunk immediately on [`ServiceError::Permanent`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Network, timeout, rate limit, or service-unavailable failure.
    #[error("transient service error: {0}")]
    Transient(String),
    /// The service rejected the input outright (malformed or empty text).
    #[error("permanent service error: {0}")]
    Permanent(String),
}

impl ServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// An update tried to move a status along an edge the state machine does
/// not contain.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid extraction_status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: ExtractionStatus,
    pub to: ExtractionStatus,
}

/// Failure of a retrieval call.
///
/// An empty result set is not an error: a structurally valid query whose
/// filters exclude everything returns `Ok(vec![])`.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Caller-side contract violation (empty scope, non-positive
    /// `match_count`, negative weights).
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The storage layer failed while fetching candidates.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
