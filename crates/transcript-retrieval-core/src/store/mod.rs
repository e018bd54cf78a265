//! Storage abstraction for the retrieval engine.
//!
//! The [`Store`] trait defines every storage operation the indexer, the
//! watchdog, the operator commands, and the retriever need, so the same
//! pipeline runs against SQLite or the in-memory backend.
//!
//! All status updates are compare-and-set on the expected prior status:
//! a method returns `Ok(false)` when the row was not in the expected state
//! (another writer won), and `Err` when the requested edge is not in the
//! `extraction_status` table at all.
//!
//! Claims additionally mint a [`Claim`] token. Every write that extends or
//! settles a claim must present it, so a worker whose row was reclaimed or
//! replaced by a re-ingest can never write over the new owner's row, even
//! though chunk ids are stable across re-ingests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Chunk, DerivedSignals, Transcript};
use crate::status::{ExtractionStatus, Transition};
use crate::vocab::{QualificationTag, TagFilter, Topic};

/// Scope and hard filters for fetching retrieval candidates.
#[derive(Debug, Clone)]
pub struct CandidateQuery<'a> {
    pub transcript_ids: &'a [String],
    /// Free-text query for the lexical ranking function.
    pub text: &'a str,
    pub embedding: Option<&'a [f32]>,
    pub topics: &'a TagFilter<Topic>,
    pub qualification_tags: &'a TagFilter<QualificationTag>,
}

/// A completed, in-scope chunk with its raw signals.
///
/// Raw scores are backend-specific; the retriever normalizes them.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk: Chunk,
    /// Activity timestamp of the owning transcript.
    pub last_activity_at: i64,
    /// Cosine similarity in `[-1, 1]`, `None` without a query embedding.
    pub vector_similarity: Option<f64>,
    /// Non-negative lexical relevance (higher is better).
    pub lexical_score: f64,
}

/// Ownership of a `processing` transcript job or chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Transcript id for a job claim, chunk id for a chunk claim.
    pub id: String,
    pub token: String,
}

impl Claim {
    /// A claim on `id` with a fresh random token.
    pub fn mint(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// Whether a reclaimed claim was a transcript job or a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Transcript,
    Chunk,
}

/// A stale claim the watchdog released back to `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedClaim {
    pub kind: ClaimKind,
    pub id: String,
    pub transcript_id: String,
    pub previous_status: ExtractionStatus,
    pub stuck_ms: i64,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ExtractionStatus, n: u64) {
        match status {
            ExtractionStatus::Pending => self.pending += n,
            ExtractionStatus::Processing => self.processing += n,
            ExtractionStatus::Completed => self.completed += n,
            ExtractionStatus::Failed => self.failed += n,
        }
    }

    pub fn get(&self, status: ExtractionStatus) -> u64 {
        match status {
            ExtractionStatus::Pending => self.pending,
            ExtractionStatus::Processing => self.processing,
            ExtractionStatus::Completed => self.completed,
            ExtractionStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// A failed chunk as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChunk {
    pub chunk_id: String,
    pub transcript_id: String,
    pub chunk_index: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

/// Indexing status readout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub transcripts: StatusCounts,
    pub chunks: StatusCounts,
    pub failed: Vec<FailedChunk>,
}

/// What an operator requeue touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequeueCounts {
    pub transcripts: u64,
    pub chunks: u64,
}

/// Validate an unclaimed chunk status update.
///
/// `claim` must mint a token ([`Store::claim_chunk`]) and `complete` must
/// carry the derived signals ([`Store::complete_chunk`]).
pub fn check_transition(from: ExtractionStatus, to: ExtractionStatus) -> Result<Transition> {
    let transition = from.transition_to(to)?;
    match transition {
        Transition::Claim => bail!("pending -> processing must mint a claim token (claim_chunk)"),
        Transition::Complete => {
            bail!("processing -> completed requires the derived signals (complete_chunk)")
        }
        _ => Ok(transition),
    }
}

/// Validate how a claimed transcript job is settled.
pub fn check_settlement(to: ExtractionStatus) -> Result<Transition> {
    Ok(ExtractionStatus::Processing.transition_to(to)?)
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_transcript`](Store::upsert_transcript) | Insert or replace a transcript row |
/// | [`replace_chunks`](Store::replace_chunks) | Replace all chunks of a transcript |
/// | [`save_transcript`](Store::save_transcript) | Both of the above in one write |
/// | [`claim_next_transcript`](Store::claim_next_transcript) | Claim the oldest pending job |
/// | [`settle_transcript`](Store::settle_transcript) | Release or finish a claimed job |
/// | [`claim_chunk`](Store::claim_chunk) | Claim one pending chunk |
/// | [`transition_chunk`](Store::transition_chunk) | CAS an unclaimed chunk status |
/// | [`record_attempt`](Store::record_attempt) | Count a transient failure |
/// | [`complete_chunk`](Store::complete_chunk) | Persist signals and flip to `completed` |
/// | [`fail_chunk`](Store::fail_chunk) | Flip to `failed` with the error |
/// | [`requeue_failed`](Store::requeue_failed) | Operator `failed -> pending` |
/// | [`reclaim_stale`](Store::reclaim_stale) | Watchdog `processing -> pending` |
/// | [`candidates`](Store::candidates) | Filtered retrieval candidates |
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_transcript(&self, transcript: &Transcript) -> Result<()>;

    async fn get_transcript(&self, id: &str) -> Result<Option<Transcript>>;

    /// Mark a transcript deleted. Returns `false` if it does not exist or
    /// is already deleted.
    async fn soft_delete_transcript(&self, id: &str, now: i64) -> Result<bool>;

    /// Replace all chunks (and their derived signals) of a transcript.
    async fn replace_chunks(&self, transcript_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Upsert a transcript and replace its chunks atomically, so a worker
    /// can never claim the job between the two writes.
    async fn save_transcript(&self, transcript: &Transcript, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a transcript ordered by `chunk_index`.
    async fn list_chunks(&self, transcript_id: &str) -> Result<Vec<Chunk>>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    /// Claim the oldest non-deleted `pending` transcript job.
    async fn claim_next_transcript(&self, now: i64) -> Result<Option<Claim>>;

    /// Move a claimed job out of `processing` to `to` (`completed`,
    /// `failed`, or back to `pending`). Returns `false` if the claim is no
    /// longer held.
    async fn settle_transcript(&self, claim: &Claim, to: ExtractionStatus, now: i64)
        -> Result<bool>;

    /// `pending -> processing` on one chunk. Returns `None` if the chunk is
    /// not `pending`.
    async fn claim_chunk(&self, chunk_id: &str, now: i64) -> Result<Option<Claim>>;

    /// Compare-and-set a chunk status outside of a claim (operator and
    /// watchdog edges).
    async fn transition_chunk(
        &self,
        id: &str,
        from: ExtractionStatus,
        to: ExtractionStatus,
        now: i64,
    ) -> Result<bool>;

    /// Record a failed attempt on a claimed chunk that will be retried.
    /// Refreshes `updated_at`. Returns the new attempt count, or `None` if
    /// the claim is no longer held.
    async fn record_attempt(&self, claim: &Claim, error: &str, now: i64) -> Result<Option<u32>>;

    /// Persist every derived signal and flip `processing -> completed` in
    /// one atomic update, if the claim is still held.
    async fn complete_chunk(&self, claim: &Claim, signals: &DerivedSignals, now: i64)
        -> Result<bool>;

    /// Flip a claimed chunk `processing -> failed`, counting the final
    /// attempt and recording the error.
    async fn fail_chunk(&self, claim: &Claim, error: &str, now: i64) -> Result<bool>;

    /// Move failed chunks and failed transcript jobs back to `pending`,
    /// resetting their attempt counters.
    async fn requeue_failed(&self, transcript_id: Option<&str>, now: i64) -> Result<RequeueCounts>;

    /// Release every `processing` transcript job and chunk whose last
    /// update is strictly older than `cutoff`.
    async fn reclaim_stale(&self, cutoff: i64, now: i64) -> Result<Vec<ReclaimedClaim>>;

    async fn status_report(&self, transcript_id: Option<&str>) -> Result<StatusReport>;

    /// Completed chunks of non-deleted transcripts that pass the hard
    /// filters, with their raw vector and lexical signals.
    async fn candidates(&self, query: &CandidateQuery<'_>) -> Result<Vec<ChunkCandidate>>;
}
