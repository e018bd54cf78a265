//! Core data models for transcripts, chunks, and derived signals.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::lexical::LexicalEntry;
use crate::status::ExtractionStatus;
use crate::vocab::{EntityType, QualificationTag, Topic};

/// Current time as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SHA-256 of a text, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id: the same transcript and index always map to the
/// same UUID, so re-chunking after a failure does not mint new rows.
pub fn chunk_id_for(transcript_id: &str, chunk_index: i64) -> String {
    let name = format!("{}:{}", transcript_id, chunk_index);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Status of the external call-analysis pipeline. Stored and reported but
/// never advanced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Transcribing,
    Transcribed,
    Processing,
    Completed,
    Error,
    Skipped,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Transcribing => "transcribing",
            AnalysisStatus::Transcribed => "transcribed",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "transcribing" => Ok(AnalysisStatus::Transcribing),
            "transcribed" => Ok(AnalysisStatus::Transcribed),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "error" => Ok(AnalysisStatus::Error),
            "skipped" => Ok(AnalysisStatus::Skipped),
            other => anyhow::bail!("unknown analysis_status: {}", other),
        }
    }
}

/// A call transcript and its indexing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    pub title: Option<String>,
    pub rep_id: Option<String>,
    pub team_id: Option<String>,
    pub raw_text: String,
    pub text_hash: String,
    pub analysis_status: AnalysisStatus,
    /// Status of the indexing job; the set of `pending` transcripts is the
    /// work queue.
    pub index_status: ExtractionStatus,
    pub index_attempts: u32,
    pub index_updated_at: i64,
    /// Status before the last watchdog reclaim of the indexing job.
    pub index_previous_status: Option<ExtractionStatus>,
    pub index_stuck_ms: Option<i64>,
    pub index_reclaim_count: u32,
    /// Token of the worker holding the indexing job while `processing`.
    #[serde(skip)]
    pub index_claim_token: Option<String>,
    /// Most recent activity on the call, used as a retrieval tie-break.
    pub last_activity_at: i64,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl Transcript {
    pub fn new(id: impl Into<String>, raw_text: impl Into<String>, now: i64) -> Self {
        let raw_text = raw_text.into();
        Self {
            id: id.into(),
            title: None,
            rep_id: None,
            team_id: None,
            text_hash: hash_text(&raw_text),
            raw_text,
            analysis_status: AnalysisStatus::Transcribed,
            index_status: ExtractionStatus::Pending,
            index_attempts: 0,
            index_updated_at: now,
            index_previous_status: None,
            index_stuck_ms: None,
            index_reclaim_count: 0,
            index_claim_token: None,
            last_activity_at: now,
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A named entity found in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityMention {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub value: String,
    pub mention_count: u32,
}

impl EntityMention {
    pub fn new(entity_type: EntityType, value: impl Into<String>, mention_count: u32) -> Self {
        Self {
            entity_type,
            value: value.into(),
            mention_count,
        }
    }
}

/// Bookkeeping carried alongside a chunk's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Failed attempts since the last requeue.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: i64,
    pub claimed_at: Option<i64>,
    /// Token of the worker holding the chunk while `processing`.
    #[serde(skip)]
    pub claim_token: Option<String>,
    pub completed_at: Option<i64>,
    /// Status before the last watchdog reclaim.
    pub previous_status: Option<ExtractionStatus>,
    /// How long the last reclaimed claim had been stuck.
    pub stuck_ms: Option<i64>,
    pub reclaim_count: u32,
}

/// A retrievable passage of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub transcript_id: String,
    /// Zero-based, contiguous within a transcript.
    pub chunk_index: i64,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip)]
    pub lexical: Option<LexicalEntry>,
    pub entities: Vec<EntityMention>,
    pub topics: BTreeSet<Topic>,
    pub qualification_tags: BTreeSet<QualificationTag>,
    pub extraction_status: ExtractionStatus,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// A fresh `pending` chunk with no derived signals.
    pub fn pending(
        transcript_id: &str,
        chunk_index: i64,
        text: &str,
        start_offset: usize,
        end_offset: usize,
        now: i64,
    ) -> Self {
        Self {
            id: chunk_id_for(transcript_id, chunk_index),
            transcript_id: transcript_id.to_string(),
            chunk_index,
            text: text.to_string(),
            start_offset,
            end_offset,
            hash: hash_text(text),
            embedding: None,
            lexical: None,
            entities: Vec::new(),
            topics: BTreeSet::new(),
            qualification_tags: BTreeSet::new(),
            extraction_status: ExtractionStatus::Pending,
            metadata: ChunkMetadata {
                updated_at: now,
                ..ChunkMetadata::default()
            },
        }
    }
}

/// Everything a completed chunk carries, persisted in one atomic update.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSignals {
    pub entities: Vec<EntityMention>,
    pub topics: BTreeSet<Topic>,
    pub qualification_tags: BTreeSet<QualificationTag>,
    pub embedding: Vec<f32>,
    pub lexical: LexicalEntry,
}
