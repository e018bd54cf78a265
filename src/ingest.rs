//! Transcript ingestion.
//!
//! Chunks a transcript and persists it together with fresh `pending` chunk
//! rows, which puts the transcript on the durable work queue (the set of
//! `pending` transcripts). Re-ingesting unchanged text is a no-op, and a
//! soft-deleted transcript stays deleted when its text is replaced.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use uuid::Uuid;

use transcript_retrieval_core::chunk::{chunk_transcript, ChunkingConfig};
use transcript_retrieval_core::models::{hash_text, now_ms, Chunk, Transcript};
use transcript_retrieval_core::status::ExtractionStatus;
use transcript_retrieval_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// A transcript as handed over by the transcription pipeline.
#[derive(Debug, Clone, Default)]
pub struct TranscriptInput {
    /// Existing id to update; a new UUID is assigned when absent.
    pub id: Option<String>,
    pub title: Option<String>,
    pub rep_id: Option<String>,
    pub team_id: Option<String>,
    pub text: String,
    pub last_activity_at: Option<i64>,
}

impl TranscriptInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub transcript_id: String,
    pub chunks: usize,
    /// The stored text was identical and already chunked; nothing was written.
    pub unchanged: bool,
}

/// Persist a transcript and queue it for indexing.
pub async fn ingest_transcript(
    store: &dyn Store,
    input: TranscriptInput,
    chunking: &ChunkingConfig,
    now: i64,
) -> Result<IngestOutcome> {
    let id = input
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let existing = store.get_transcript(&id).await?;
    let text_hash = hash_text(&input.text);

    if let Some(existing) = &existing {
        if existing.text_hash == text_hash {
            let chunks = store.list_chunks(&id).await?;
            if !chunks.is_empty() {
                tracing::debug!(transcript_id = %id, "transcript unchanged, skipping");
                return Ok(IngestOutcome {
                    transcript_id: id,
                    chunks: chunks.len(),
                    unchanged: true,
                });
            }
        }
    }

    let mut transcript = Transcript::new(&id, input.text, now);
    transcript.title = input.title;
    transcript.rep_id = input.rep_id;
    transcript.team_id = input.team_id;
    transcript.last_activity_at = input.last_activity_at.unwrap_or(now);
    if let Some(existing) = &existing {
        transcript.created_at = existing.created_at;
        transcript.analysis_status = existing.analysis_status;
        transcript.index_reclaim_count = existing.index_reclaim_count;
        transcript.deleted_at = existing.deleted_at;
    }
    debug_assert_eq!(transcript.index_status, ExtractionStatus::Pending);

    let chunks: Vec<Chunk> = chunk_transcript(&transcript.raw_text, chunking)
        .into_iter()
        .map(|c| {
            Chunk::pending(
                &id,
                c.chunk_index,
                &c.text,
                c.start_offset,
                c.end_offset,
                now,
            )
        })
        .collect();

    store.save_transcript(&transcript, &chunks).await?;
    tracing::info!(transcript_id = %id, chunks = chunks.len(), "transcript queued for indexing");

    Ok(IngestOutcome {
        transcript_id: id,
        chunks: chunks.len(),
        unchanged: false,
    })
}

/// CLI entry point: ingest a text file.
pub async fn run_ingest(config: &Config, path: &Path, input: TranscriptInput) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript file: {}", path.display()))?;
    let chunking = config.chunking.to_core()?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let outcome = ingest_transcript(&store, TranscriptInput { text, ..input }, &chunking, now_ms())
        .await?;

    println!("ingest {}", path.display());
    println!("  transcript: {}", outcome.transcript_id);
    println!("  chunks: {}", outcome.chunks);
    if outcome.unchanged {
        println!("  unchanged, not requeued");
    }
    println!("ok");

    pool.close().await;
    Ok(())
}
