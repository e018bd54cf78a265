//! Indexing worker pool.
//!
//! Each worker claims one transcript job at a time (`pending -> processing`
//! on the transcript row), then drives every `pending` chunk of it through
//! extraction and embedding. A chunk becomes retrievable only through
//! [`Store::complete_chunk`], which writes every derived signal and the
//! `completed` status in one update.
//!
//! Every status write is compare-and-set on the claim token minted when the
//! job or chunk was claimed. When a write loses (the watchdog reclaimed the
//! claim, or the transcript was re-ingested mid-job) the worker logs it and
//! drops its result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use transcript_retrieval_core::embedding::{embed_one, EmbeddingProvider};
use transcript_retrieval_core::error::ServiceError;
use transcript_retrieval_core::extract::Extractor;
use transcript_retrieval_core::lexical::LexicalEntry;
use transcript_retrieval_core::models::{now_ms, Chunk, DerivedSignals};
use transcript_retrieval_core::status::ExtractionStatus;
use transcript_retrieval_core::store::{Claim, Store};

use crate::config::{Config, IndexingConfig};
use crate::db;
use crate::embedding::create_provider;
use crate::extract::create_extractor;
use crate::sqlite_store::SqliteStore;

/// Retry policy of the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Total attempts per chunk, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Idle sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl From<&IndexingConfig> for IndexerConfig {
    fn from(c: &IndexingConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            backoff_base: Duration::from_millis(c.backoff_base_ms),
            backoff_max: Duration::from_millis(c.backoff_max_ms),
            poll_interval: Duration::from_millis(c.poll_interval_ms),
        }
    }
}

impl IndexerConfig {
    /// `backoff_base * 2^(attempt - 1)`, capped at `backoff_max`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// How one chunk ended within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    Completed,
    Failed,
    /// Another writer changed the row first; the result was discarded.
    Lost,
}

/// Summary of one transcript job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub transcript_id: String,
    pub completed: usize,
    pub failed: usize,
    pub lost: usize,
    /// Status the transcript job was left in; `None` if the final write
    /// lost its compare-and-set.
    pub final_status: Option<ExtractionStatus>,
}

impl JobReport {
    fn new(transcript_id: &str) -> Self {
        Self {
            transcript_id: transcript_id.to_string(),
            completed: 0,
            failed: 0,
            lost: 0,
            final_status: None,
        }
    }

    fn record(&mut self, outcome: ChunkOutcome) {
        match outcome {
            ChunkOutcome::Completed => self.completed += 1,
            ChunkOutcome::Failed => self.failed += 1,
            ChunkOutcome::Lost => self.lost += 1,
        }
    }

    /// False when the job was released back to `pending` without touching
    /// a chunk, i.e. every remaining chunk is held by another worker.
    pub fn made_progress(&self) -> bool {
        self.completed + self.failed + self.lost > 0
            || self.final_status != Some(ExtractionStatus::Pending)
    }
}

pub struct Indexer {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn Extractor>,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn Extractor>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            config,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Claim and process the oldest pending transcript job.
    ///
    /// Returns `None` when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<JobReport>> {
        let Some(job) = self.store.claim_next_transcript(now_ms()).await? else {
            return Ok(None);
        };
        let transcript_id = job.id.as_str();
        tracing::info!(transcript_id, "claimed transcript job");

        let mut report = JobReport::new(transcript_id);
        for chunk in self.store.list_chunks(transcript_id).await? {
            if chunk.extraction_status != ExtractionStatus::Pending {
                continue;
            }
            if let Some(outcome) = self.process_chunk(&chunk).await? {
                report.record(outcome);
            }
        }

        report.final_status = self.finalize(&job).await?;
        tracing::info!(
            transcript_id,
            completed = report.completed,
            failed = report.failed,
            lost = report.lost,
            status = ?report.final_status,
            "transcript job finished"
        );
        Ok(Some(report))
    }

    /// Run jobs until the queue is empty.
    pub async fn drain(&self) -> Result<Vec<JobReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_once().await? {
            let progressed = report.made_progress();
            reports.push(report);
            // Chunks held by another worker leave the job pending; stop
            // instead of spinning on it.
            if !progressed {
                break;
            }
        }
        Ok(reports)
    }

    /// Claim one chunk and drive it to `completed` or `failed`.
    ///
    /// Returns `None` if another worker claimed the chunk first.
    async fn process_chunk(&self, chunk: &Chunk) -> Result<Option<ChunkOutcome>> {
        let Some(claim) = self.store.claim_chunk(&chunk.id, now_ms()).await? else {
            return Ok(None);
        };

        // The row may have been replaced since the job listed it; work on
        // the text that belongs to the claim.
        let held = self
            .store
            .get_chunk(&claim.id)
            .await?
            .filter(|c| c.metadata.claim_token.as_deref() == Some(claim.token.as_str()));
        let Some(chunk) = held else {
            return Ok(Some(ChunkOutcome::Lost));
        };
        let chunk_id = chunk.id.as_str();
        let transcript_id = chunk.transcript_id.as_str();

        let mut attempts = chunk.metadata.attempts;
        loop {
            let attempt = attempts + 1;
            let error = match self.derive_signals(&chunk.text).await {
                Ok(signals) => {
                    if self
                        .store
                        .complete_chunk(&claim, &signals, now_ms())
                        .await?
                    {
                        tracing::debug!(transcript_id, chunk_id, attempt, "chunk completed");
                        return Ok(Some(ChunkOutcome::Completed));
                    }
                    tracing::warn!(
                        transcript_id,
                        chunk_id,
                        "chunk claim lost before completion, result discarded"
                    );
                    return Ok(Some(ChunkOutcome::Lost));
                }
                Err(e) => e,
            };

            if error.is_transient() && attempt < self.config.max_attempts {
                let message = error.to_string();
                match self
                    .store
                    .record_attempt(&claim, &message, now_ms())
                    .await?
                {
                    Some(n) => attempts = n,
                    None => {
                        tracing::warn!(transcript_id, chunk_id, "chunk claim lost during retry");
                        return Ok(Some(ChunkOutcome::Lost));
                    }
                }
                let delay = self.config.backoff_for_attempt(attempt);
                tracing::warn!(
                    transcript_id,
                    chunk_id,
                    attempt,
                    error = %message,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let message = error.to_string();
            if self.store.fail_chunk(&claim, &message, now_ms()).await? {
                tracing::error!(transcript_id, chunk_id, attempt, error = %message, "chunk failed");
                return Ok(Some(ChunkOutcome::Failed));
            }
            tracing::warn!(transcript_id, chunk_id, "chunk claim lost before failure was recorded");
            return Ok(Some(ChunkOutcome::Lost));
        }
    }

    /// Run extraction and embedding concurrently. Both must succeed.
    async fn derive_signals(&self, text: &str) -> Result<DerivedSignals, ServiceError> {
        let (extraction, embedding) = tokio::join!(
            self.extractor.extract(text),
            embed_one(self.embedder.as_ref(), text)
        );
        let (extraction, embedding) = match (extraction, embedding) {
            (Ok(x), Ok(e)) => (x, e),
            (Err(x), Err(e)) => {
                // A permanent error wins: retrying cannot fix it.
                return Err(if x.is_transient() { e } else { x });
            }
            (Err(x), _) => return Err(x),
            (_, Err(e)) => return Err(e),
        };
        Ok(DerivedSignals {
            entities: extraction.entities,
            topics: extraction.topics,
            qualification_tags: extraction.qualification_tags,
            embedding,
            lexical: LexicalEntry::index(text),
        })
    }

    /// Settle the transcript job from its chunk statuses.
    async fn finalize(&self, job: &Claim) -> Result<Option<ExtractionStatus>> {
        let transcript_id = job.id.as_str();
        let chunks = self.store.list_chunks(transcript_id).await?;
        let target = if chunks
            .iter()
            .any(|c| c.extraction_status == ExtractionStatus::Failed)
        {
            ExtractionStatus::Failed
        } else if chunks
            .iter()
            .all(|c| c.extraction_status == ExtractionStatus::Completed)
        {
            ExtractionStatus::Completed
        } else {
            ExtractionStatus::Pending
        };

        let landed = self
            .store
            .settle_transcript(job, target, now_ms())
            .await?;
        if !landed {
            tracing::warn!(transcript_id, "transcript job no longer held, status left as is");
            return Ok(None);
        }
        Ok(Some(target))
    }
}

/// Spawn `workers` tasks polling the queue until `shutdown` flips to true.
pub async fn run_workers(
    indexer: Arc<Indexer>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        let indexer = indexer.clone();
        let mut shutdown = shutdown.clone();
        set.spawn(async move {
            tracing::debug!(worker, "indexer worker started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let idle = match indexer.run_once().await {
                    Ok(Some(report)) => !report.made_progress(),
                    Ok(None) => true,
                    Err(e) => {
                        tracing::error!(worker, error = %format!("{:#}", e), "indexer job error");
                        true
                    }
                };
                if idle {
                    tokio::select! {
                        _ = tokio::time::sleep(indexer.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!(worker, "indexer worker stopped");
        });
    }

    while let Some(joined) = set.join_next().await {
        joined?;
    }
    Ok(())
}

/// CLI entry point: drain the queue once, or keep `[indexing].workers`
/// workers running until `shutdown` fires.
pub async fn run_index(
    config: &Config,
    keep_running: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Indexing requires embeddings. Set [embedding] provider in config.");
    }
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let indexer = Arc::new(Indexer::new(
        store,
        create_provider(&config.embedding)?,
        create_extractor(&config.extraction)?,
        IndexerConfig::from(&config.indexing),
    ));

    if keep_running {
        println!(
            "Indexing with {} worker(s), Ctrl-C to stop",
            config.indexing.workers
        );
        run_workers(indexer, config.indexing.workers, shutdown).await?;
    } else {
        let reports = indexer.drain().await?;
        let completed: usize = reports.iter().map(|r| r.completed).sum();
        let failed: usize = reports.iter().map(|r| r.failed).sum();
        println!("index");
        println!("  transcripts: {}", reports.len());
        println!("  chunks completed: {}", completed);
        println!("  chunks failed: {}", failed);
        println!("ok");
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = IndexerConfig {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(1_500),
            poll_interval: Duration::from_millis(10),
        };
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(1_000));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(1_500));
        assert_eq!(config.backoff_for_attempt(40), Duration::from_millis(1_500));
    }

    #[test]
    fn test_config_from_file_section() {
        let config = IndexerConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(500));
    }
}
