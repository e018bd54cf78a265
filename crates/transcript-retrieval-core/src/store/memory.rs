//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! All state sits behind one `std::sync::RwLock`, so every compare-and-set
//! is atomic with respect to other writers. Vector similarity is
//! brute-force cosine and lexical relevance is BM25 over the candidate set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::lexical::{bm25_scores, LexicalEntry};
use crate::models::{Chunk, DerivedSignals, Transcript};
use crate::status::{ExtractionStatus, Transition};

use super::{
    check_settlement, check_transition, CandidateQuery, ChunkCandidate, Claim, ClaimKind, FailedChunk, ReclaimedClaim,
    RequeueCounts, StatusReport, Store,
};

#[derive(Default)]
struct State {
    transcripts: HashMap<String, Transcript>,
    /// Keyed by chunk id.
    chunks: BTreeMap<String, Chunk>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn in_scope(scope: Option<&str>, transcript_id: &str) -> bool {
    scope.map_or(true, |id| id == transcript_id)
}

fn holds(token: &Option<String>, claim: &Claim) -> bool {
    token.as_deref() == Some(claim.token.as_str())
}

impl State {
    /// The chunk behind `claim`, if it is still `processing` under it.
    fn claimed_chunk(&mut self, claim: &Claim) -> Option<&mut Chunk> {
        self.chunks.get_mut(&claim.id).filter(|c| {
            c.extraction_status == ExtractionStatus::Processing
                && holds(&c.metadata.claim_token, claim)
        })
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_transcript(&self, transcript: &Transcript) -> Result<()> {
        let mut state = self.write()?;
        state
            .transcripts
            .insert(transcript.id.clone(), transcript.clone());
        Ok(())
    }

    async fn get_transcript(&self, id: &str) -> Result<Option<Transcript>> {
        Ok(self.read()?.transcripts.get(id).cloned())
    }

    async fn soft_delete_transcript(&self, id: &str, now: i64) -> Result<bool> {
        let mut state = self.write()?;
        match state.transcripts.get_mut(id) {
            Some(t) if t.deleted_at.is_none() => {
                t.deleted_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_chunks(&self, transcript_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.write()?;
        state.chunks.retain(|_, c| c.transcript_id != transcript_id);
        for c in chunks {
            state.chunks.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn save_transcript(&self, transcript: &Transcript, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.write()?;
        state
            .transcripts
            .insert(transcript.id.clone(), transcript.clone());
        state.chunks.retain(|_, c| c.transcript_id != transcript.id);
        for c in chunks {
            state.chunks.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn list_chunks(&self, transcript_id: &str) -> Result<Vec<Chunk>> {
        let state = self.read()?;
        let mut chunks: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| c.transcript_id == transcript_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.read()?.chunks.get(id).cloned())
    }

    async fn claim_next_transcript(&self, now: i64) -> Result<Option<Claim>> {
        let mut state = self.write()?;
        let next = state
            .transcripts
            .values()
            .filter(|t| t.index_status == ExtractionStatus::Pending && !t.is_deleted())
            .min_by(|a, b| {
                a.index_updated_at
                    .cmp(&b.index_updated_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|t| t.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(t) = state.transcripts.get_mut(&id) else {
            return Ok(None);
        };
        let claim = Claim::mint(&id);
        t.index_status = ExtractionStatus::Processing;
        t.index_updated_at = now;
        t.index_claim_token = Some(claim.token.clone());
        Ok(Some(claim))
    }

    async fn settle_transcript(
        &self,
        claim: &Claim,
        to: ExtractionStatus,
        now: i64,
    ) -> Result<bool> {
        let transition = check_settlement(to)?;
        let mut state = self.write()?;
        let Some(t) = state.transcripts.get_mut(&claim.id) else {
            return Ok(false);
        };
        if t.index_status != ExtractionStatus::Processing || !holds(&t.index_claim_token, claim) {
            return Ok(false);
        }
        t.index_status = to;
        t.index_updated_at = now;
        t.index_claim_token = None;
        if transition == Transition::Fail {
            t.index_attempts += 1;
        }
        Ok(true)
    }

    async fn claim_chunk(&self, chunk_id: &str, now: i64) -> Result<Option<Claim>> {
        let mut state = self.write()?;
        match state.chunks.get_mut(chunk_id) {
            Some(c) if c.extraction_status == ExtractionStatus::Pending => {
                let claim = Claim::mint(chunk_id);
                c.extraction_status = ExtractionStatus::Processing;
                c.metadata.updated_at = now;
                c.metadata.claimed_at = Some(now);
                c.metadata.claim_token = Some(claim.token.clone());
                Ok(Some(claim))
            }
            _ => Ok(None),
        }
    }

    async fn transition_chunk(
        &self,
        id: &str,
        from: ExtractionStatus,
        to: ExtractionStatus,
        now: i64,
    ) -> Result<bool> {
        let transition = check_transition(from, to)?;
        let mut state = self.write()?;
        let Some(c) = state.chunks.get_mut(id) else {
            return Ok(false);
        };
        if c.extraction_status != from {
            return Ok(false);
        }
        c.extraction_status = to;
        c.metadata.updated_at = now;
        match transition {
            Transition::Fail => c.metadata.attempts += 1,
            Transition::Requeue => {
                c.metadata.attempts = 0;
                c.metadata.last_error = None;
            }
            Transition::Reclaim => c.metadata.claimed_at = None,
            Transition::Claim | Transition::Complete => {}
        }
        c.metadata.claim_token = None;
        Ok(true)
    }

    async fn record_attempt(&self, claim: &Claim, error: &str, now: i64) -> Result<Option<u32>> {
        let mut state = self.write()?;
        let Some(c) = state.claimed_chunk(claim) else {
            return Ok(None);
        };
        c.metadata.attempts += 1;
        c.metadata.last_error = Some(error.to_string());
        c.metadata.updated_at = now;
        Ok(Some(c.metadata.attempts))
    }

    async fn complete_chunk(
        &self,
        claim: &Claim,
        signals: &DerivedSignals,
        now: i64,
    ) -> Result<bool> {
        let mut state = self.write()?;
        let Some(c) = state.claimed_chunk(claim) else {
            return Ok(false);
        };
        c.embedding = Some(signals.embedding.clone());
        c.lexical = Some(signals.lexical.clone());
        c.entities = signals.entities.clone();
        c.topics = signals.topics.clone();
        c.qualification_tags = signals.qualification_tags.clone();
        c.extraction_status = ExtractionStatus::Completed;
        c.metadata.updated_at = now;
        c.metadata.completed_at = Some(now);
        c.metadata.last_error = None;
        c.metadata.claim_token = None;
        Ok(true)
    }

    async fn fail_chunk(&self, claim: &Claim, error: &str, now: i64) -> Result<bool> {
        let mut state = self.write()?;
        let Some(c) = state.claimed_chunk(claim) else {
            return Ok(false);
        };
        c.extraction_status = ExtractionStatus::Failed;
        c.metadata.attempts += 1;
        c.metadata.last_error = Some(error.to_string());
        c.metadata.updated_at = now;
        c.metadata.claim_token = None;
        Ok(true)
    }

    async fn requeue_failed(&self, transcript_id: Option<&str>, now: i64) -> Result<RequeueCounts> {
        let mut state = self.write()?;
        let mut counts = RequeueCounts::default();
        for c in state.chunks.values_mut() {
            if c.extraction_status == ExtractionStatus::Failed
                && in_scope(transcript_id, &c.transcript_id)
            {
                c.extraction_status = ExtractionStatus::Pending;
                c.metadata.attempts = 0;
                c.metadata.last_error = None;
                c.metadata.updated_at = now;
                counts.chunks += 1;
            }
        }
        for t in state.transcripts.values_mut() {
            if t.index_status == ExtractionStatus::Failed
                && !t.is_deleted()
                && in_scope(transcript_id, &t.id)
            {
                t.index_status = ExtractionStatus::Pending;
                t.index_attempts = 0;
                t.index_updated_at = now;
                counts.transcripts += 1;
            }
        }
        Ok(counts)
    }

    async fn reclaim_stale(&self, cutoff: i64, now: i64) -> Result<Vec<ReclaimedClaim>> {
        let mut state = self.write()?;
        let mut reclaimed = Vec::new();

        let mut transcripts: Vec<&mut Transcript> = state
            .transcripts
            .values_mut()
            .filter(|t| t.index_status == ExtractionStatus::Processing && t.index_updated_at < cutoff)
            .collect();
        transcripts.sort_by(|a, b| a.id.cmp(&b.id));
        for t in transcripts {
            let stuck_ms = now - t.index_updated_at;
            t.index_status = ExtractionStatus::Pending;
            t.index_previous_status = Some(ExtractionStatus::Processing);
            t.index_stuck_ms = Some(stuck_ms);
            t.index_reclaim_count += 1;
            t.index_updated_at = now;
            t.index_claim_token = None;
            reclaimed.push(ReclaimedClaim {
                kind: ClaimKind::Transcript,
                id: t.id.clone(),
                transcript_id: t.id.clone(),
                previous_status: ExtractionStatus::Processing,
                stuck_ms,
            });
        }

        for c in state.chunks.values_mut() {
            if c.extraction_status != ExtractionStatus::Processing
                || c.metadata.updated_at >= cutoff
            {
                continue;
            }
            let stuck_ms = now - c.metadata.updated_at;
            c.extraction_status = ExtractionStatus::Pending;
            c.metadata.previous_status = Some(ExtractionStatus::Processing);
            c.metadata.stuck_ms = Some(stuck_ms);
            c.metadata.reclaim_count += 1;
            c.metadata.claimed_at = None;
            c.metadata.claim_token = None;
            c.metadata.updated_at = now;
            reclaimed.push(ReclaimedClaim {
                kind: ClaimKind::Chunk,
                id: c.id.clone(),
                transcript_id: c.transcript_id.clone(),
                previous_status: ExtractionStatus::Processing,
                stuck_ms,
            });
        }

        Ok(reclaimed)
    }

    async fn status_report(&self, transcript_id: Option<&str>) -> Result<StatusReport> {
        let state = self.read()?;
        let mut report = StatusReport::default();

        let live: HashSet<&str> = state
            .transcripts
            .values()
            .filter(|t| !t.is_deleted() && in_scope(transcript_id, &t.id))
            .map(|t| t.id.as_str())
            .collect();

        for t in state.transcripts.values() {
            if live.contains(t.id.as_str()) {
                report.transcripts.add(t.index_status, 1);
            }
        }
        for c in state.chunks.values() {
            if !live.contains(c.transcript_id.as_str()) {
                continue;
            }
            report.chunks.add(c.extraction_status, 1);
            if c.extraction_status == ExtractionStatus::Failed {
                report.failed.push(FailedChunk {
                    chunk_id: c.id.clone(),
                    transcript_id: c.transcript_id.clone(),
                    chunk_index: c.chunk_index,
                    attempts: c.metadata.attempts,
                    last_error: c.metadata.last_error.clone(),
                    updated_at: c.metadata.updated_at,
                });
            }
        }
        report.failed.sort_by(|a, b| {
            a.transcript_id
                .cmp(&b.transcript_id)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        Ok(report)
    }

    async fn candidates(&self, query: &CandidateQuery<'_>) -> Result<Vec<ChunkCandidate>> {
        let state = self.read()?;
        let scope: HashSet<&str> = query.transcript_ids.iter().map(String::as_str).collect();

        let mut matched: Vec<(&Chunk, i64)> = state
            .chunks
            .values()
            .filter(|c| c.extraction_status.is_retrievable() && scope.contains(c.transcript_id.as_str()))
            .filter(|c| query.topics.admits(&c.topics))
            .filter(|c| query.qualification_tags.admits(&c.qualification_tags))
            .filter_map(|c| {
                let t = state.transcripts.get(&c.transcript_id)?;
                (!t.is_deleted()).then_some((c, t.last_activity_at))
            })
            .collect();
        matched.sort_by(|(a, _), (b, _)| {
            a.transcript_id
                .cmp(&b.transcript_id)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });

        let empty = LexicalEntry::default();
        let entries: Vec<&LexicalEntry> = matched
            .iter()
            .map(|(c, _)| c.lexical.as_ref().unwrap_or(&empty))
            .collect();
        let lexical = bm25_scores(query.text, &entries);

        Ok(matched
            .into_iter()
            .zip(lexical)
            .map(|((chunk, last_activity_at), lexical_score)| {
                let vector_similarity = match (query.embedding, chunk.embedding.as_deref()) {
                    (Some(q), Some(v)) => Some(cosine_similarity(q, v) as f64),
                    (Some(_), None) => Some(0.0),
                    (None, _) => None,
                };
                ChunkCandidate {
                    chunk: chunk.clone(),
                    last_activity_at,
                    vector_similarity,
                    lexical_score,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexical::LexicalEntry;
    use crate::models::{Chunk, DerivedSignals, Transcript};
    use crate::vocab::{QualificationTag, TagFilter, Topic};
    use std::collections::BTreeSet;
    use ExtractionStatus::*;

    fn signals(text: &str, topics: &[Topic]) -> DerivedSignals {
        DerivedSignals {
            entities: Vec::new(),
            topics: topics.iter().copied().collect(),
            qualification_tags: BTreeSet::new(),
            embedding: vec![1.0, 0.0],
            lexical: LexicalEntry::index(text),
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .upsert_transcript(&Transcript::new("t1", "a. b.", 100))
            .await
            .unwrap();
        let chunks = vec![
            Chunk::pending("t1", 0, "pricing talk", 0, 12, 100),
            Chunk::pending("t1", 1, "security talk", 13, 26, 100),
        ];
        store.replace_chunks("t1", &chunks).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = seeded().await;
        assert!(store.claim_next_transcript(200).await.unwrap().is_some());
        assert!(store.claim_next_transcript(201).await.unwrap().is_none());

        let id = store.list_chunks("t1").await.unwrap()[0].id.clone();
        assert!(store.claim_chunk(&id, 200).await.unwrap().is_some());
        assert!(store.claim_chunk(&id, 201).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let store = seeded().await;
        let id = store.list_chunks("t1").await.unwrap()[0].id.clone();
        assert!(store.transition_chunk(&id, Pending, Completed, 200).await.is_err());
        assert!(store.transition_chunk(&id, Completed, Pending, 200).await.is_err());
        assert!(store.transition_chunk(&id, Pending, Processing, 200).await.is_err());
        assert_eq!(store.get_chunk(&id).await.unwrap().unwrap().extraction_status, Pending);
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let store = seeded().await;
        let id = store.list_chunks("t1").await.unwrap()[0].id.clone();
        let unclaimed = Claim::mint(&id);
        assert!(!store.complete_chunk(&unclaimed, &signals("x", &[]), 200).await.unwrap());

        let claim = store.claim_chunk(&id, 200).await.unwrap().unwrap();
        assert!(store.complete_chunk(&claim, &signals("x", &[]), 201).await.unwrap());
        let c = store.get_chunk(&id).await.unwrap().unwrap();
        assert_eq!(c.extraction_status, Completed);
        assert!(c.embedding.is_some() && c.lexical.is_some());
        assert!(c.metadata.claim_token.is_none());
    }

    #[tokio::test]
    async fn test_writes_under_a_replaced_claim_do_not_land() {
        let store = seeded().await;
        let id = store.list_chunks("t1").await.unwrap()[0].id.clone();
        let first = store.claim_chunk(&id, 200).await.unwrap().unwrap();

        // Released by the watchdog and claimed again by another worker.
        store.reclaim_stale(i64::MAX, 300).await.unwrap();
        let second = store.claim_chunk(&id, 301).await.unwrap().unwrap();

        assert_eq!(store.record_attempt(&first, "timeout", 302).await.unwrap(), None);
        assert!(!store.fail_chunk(&first, "timeout", 303).await.unwrap());
        assert!(!store.complete_chunk(&first, &signals("stale", &[]), 304).await.unwrap());
        let c = store.get_chunk(&id).await.unwrap().unwrap();
        assert_eq!(c.extraction_status, Processing);
        assert_eq!(c.metadata.attempts, 0);
        assert!(c.lexical.is_none());

        assert!(store.complete_chunk(&second, &signals("pricing", &[]), 305).await.unwrap());
    }

    #[tokio::test]
    async fn test_settle_transcript_requires_the_job_claim() {
        let store = seeded().await;
        let job = store.claim_next_transcript(200).await.unwrap().unwrap();
        assert_eq!(job.id, "t1");

        let other = Claim::mint("t1");
        assert!(!store.settle_transcript(&other, Completed, 300).await.unwrap());
        assert!(store.settle_transcript(&job, Completed, 300).await.unwrap());
        assert!(!store.settle_transcript(&job, Failed, 301).await.unwrap());
        assert!(store.settle_transcript(&job, Processing, 302).await.is_err());

        let t = store.get_transcript("t1").await.unwrap().unwrap();
        assert_eq!(t.index_status, Completed);
        assert!(t.index_claim_token.is_none());
    }

    #[tokio::test]
    async fn test_fail_then_requeue_resets_attempts() {
        let store = seeded().await;
        let id = store.list_chunks("t1").await.unwrap()[0].id.clone();
        let claim = store.claim_chunk(&id, 200).await.unwrap().unwrap();
        assert_eq!(store.record_attempt(&claim, "timeout", 210).await.unwrap(), Some(1));
        assert!(store.fail_chunk(&claim, "timeout", 220).await.unwrap());

        let report = store.status_report(None).await.unwrap();
        assert_eq!(report.chunks.failed, 1);
        assert_eq!(report.failed[0].attempts, 2);
        assert_eq!(report.failed[0].last_error.as_deref(), Some("timeout"));

        let counts = store.requeue_failed(Some("t1"), 300).await.unwrap();
        assert_eq!(counts.chunks, 1);
        let c = store.get_chunk(&id).await.unwrap().unwrap();
        assert_eq!(c.extraction_status, Pending);
        assert_eq!(c.metadata.attempts, 0);
        assert!(c.metadata.last_error.is_none());
    }

    #[tokio::test]
    async fn test_reclaim_stale_boundary() {
        let store = seeded().await;
        let id = store.list_chunks("t1").await.unwrap()[0].id.clone();
        store.claim_chunk(&id, 1_000).await.unwrap().unwrap();

        // updated_at == cutoff is not stale.
        assert!(store.reclaim_stale(1_000, 5_000).await.unwrap().is_empty());

        let reclaimed = store.reclaim_stale(1_001, 5_000).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].stuck_ms, 4_000);
        let c = store.get_chunk(&id).await.unwrap().unwrap();
        assert_eq!(c.extraction_status, Pending);
        assert_eq!(c.metadata.previous_status, Some(Processing));
        assert_eq!(c.metadata.reclaim_count, 1);
    }

    #[tokio::test]
    async fn test_candidates_apply_hard_filters() {
        let store = seeded().await;
        let chunks = store.list_chunks("t1").await.unwrap();
        for (c, topic) in chunks.iter().zip([Topic::Pricing, Topic::Security]) {
            let claim = store.claim_chunk(&c.id, 200).await.unwrap().unwrap();
            store
                .complete_chunk(&claim, &signals(&c.text, &[topic]), 201)
                .await
                .unwrap();
        }

        let ids = vec!["t1".to_string()];
        let topics = TagFilter::of([Topic::Security]);
        let tags = TagFilter::<QualificationTag>::any();
        let found = store
            .candidates(&CandidateQuery {
                transcript_ids: &ids,
                text: "security",
                embedding: None,
                topics: &topics,
                qualification_tags: &tags,
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].chunk.chunk_index, 1);
        assert!(found[0].lexical_score > 0.0);
        assert!(found[0].vector_similarity.is_none());

        store.soft_delete_transcript("t1", 300).await.unwrap();
        let any = TagFilter::<Topic>::any();
        let found = store
            .candidates(&CandidateQuery {
                transcript_ids: &ids,
                text: "security",
                embedding: None,
                topics: &any,
                qualification_tags: &tags,
            })
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
