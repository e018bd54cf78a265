//! Hybrid retrieval over completed chunks.
//!
//! The retriever operates entirely through the [`Store`] trait. The store
//! applies the hard filters (transcript scope, `completed` status, topic and
//! qualification-tag intersection, soft delete) and returns raw signals;
//! this module normalizes them and ranks.
//!
//! # Scoring
//!
//! For each candidate:
//!
//! 1. `vector_score`: cosine similarity rescaled from `[-1, 1]` to `[0, 1]`,
//!    or `0` when the query carries no embedding.
//! 2. `fts_score`: raw lexical score divided by the candidate-set maximum,
//!    so the top lexical match is `1.0`; `0` when nothing matched.
//! 3. `entity_score`: mean over requested entities of
//!    `min(mention_count, saturation) / saturation`; `0` without an entity
//!    filter.
//! 4. `relevance_score = w_v·vector + w_f·fts + w_e·entity`.
//!
//! Results are sorted by relevance (desc), transcript activity (desc),
//! `chunk_index` (asc), transcript id (asc), and chunk id (asc), then
//! truncated to `match_count`.

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::rescale_cosine;
use crate::error::RetrievalError;
use crate::models::{Chunk, EntityMention};
use crate::store::{CandidateQuery, ChunkCandidate, Store};
use crate::vocab::{parse_tags, EntityType, QualificationTag, TagFilter, Topic};

/// Relative emphasis of the three signals. Weights need not sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalWeights {
    pub weight_vector: f64,
    pub weight_fts: f64,
    pub weight_entity: f64,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            weight_vector: 0.6,
            weight_fts: 0.3,
            weight_entity: 0.1,
        }
    }
}

impl RetrievalWeights {
    pub fn new(weight_vector: f64, weight_fts: f64, weight_entity: f64) -> Self {
        Self {
            weight_vector,
            weight_fts,
            weight_entity,
        }
    }

    pub fn validate(&self) -> Result<(), RetrievalError> {
        for (name, w) in [
            ("weight_vector", self.weight_vector),
            ("weight_fts", self.weight_fts),
            ("weight_entity", self.weight_entity),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(RetrievalError::InvalidQuery(format!(
                    "{} must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        Ok(())
    }

    pub fn combine(&self, vector_score: f64, fts_score: f64, entity_score: f64) -> f64 {
        self.weight_vector * vector_score
            + self.weight_fts * fts_score
            + self.weight_entity * entity_score
    }
}

/// Retriever defaults; a query may override weights and `match_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    pub weights: RetrievalWeights,
    pub match_count: usize,
    /// Mention count at which an entity contributes fully.
    pub entity_saturation: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weights: RetrievalWeights::default(),
            match_count: 8,
            entity_saturation: 3,
        }
    }
}

/// A requested entity, matched on type and case-insensitive value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub value: String,
}

impl EntityFilter {
    pub fn new(entity_type: EntityType, value: impl Into<String>) -> Self {
        Self {
            entity_type,
            value: value.into(),
        }
    }

    fn matches(&self, mention: &EntityMention) -> bool {
        mention.entity_type == self.entity_type
            && mention.value.trim().eq_ignore_ascii_case(self.value.trim())
    }
}

/// Parses `type:value`, e.g. `competitor:Gong`.
impl FromStr for EntityFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, value)) = s.split_once(':') else {
            anyhow::bail!("entity filter must look like type:value, got {:?}", s);
        };
        if value.trim().is_empty() {
            anyhow::bail!("entity filter {:?} has an empty value", s);
        }
        Ok(Self::new(kind.parse()?, value.trim()))
    }
}

/// Parse open filter strings into a [`TagFilter`], rejecting unknown values.
///
/// Dropping an unknown filter value would silently widen the result set,
/// so it is a query error here.
pub fn parse_filter<T>(raw: &[String], what: &str) -> Result<TagFilter<T>, RetrievalError>
where
    T: FromStr + Ord + Clone,
{
    let (tags, rejected) = parse_tags::<T>(raw);
    if !rejected.is_empty() {
        return Err(RetrievalError::InvalidQuery(format!(
            "unknown {}: {}",
            what,
            rejected.join(", ")
        )));
    }
    Ok(TagFilter::of(tags))
}

/// A retrieval request.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    /// Required, non-empty scope.
    pub transcript_ids: Vec<String>,
    pub topics: TagFilter<Topic>,
    pub qualification_tags: TagFilter<QualificationTag>,
    pub entities: Vec<EntityFilter>,
    /// Overrides the configured weights.
    pub weights: Option<RetrievalWeights>,
    /// Overrides the configured top-K; must be positive.
    pub match_count: Option<i64>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, transcript_ids: Vec<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
            transcript_ids,
            topics: TagFilter::any(),
            qualification_tags: TagFilter::any(),
            entities: Vec::new(),
            weights: None,
            match_count: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_topics(mut self, topics: TagFilter<Topic>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_qualification_tags(mut self, tags: TagFilter<QualificationTag>) -> Self {
        self.qualification_tags = tags;
        self
    }

    pub fn with_entities(mut self, entities: Vec<EntityFilter>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_weights(mut self, weights: RetrievalWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_match_count(mut self, match_count: i64) -> Self {
        self.match_count = Some(match_count);
        self
    }
}

/// A retrieval result: the chunk plus its normalized scores.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub transcript_last_activity_at: i64,
    pub vector_score: f64,
    pub fts_score: f64,
    pub entity_score: f64,
    pub relevance_score: f64,
}

/// Hybrid retriever over a [`Store`].
pub struct Retriever {
    store: Arc<dyn Store>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(store: Arc<dyn Store>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Return up to `match_count` completed chunks ranked by relevance.
    ///
    /// An empty result is not an error.
    pub async fn retrieve(
        &self,
        query: &RetrievalQuery,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let (weights, limit) = self.validate(query)?;

        let candidates = self
            .store
            .candidates(&CandidateQuery {
                transcript_ids: &query.transcript_ids,
                text: &query.text,
                embedding: query.embedding.as_deref(),
                topics: &query.topics,
                qualification_tags: &query.qualification_tags,
            })
            .await?;

        let mut scored = score_candidates(
            candidates,
            query.embedding.is_some(),
            &query.entities,
            &weights,
            self.config.entity_saturation,
        );
        sort_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    fn validate(&self, query: &RetrievalQuery) -> Result<(RetrievalWeights, usize), RetrievalError> {
        if query.transcript_ids.iter().all(|id| id.trim().is_empty()) {
            return Err(RetrievalError::InvalidQuery(
                "transcript_ids must not be empty".to_string(),
            ));
        }
        let limit = match query.match_count {
            Some(n) if n <= 0 => {
                return Err(RetrievalError::InvalidQuery(format!(
                    "match_count must be positive, got {}",
                    n
                )))
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
            None => self.config.match_count,
        };
        if let Some(embedding) = &query.embedding {
            if embedding.is_empty() {
                return Err(RetrievalError::InvalidQuery(
                    "query embedding is empty".to_string(),
                ));
            }
        }
        let weights = query.weights.unwrap_or(self.config.weights);
        weights.validate()?;
        Ok((weights, limit))
    }
}

/// Normalize raw candidate signals and compute relevance.
pub fn score_candidates(
    candidates: Vec<ChunkCandidate>,
    has_query_embedding: bool,
    entities: &[EntityFilter],
    weights: &RetrievalWeights,
    entity_saturation: u32,
) -> Vec<ScoredChunk> {
    let max_lexical = candidates
        .iter()
        .map(|c| c.lexical_score)
        .fold(0.0f64, f64::max);

    candidates
        .into_iter()
        .map(|c| {
            let vector_score = match (has_query_embedding, c.vector_similarity) {
                (true, Some(sim)) => rescale_cosine(sim),
                _ => 0.0,
            };
            let fts_score = if max_lexical > 0.0 {
                (c.lexical_score / max_lexical).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let entity_score = entity_score(&c.chunk.entities, entities, entity_saturation);
            ScoredChunk {
                relevance_score: weights.combine(vector_score, fts_score, entity_score),
                chunk: c.chunk,
                transcript_last_activity_at: c.last_activity_at,
                vector_score,
                fts_score,
                entity_score,
            }
        })
        .collect()
}

/// Mean saturated mention weight of the requested entities in a chunk.
pub fn entity_score(mentions: &[EntityMention], wanted: &[EntityFilter], saturation: u32) -> f64 {
    if wanted.is_empty() {
        return 0.0;
    }
    let saturation = saturation.max(1);
    let total: f64 = wanted
        .iter()
        .map(|w| {
            let count: u32 = mentions
                .iter()
                .filter(|m| w.matches(m))
                .map(|m| m.mention_count)
                .sum();
            f64::from(count.min(saturation)) / f64::from(saturation)
        })
        .sum();
    total / wanted.len() as f64
}

/// Total order over results.
pub fn compare_scored(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.relevance_score
        .total_cmp(&a.relevance_score)
        .then(b.transcript_last_activity_at.cmp(&a.transcript_last_activity_at))
        .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        .then_with(|| a.chunk.transcript_id.cmp(&b.chunk.transcript_id))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

pub fn sort_scored(scored: &mut [ScoredChunk]) {
    scored.sort_by(compare_scored);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexical::LexicalEntry;
    use crate::models::DerivedSignals;
    use crate::store::memory::InMemoryStore;
    use crate::models::Transcript;
    use std::collections::BTreeSet;

    fn candidate(
        transcript_id: &str,
        index: i64,
        similarity: f64,
        lexical: f64,
        activity: i64,
    ) -> ChunkCandidate {
        ChunkCandidate {
            chunk: Chunk::pending(transcript_id, index, "text", 0, 4, 0),
            last_activity_at: activity,
            vector_similarity: Some(similarity),
            lexical_score: lexical,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_weights_need_not_sum_to_one() {
        // C1: vector 0.9 / fts 0.1, C2: vector 0.2 / fts 0.9. A third
        // candidate pins the lexical maximum at 1.0.
        let candidates = vec![
            candidate("t", 0, 0.8, 0.1, 0),
            candidate("t", 1, -0.6, 0.9, 0),
            candidate("t", 2, -1.0, 1.0, 0),
        ];
        let mut scored = score_candidates(
            candidates,
            true,
            &[],
            &RetrievalWeights::new(1.0, 1.0, 0.0),
            3,
        );
        assert!(approx(scored[0].vector_score, 0.9));
        assert!(approx(scored[1].fts_score, 0.9));
        assert!(approx(scored[0].relevance_score, 1.0));
        assert!(approx(scored[1].relevance_score, 1.1));

        sort_scored(&mut scored);
        assert_eq!(scored[0].chunk.chunk_index, 1);
    }

    #[test]
    fn test_vector_only_weights_follow_vector_order() {
        let candidates = vec![
            candidate("t", 0, 0.1, 5.0, 0),
            candidate("t", 1, 0.9, 0.0, 0),
            candidate("t", 2, 0.5, 2.0, 0),
        ];
        let mut scored = score_candidates(
            candidates,
            true,
            &[],
            &RetrievalWeights::new(1.0, 0.0, 0.0),
            3,
        );
        sort_scored(&mut scored);
        let order: Vec<i64> = scored.iter().map(|s| s.chunk.chunk_index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(scored
            .windows(2)
            .all(|w| w[0].vector_score >= w[1].vector_score));
    }

    #[test]
    fn test_zero_weights_fall_back_to_tie_break() {
        let candidates = vec![
            candidate("b", 1, 0.9, 1.0, 10),
            candidate("a", 0, 0.1, 0.0, 20),
            candidate("a", 2, 0.3, 0.0, 20),
            candidate("c", 0, 0.3, 0.0, 10),
        ];
        let mut scored = score_candidates(
            candidates,
            true,
            &[],
            &RetrievalWeights::new(0.0, 0.0, 0.0),
            3,
        );
        assert!(scored.iter().all(|s| s.relevance_score == 0.0));
        sort_scored(&mut scored);
        let order: Vec<(String, i64)> = scored
            .iter()
            .map(|s| (s.chunk.transcript_id.clone(), s.chunk.chunk_index))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 0),
                ("a".to_string(), 2),
                ("c".to_string(), 0),
                ("b".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_no_query_embedding_means_zero_vector_score() {
        let mut c = candidate("t", 0, 0.0, 1.0, 0);
        c.vector_similarity = None;
        let scored = score_candidates(vec![c], false, &[], &RetrievalWeights::default(), 3);
        assert_eq!(scored[0].vector_score, 0.0);
        assert!(approx(scored[0].fts_score, 1.0));
    }

    #[test]
    fn test_no_lexical_match_means_zero_fts() {
        let scored = score_candidates(
            vec![candidate("t", 0, 0.0, 0.0, 0)],
            true,
            &[],
            &RetrievalWeights::default(),
            3,
        );
        assert_eq!(scored[0].fts_score, 0.0);
    }

    #[test]
    fn test_entity_score_saturates() {
        let wanted = vec![
            EntityFilter::new(EntityType::Competitor, "gong"),
            EntityFilter::new(EntityType::Amount, "$5,000"),
        ];
        let once = vec![EntityMention::new(EntityType::Competitor, "Gong", 1)];
        let many = vec![EntityMention::new(EntityType::Competitor, "Gong", 50)];
        let both = vec![
            EntityMention::new(EntityType::Competitor, "Gong", 3),
            EntityMention::new(EntityType::Amount, "$5,000", 3),
        ];
        assert!(approx(entity_score(&once, &wanted, 3), 1.0 / 6.0));
        assert!(approx(entity_score(&many, &wanted, 3), 0.5));
        assert!(approx(entity_score(&both, &wanted, 3), 1.0));
        assert_eq!(entity_score(&both, &[], 3), 0.0);
    }

    #[test]
    fn test_entity_filter_parse() {
        let f: EntityFilter = "competitor:Gong".parse().unwrap();
        assert_eq!(f, EntityFilter::new(EntityType::Competitor, "Gong"));
        assert!("Gong".parse::<EntityFilter>().is_err());
        assert!("planet:Mars".parse::<EntityFilter>().is_err());
        assert!("person: ".parse::<EntityFilter>().is_err());
    }

    #[test]
    fn test_parse_filter_rejects_unknown() {
        let ok: TagFilter<Topic> = parse_filter(&["pricing".to_string()], "topics").unwrap();
        assert!(ok.is_active());
        let err = parse_filter::<Topic>(&["astrology".to_string()], "topics").unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));
    }

    async fn store_with_completed() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for id in ["A", "B"] {
            store
                .upsert_transcript(&Transcript::new(id, "x", 0))
                .await
                .unwrap();
            let chunks = vec![
                Chunk::pending(id, 0, "budget approval from the cfo", 0, 10, 0),
                Chunk::pending(id, 1, "security questionnaire", 11, 20, 0),
            ];
            store.replace_chunks(id, &chunks).await.unwrap();
            for c in &chunks {
                let claim = store.claim_chunk(&c.id, 1).await.unwrap().unwrap();
                store
                    .complete_chunk(
                        &claim,
                        &DerivedSignals {
                            entities: Vec::new(),
                            topics: BTreeSet::new(),
                            qualification_tags: BTreeSet::new(),
                            embedding: vec![1.0, 0.0],
                            lexical: LexicalEntry::index(&c.text),
                        },
                        2,
                    )
                    .await
                    .unwrap();
            }
        }
        store
    }

    #[tokio::test]
    async fn test_retrieve_respects_scope_and_limit() {
        let store = store_with_completed().await;
        let retriever = Retriever::new(store, RetrievalConfig::default());

        let results = retriever
            .retrieve(&RetrievalQuery::new("budget", vec!["A".to_string()]))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.chunk.transcript_id == "A"));
        assert_eq!(results[0].chunk.chunk_index, 0);
        assert!(approx(results[0].fts_score, 1.0));

        let results = retriever
            .retrieve(
                &RetrievalQuery::new("budget", vec!["A".to_string(), "B".to_string()])
                    .with_match_count(1),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_retrieve_rejects_invalid_queries() {
        let store = store_with_completed().await;
        let retriever = Retriever::new(store, RetrievalConfig::default());

        let err = retriever
            .retrieve(&RetrievalQuery::new("budget", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));

        for n in [0, -3] {
            let err = retriever
                .retrieve(&RetrievalQuery::new("budget", vec!["A".to_string()]).with_match_count(n))
                .await
                .unwrap_err();
            assert!(matches!(err, RetrievalError::InvalidQuery(_)));
        }

        let err = retriever
            .retrieve(
                &RetrievalQuery::new("budget", vec!["A".to_string()])
                    .with_weights(RetrievalWeights::new(-1.0, 0.0, 0.0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_empty_scope_is_not_an_error() {
        let store = store_with_completed().await;
        let retriever = Retriever::new(store, RetrievalConfig::default());
        let results = retriever
            .retrieve(
                &RetrievalQuery::new("budget", vec!["A".to_string()])
                    .with_topics(TagFilter::of([Topic::Renewal])),
            )
            .await
            .unwrap();
        assert!(results.is_empty());

        let results = retriever
            .retrieve(&RetrievalQuery::new("budget", vec!["missing".to_string()]))
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
