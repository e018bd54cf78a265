//! Retrieval entry points shared by the CLI and the HTTP server.
//!
//! Turns a loosely typed request (open string filters, optional weights)
//! into a validated [`RetrievalQuery`], embeds the query text when the
//! caller did not supply an embedding, and runs the [`Retriever`].

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use transcript_retrieval_core::embedding::{embed_one, EmbeddingProvider};
use transcript_retrieval_core::error::RetrievalError;
use transcript_retrieval_core::retrieve::{
    parse_filter, EntityFilter, RetrievalQuery, RetrievalWeights, Retriever, ScoredChunk,
};
use transcript_retrieval_core::vocab::{QualificationTag, Topic};

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::sqlite_store::SqliteStore;

/// A retrieval request as received from the chat assistant or the CLI.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub query: String,
    pub embedding: Option<Vec<f32>>,
    pub transcript_ids: Vec<String>,
    pub topics: Vec<String>,
    pub qualification_tags: Vec<String>,
    pub entities: Vec<EntityFilter>,
    pub weights: Option<RetrievalWeights>,
    pub match_count: Option<i64>,
}

impl SearchRequest {
    /// Validate the open filters into a typed query.
    pub fn to_query(&self) -> Result<RetrievalQuery, RetrievalError> {
        let topics = parse_filter::<Topic>(&self.topics, "topics")?;
        let tags = parse_filter::<QualificationTag>(&self.qualification_tags, "qualification_tags")?;

        let mut query = RetrievalQuery::new(self.query.clone(), self.transcript_ids.clone())
            .with_topics(topics)
            .with_qualification_tags(tags)
            .with_entities(self.entities.clone());
        if let Some(embedding) = &self.embedding {
            query = query.with_embedding(embedding.clone());
        }
        if let Some(weights) = self.weights {
            query = query.with_weights(weights);
        }
        if let Some(n) = self.match_count {
            query = query.with_match_count(n);
        }
        Ok(query)
    }
}

/// A retriever plus the provider used to embed free-text queries.
pub struct SearchService {
    retriever: Retriever,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl SearchService {
    pub fn new(retriever: Retriever, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            retriever,
            embedder,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let mut query = request.to_query()?;

        if query.embedding.is_none() && !query.text.trim().is_empty() {
            if let Some(embedder) = &self.embedder {
                // A failed query embedding degrades to lexical and entity
                // signals only.
                match embed_one(embedder.as_ref(), &query.text).await {
                    Ok(embedding) => query = query.with_embedding(embedding),
                    Err(e) => tracing::warn!(error = %e, "query embedding failed, ranking without vectors"),
                }
            }
        }

        let results = self.retriever.retrieve(&query).await?;
        tracing::debug!(
            transcripts = query.transcript_ids.len(),
            results = results.len(),
            has_embedding = query.embedding.is_some(),
            "retrieve"
        );
        Ok(results)
    }
}

/// Build a [`SearchService`] over SQLite from the config.
pub fn build_service(config: &Config, store: Arc<SqliteStore>) -> Result<SearchService> {
    let embedder = if config.embedding.is_enabled() {
        Some(create_provider(&config.embedding)?)
    } else {
        None
    };
    let retriever = Retriever::new(store, config.retrieval.to_core());
    Ok(SearchService::new(retriever, embedder))
}

/// CLI entry point: run one retrieval and print the scored chunks as JSON.
pub async fn run_search(config: &Config, request: SearchRequest) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let service = build_service(config, store)?;

    let results = service.search(&request).await?;
    println!("{}", serde_json::to_string_pretty(&results)?);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcript_retrieval_core::embedding::HashingProvider;
    use transcript_retrieval_core::lexical::LexicalEntry;
    use transcript_retrieval_core::models::{Chunk, DerivedSignals, Transcript};
    use transcript_retrieval_core::retrieve::RetrievalConfig;
    use transcript_retrieval_core::store::memory::InMemoryStore;
    use transcript_retrieval_core::store::Store;

    async fn seeded(embedder: &HashingProvider) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let texts = ["We discussed pricing and the discount.", "The weather was nice."];
        let transcript = Transcript::new("t1", texts.join(" "), 0);
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| Chunk::pending("t1", i as i64, text, 0, text.len(), 0))
            .collect();
        store.save_transcript(&transcript, &chunks).await.unwrap();
        for (chunk, text) in chunks.iter().zip(texts) {
            let claim = store.claim_chunk(&chunk.id, 1).await.unwrap().unwrap();
            let signals = DerivedSignals {
                entities: Vec::new(),
                topics: Default::default(),
                qualification_tags: Default::default(),
                embedding: embedder.embed_text(text),
                lexical: LexicalEntry::index(text),
            };
            assert!(store.complete_chunk(&claim, &signals, 2).await.unwrap());
        }
        store
    }

    #[tokio::test]
    async fn test_search_embeds_query_text() {
        let embedder = HashingProvider::new(64);
        let store = seeded(&embedder).await;
        let service = SearchService::new(
            Retriever::new(store, RetrievalConfig::default()),
            Some(Arc::new(HashingProvider::new(64))),
        );
        let request = SearchRequest {
            query: "pricing discount".to_string(),
            transcript_ids: vec!["t1".to_string()],
            ..SearchRequest::default()
        };
        let results = service.search(&request).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.chunk_index, 0);
        assert!(results[0].vector_score > results[1].vector_score);
    }

    #[test]
    fn test_unknown_topic_is_invalid() {
        let request = SearchRequest {
            transcript_ids: vec!["t1".to_string()],
            topics: vec!["astrology".to_string()],
            ..SearchRequest::default()
        };
        assert!(matches!(
            request.to_query(),
            Err(RetrievalError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_scope_is_invalid() {
        let service = SearchService::new(
            Retriever::new(Arc::new(InMemoryStore::new()), RetrievalConfig::default()),
            None,
        );
        let err = service
            .search(&SearchRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));
    }
}
