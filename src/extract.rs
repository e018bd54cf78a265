//! Extraction service construction and the HTTP extractor client.
//!
//! [`KeywordExtractor`] (offline, rule based) lives in the core crate.
//! [`HttpExtractor`] posts chunk text to a remote model service and maps
//! its open-string tags onto the closed vocabularies, dropping anything
//! unknown.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

pub use transcript_retrieval_core::extract::{Extraction, Extractor, KeywordExtractor};
use transcript_retrieval_core::models::EntityMention;
use transcript_retrieval_core::vocab::{parse_tags, EntityType, QualificationTag, Topic};
use transcript_retrieval_core::ServiceError;

use crate::config::ExtractionConfig;
use crate::embedding::{classify_status, classify_transport};

/// Build the extractor selected by `extraction.provider`.
pub fn create_extractor(config: &ExtractionConfig) -> Result<Arc<dyn Extractor>> {
    match config.provider.as_str() {
        "keyword" => Ok(Arc::new(KeywordExtractor::new(
            config.competitors.clone(),
            config.products.clone(),
        ))),
        "http" => Ok(Arc::new(HttpExtractor::new(config)?)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(rename = "type")]
    entity_type: String,
    value: String,
    #[serde(default = "default_mention_count")]
    mention_count: u32,
}

fn default_mention_count() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    qualification_tags: Vec<String>,
}

/// Remote extraction service: `POST {url}` with `{"text": ...}`.
pub struct HttpExtractor {
    client: reqwest::Client,
    url: String,
}

impl HttpExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    fn name(&self) -> &str {
        "http"
    }

    async fn extract(&self, text: &str) -> Result<Extraction, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::permanent("chunk text is empty"));
        }

        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| classify_transport("extraction", e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status("extraction", status, &body_text));
        }

        let raw: RawExtraction = response
            .json()
            .await
            .map_err(|e| ServiceError::permanent(format!("invalid extraction response: {}", e)))?;
        Ok(into_vocabulary(raw))
    }
}

/// Map open strings onto the closed vocabularies.
fn into_vocabulary(raw: RawExtraction) -> Extraction {
    let (topics, rejected): (BTreeSet<Topic>, _) = parse_tags(&raw.topics);
    if !rejected.is_empty() {
        tracing::debug!(?rejected, "dropping unknown topics");
    }
    let (qualification_tags, rejected): (BTreeSet<QualificationTag>, _) =
        parse_tags(&raw.qualification_tags);
    if !rejected.is_empty() {
        tracing::debug!(?rejected, "dropping unknown qualification tags");
    }

    let mut entities: Vec<EntityMention> = Vec::with_capacity(raw.entities.len());
    for e in raw.entities {
        let value = e.value.trim();
        if value.is_empty() || e.mention_count == 0 {
            continue;
        }
        match e.entity_type.parse::<EntityType>() {
            Ok(entity_type) => entities.push(EntityMention::new(entity_type, value, e.mention_count)),
            Err(_) => tracing::debug!(entity_type = %e.entity_type, "dropping unknown entity type"),
        }
    }
    entities.sort();

    Extraction {
        entities,
        topics,
        qualification_tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_values_are_dropped() {
        let raw: RawExtraction = serde_json::from_value(serde_json::json!({
            "entities": [
                {"type": "Competitor", "value": "Gong", "mention_count": 2},
                {"type": "planet", "value": "Mars"},
                {"type": "person", "value": "  "}
            ],
            "topics": ["pricing", "weather"],
            "qualification_tags": ["Economic Buyer", "vibes"]
        }))
        .unwrap();

        let e = into_vocabulary(raw);
        assert_eq!(e.entities, vec![EntityMention::new(EntityType::Competitor, "Gong", 2)]);
        assert_eq!(e.topics.into_iter().collect::<Vec<_>>(), vec![Topic::Pricing]);
        assert_eq!(
            e.qualification_tags.into_iter().collect::<Vec<_>>(),
            vec![QualificationTag::EconomicBuyer]
        );
    }

    #[test]
    fn test_missing_fields_default() {
        let raw: RawExtraction = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(into_vocabulary(raw), Extraction::default());
    }

    #[test]
    fn test_create_keyword_extractor() {
        let extractor = create_extractor(&ExtractionConfig::default()).unwrap();
        assert_eq!(extractor.name(), "keyword");
    }

    #[test]
    fn test_http_requires_url() {
        let config = ExtractionConfig {
            provider: "http".to_string(),
            ..ExtractionConfig::default()
        };
        assert!(create_extractor(&config).is_err());
    }
}
