//! Embedding provider construction and remote clients.
//!
//! The [`EmbeddingProvider`] trait, the offline [`HashingProvider`], and the
//! vector utilities live in the core crate. This module adds:
//! - **[`DisabledProvider`]**: every call fails permanently; used when
//!   embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `/v1/embeddings`
//!   endpoint.
//!
//! # Error classification
//!
//! Remote failures are mapped onto [`ServiceError`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → transient
//! - network errors and timeouts → transient
//! - HTTP 4xx (client error, not 429) → permanent
//! - malformed response or wrong dimensionality → permanent
//!
//! Providers never retry on their own; the indexer owns the attempt
//! budget and the backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

pub use transcript_retrieval_core::embedding::{EmbeddingProvider, HashingProvider};
use transcript_retrieval_core::ServiceError;

use crate::config::EmbeddingConfig;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Build the provider selected by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "hashing" => {
            let dims = config
                .dims
                .ok_or_else(|| anyhow::anyhow!("embedding.dims required for hashing provider"))?;
            Ok(Arc::new(HashingProvider::new(dims)))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn classify_status(service: &str, status: StatusCode, body: &str) -> ServiceError {
    let message = format!("{} error {}: {}", service, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ServiceError::Transient(message)
    } else {
        ServiceError::Permanent(message)
    }
}

/// Classify a transport-level failure.
pub(crate) fn classify_transport(service: &str, err: reqwest::Error) -> ServiceError {
    if err.is_builder() {
        ServiceError::Permanent(format!("{} request invalid: {}", service, err))
    } else {
        ServiceError::Transient(format!("{} request failed: {}", service, err))
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Err(ServiceError::permanent("embedding provider is disabled"))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using an OpenAI-compatible API.
///
/// Requires the `OPENAI_API_KEY` environment variable. `embedding.url`
/// overrides the base URL (default `https://api.openai.com`).
pub struct OpenAIProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("embedding", e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status("embedding", status, &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::permanent(format!("invalid embedding response: {}", e)))?;
        let vectors = parse_openai_response(&json)?;

        if vectors.len() != texts.len() {
            return Err(ServiceError::permanent(format!(
                "embedding response has {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(ServiceError::permanent(format!(
                "embedding has {} dims, expected {}",
                bad.len(),
                self.dims
            )));
        }
        Ok(vectors)
    }
}

/// Parse an embeddings API response, ordering by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ServiceError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ServiceError::permanent("invalid embedding response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ServiceError::permanent("invalid embedding response: missing embedding"))?;

        let mut vec = Vec::with_capacity(embedding.len());
        for v in embedding {
            let x = v.as_f64().ok_or_else(|| {
                ServiceError::permanent("invalid embedding response: non-numeric value")
            })?;
            vec.push(x as f32);
        }

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
