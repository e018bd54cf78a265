//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, an offline [`HashingProvider`], and pure helpers for vector
//! serialization and similarity.
//!
//! Remote providers (OpenAI-compatible HTTP) live in the application crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::ServiceError;
use crate::lexical::tokenize;

/// Trait for embedding providers.
///
/// `embed` returns one fixed-length vector per input text, in input order.
/// Implementations classify failures as [`ServiceError::Transient`] or
/// [`ServiceError::Permanent`] and never retry internally; the indexer
/// owns the retry budget.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// Embed a single text.
pub async fn embed_one(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, ServiceError> {
    let vectors = provider.embed(&[text.to_string()]).await?;
    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::permanent("empty embedding response"))?;
    if vector.len() != provider.dims() {
        return Err(ServiceError::permanent(format!(
            "embedding has {} dims, expected {}",
            vector.len(),
            provider.dims()
        )));
    }
    Ok(vector)
}

/// Deterministic feature-hashing embedder.
///
/// Each lexical token is hashed into one of `dims` buckets with a signed
/// weight, and the result is L2-normalized. Texts sharing vocabulary land
/// close together, which is enough for offline use and tests.
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if let Some(blank) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(ServiceError::permanent(format!(
                "text {} is empty",
                blank
            )));
        }
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use transcript_retrieval_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

/// Linearly rescale a cosine similarity from `[-1, 1]` to `[0, 1]`.
pub fn rescale_cosine(similarity: f64) -> f64 {
    ((similarity + 1.0) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_rescale_cosine() {
        assert_eq!(rescale_cosine(-1.0), 0.0);
        assert_eq!(rescale_cosine(0.0), 0.5);
        assert_eq!(rescale_cosine(1.0), 1.0);
    }

    #[test]
    fn test_hashing_provider_is_deterministic_and_normalized() {
        let p = HashingProvider::new(64);
        let a = p.embed_text("pricing discount for annual contract");
        let b = p.embed_text("pricing discount for annual contract");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_provider_shared_vocabulary_is_closer() {
        let p = HashingProvider::new(256);
        let q = p.embed_text("security review");
        let near = p.embed_text("the security review is next week");
        let far = p.embed_text("lunch was great yesterday");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_hashing_provider_rejects_blank_text() {
        let p = HashingProvider::new(8);
        let err = p.embed(&["   ".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_embed_one() {
        let p = HashingProvider::new(16);
        let v = embed_one(&p, "renewal timeline").await.unwrap();
        assert_eq!(v.len(), 16);
    }
}
