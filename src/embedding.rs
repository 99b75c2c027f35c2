//! Embedding providers.
//!
//! [`Embedder`] is the seam between the indexer and whatever turns text into
//! vectors. Providers have a fixed output dimension which must match the
//! vector index they feed.

use std::{sync::OnceLock, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    config::{EmbeddingBackend, EmbeddingConfig},
    error::{Error, Result},
    text_util::tokenize,
};

pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Embed several texts in one provider call, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::Embedding("provider returned no vector".into()))
    }
}

/// Deterministic offline embeddings via the hashing trick.
///
/// Every token is hashed to a bucket and a sign; the bucket counts are
/// L2-normalized. Texts sharing vocabulary get a positive cosine
/// similarity, texts without common tokens are close to orthogonal.
#[derive(Debug, Clone, Copy)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut tokens = tokenize(text);
        if tokens.is_empty() {
            // Punctuation-only text still gets a non-zero vector.
            tokens.push(text.trim().to_string());
        }

        for token in &tokens {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(prefix) % self.dimension as u64)
                as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        // Opposite signs can cancel out completely.
        if vector.iter().all(|v| *v == 0.0) {
            vector[0] = 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

impl Embedder for HashedEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embeddings from an Ollama server (`POST /api/embed`).
///
/// The HTTP client is built on first use.
#[derive(Debug)]
pub struct OllamaEmbedder {
    url: String,
    model: String,
    dimension: usize,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            timeout: Duration::from_secs(config.timeout_secs),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        tracing::debug!(url = %self.url, model = %self.model, "embedding client ready");
        Ok(self.client.get_or_init(|| client))
    }
}

impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client()?
            .post(format!("{}/api/embed", self.url))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .map_err(|e| Error::Embedding(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Embedding(format!(
                "server returned {status}: {body}"
            )));
        }

        let parsed: EmbedResponse = response.json()?;
        if parsed.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        for vector in &parsed.embeddings {
            if vector.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }
        Ok(parsed.embeddings)
    }
}

/// The configured embedding backend.
#[derive(Debug)]
pub enum EmbeddingProvider {
    Hashed(HashedEmbedder),
    Ollama(OllamaEmbedder),
}

impl EmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        match config.provider {
            EmbeddingBackend::Hashed => {
                EmbeddingProvider::Hashed(HashedEmbedder::new(config.dimension))
            }
            EmbeddingBackend::Ollama => {
                EmbeddingProvider::Ollama(OllamaEmbedder::new(config))
            }
        }
    }
}

impl Embedder for EmbeddingProvider {
    fn dimension(&self) -> usize {
        match self {
            EmbeddingProvider::Hashed(e) => e.dimension(),
            EmbeddingProvider::Ollama(e) => e.dimension(),
        }
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self {
            EmbeddingProvider::Hashed(e) => e.embed_batch(texts),
            EmbeddingProvider::Ollama(e) => e.embed_batch(texts),
        }
    }
}
