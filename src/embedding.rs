//! Embedding backend abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **openai** — calls the embeddings API with batching, retry, and backoff.
//! - **hash** — deterministic offline vectors derived from a sha256 digest;
//!   used by tests and air-gapped smoke runs.
//! - **disabled** — returns errors; the default when nothing is configured.
//!
//! Also provides the vector codec used by the index files:
//! [`vec_to_blob`] / [`blob_to_vec`] encode embedding vectors as
//! little-endian `f32` bytes, and [`cosine_similarity`] scores them.
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! HTTP 429 and 5xx retry with 1s, 2s, 4s, ... delays; other 4xx fail
//! immediately; network errors retry. All failures surface as
//! [`PipelineError::EmbeddingBackend`].

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::PipelineError;

/// Trait for embedding providers.
///
/// Carries the identity the index version record needs; the embedding
/// computation itself lives in [`embed_texts`].
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in the index version record.
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;
}

/// Create the provider named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>, PipelineError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "hash" => Ok(Box::new(HashProvider {
            dims: config.dims.unwrap_or(64),
        })),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        other => Err(PipelineError::embedding(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Embed a batch of texts using the configured provider.
pub async fn embed_texts(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, PipelineError> {
    match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await,
        "hash" => Ok(texts
            .iter()
            .map(|t| hash_vector(t, config.dims.unwrap_or(64)))
            .collect()),
        "disabled" => Err(PipelineError::embedding(
            "embedding provider is disabled; set [embedding] provider in the config",
        )),
        other => Err(PipelineError::embedding(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Embed a single query text.
pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>, PipelineError> {
    let results = embed_texts(config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::embedding("empty embedding response"))
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ Hash Provider ============

/// Deterministic offline provider: expands a sha256 digest of the text into
/// a unit vector. No semantic meaning, but stable across runs, which is all
/// the pipeline's own tests and smoke runs need.
pub struct HashProvider {
    dims: usize,
}

impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash-sha256"
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn hash_vector(text: &str, dims: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dims);
    let mut counter = 0u32;
    'outer: loop {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for byte in digest {
            values.push(byte as f32 / 127.5 - 1.0);
            if values.len() == dims {
                break 'outer;
            }
        }
        counter += 1;
    }

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut values {
            *v /= norm;
        }
    }
    values
}

// ============ OpenAI Provider ============

/// Embedding provider backed by the OpenAI-compatible embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, PipelineError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| PipelineError::embedding("embedding.model required for the openai provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| PipelineError::embedding("embedding.dims required for the openai provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(PipelineError::embedding(
                "OPENAI_API_KEY environment variable not set",
            ));
        }

        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_openai(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, PipelineError> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| PipelineError::embedding("OPENAI_API_KEY not set"))?;
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| PipelineError::embedding("embedding.model required"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(PipelineError::embedding)?;

    let url = format!("{}/embeddings", config.api_base.trim_end_matches('/'));
    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value =
                        response.json().await.map_err(PipelineError::embedding)?;
                    return parse_embedding_response(&json);
                }

                // Rate limited or server error: retry.
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(PipelineError::embedding(format!(
                        "embeddings API error {}: {}",
                        status, body_text
                    )));
                    continue;
                }

                // Other client errors don't retry.
                let body_text = response.text().await.unwrap_or_default();
                return Err(PipelineError::embedding(format!(
                    "embeddings API error {}: {}",
                    status, body_text
                )));
            }
            Err(e) => {
                last_err = Some(PipelineError::embedding(e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| PipelineError::embedding("embedding failed after retries")))
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, PipelineError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| PipelineError::embedding("invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| PipelineError::embedding("invalid embeddings response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a blob back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
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

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_config(dims: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hash".to_string(),
            dims: Some(dims),
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn hash_provider_is_deterministic() {
        let config = hash_config(64);
        let a = embed_texts(&config, &["the deploy runbook".to_string()])
            .await
            .unwrap();
        let b = embed_texts(&config, &["the deploy runbook".to_string()])
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);

        let other = embed_query(&config, "unrelated text").await.unwrap();
        assert_ne!(a[0], other);
    }

    #[tokio::test]
    async fn hash_vectors_are_unit_length() {
        let config = hash_config(48);
        let v = embed_query(&config, "some text").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn disabled_provider_errors() {
        let config = EmbeddingConfig::default();
        let err = embed_texts(&config, &["text".to_string()]).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmbeddingBackend(_)));
    }

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
