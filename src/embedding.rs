//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingBackend`] trait and two remote implementations:
//! - **[`CohereEmbedder`]** — calls the Cohere `/v1/embed` endpoint.
//! - **[`OpenAiEmbedder`]** — calls the OpenAI `/v1/embeddings` endpoint.
//!
//! Both are batched and retried under an injected [`BackoffPolicy`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and malformed response bodies → retry
//!
//! Also provides [`cosine_similarity`] for comparing embedding vectors.
//! The embedding model runs behind a network boundary; nothing in this
//! crate executes a model locally.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::config::EmbeddingConfig;

/// Whether a text is being embedded for storage or for querying.
/// Providers that distinguish the two (Cohere) encode it in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedInput {
    Document,
    Query,
}

/// A remote embedding capability.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier, used in cache keys so a model change invalidates
    /// cached vectors.
    fn model_id(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String], input: EmbedInput) -> Result<Vec<Vec<f32>>>;
}

/// Create the configured [`EmbeddingBackend`].
///
/// Fails when the provider name is unknown or the required API key is
/// missing from the environment — both are startup-fatal conditions.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "cohere" => Ok(Arc::new(CohereEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Cohere provider ============

/// Embedding provider using the Cohere API.
///
/// Requires the `COHERE_API_KEY` environment variable.
pub struct CohereEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl CohereEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("COHERE_API_KEY")
            .context("COHERE_API_KEY environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            client,
            backoff: BackoffPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for CohereEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], input: EmbedInput) -> Result<Vec<Vec<f32>>> {
        let input_type = match input {
            EmbedInput::Document => "search_document",
            EmbedInput::Query => "search_query",
        };
        let body = serde_json::json!({
            "model": self.model,
            "texts": texts,
            "input_type": input_type,
        });

        let mut last_err = None;

        for attempt in 0..=self.backoff.max_retries {
            self.backoff.wait(attempt).await;

            let resp = self
                .client
                .post("https://api.cohere.com/v1/embed")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        match parse_cohere_response(&json) {
                            Ok(vectors) => return Ok(vectors),
                            Err(e) => {
                                // Malformed body: treated as transient and
                                // retried under the same policy.
                                tracing::warn!(attempt, error = %e, "malformed embed response");
                                last_err = Some(e);
                                continue;
                            }
                        }
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Cohere API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Cohere API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

fn parse_cohere_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Cohere response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Cohere response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ OpenAI provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            client,
            backoff: BackoffPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], _input: EmbedInput) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.backoff.max_retries {
            self.backoff.wait(attempt).await;

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        match parse_openai_response(&json) {
                            Ok(vectors) => return Ok(vectors),
                            Err(e) => {
                                tracing::warn!(attempt, error = %e, "malformed embed response");
                                last_err = Some(e);
                                continue;
                            }
                        }
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Vector math ============

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
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

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn parse_cohere_shape() {
        let json = serde_json::json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] });
        let parsed = parse_cohere_response(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].len(), 2);
    }

    #[test]
    fn parse_cohere_rejects_missing_field() {
        let json = serde_json::json!({ "message": "rate limited" });
        assert!(parse_cohere_response(&json).is_err());
    }

    #[test]
    fn parse_openai_shape() {
        let json = serde_json::json!({
            "data": [ { "embedding": [0.5, -0.5] } ]
        });
        let parsed = parse_openai_response(&json).unwrap();
        assert_eq!(parsed, vec![vec![0.5, -0.5]]);
    }
}
