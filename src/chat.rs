//! Chat/synthesis provider abstraction.
//!
//! The synthesis model is an opaque remote capability. [`ChatBackend`] is
//! the seam the research chain talks through; [`CohereChat`] is the
//! production implementation. Synthesis calls are long-running, so the
//! timeout budget here is minutes where the embedding client's is seconds.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::config::ChatConfig;

/// A remote chat/completion capability.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn model_id(&self) -> &str;

    /// Send one prompt and return the model's text output.
    async fn chat(&self, prompt: &str) -> Result<String>;
}

/// Create the configured [`ChatBackend`]. Missing credentials are fatal
/// at startup.
pub fn create_backend(config: &ChatConfig) -> Result<Arc<dyn ChatBackend>> {
    Ok(Arc::new(CohereChat::new(config)?))
}

/// Chat provider using the Cohere `/v1/chat` endpoint.
///
/// Requires the `COHERE_API_KEY` environment variable.
pub struct CohereChat {
    model: String,
    temperature: f32,
    api_key: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl CohereChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var("COHERE_API_KEY")
            .context("COHERE_API_KEY environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
            client,
            backoff: BackoffPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl ChatBackend for CohereChat {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn chat(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "message": prompt,
            "temperature": self.temperature,
        });

        let mut last_err = None;

        for attempt in 0..=self.backoff.max_retries {
            self.backoff.wait(attempt).await;

            let resp = self
                .client
                .post("https://api.cohere.com/v1/chat")
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
                        match json.get("text").and_then(|t| t.as_str()) {
                            Some(text) => return Ok(text.to_string()),
                            None => {
                                tracing::warn!(attempt, "chat response missing text field");
                                last_err =
                                    Some(anyhow::anyhow!("Invalid chat response: missing text"));
                                continue;
                            }
                        }
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Chat API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Chat API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Chat call failed after retries")))
    }
}
