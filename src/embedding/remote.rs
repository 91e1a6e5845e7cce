//! HTTP embedding providers (OpenAI, Ollama).
//!
//! Both use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{check_dims, check_input, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

fn build_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| IndexError::Config(format!("failed to build HTTP client: {}", e)))
}

/// POST `body` to `url` with retry/backoff and return the parsed JSON.
///
/// Connection failures and exhausted retries are reported as
/// [`IndexError::EmbeddingUnavailable`].
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, ?delay, url, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| IndexError::Embedding(format!("invalid response body: {}", e)));
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(IndexError::EmbeddingUnavailable(format!(
                        "{} returned {}: {}",
                        url, status, body_text
                    )));
                    continue;
                }

                return Err(IndexError::Embedding(format!(
                    "{} returned {}: {}",
                    url, status, body_text
                )));
            }
            Err(e) => {
                last_err = Some(IndexError::EmbeddingUnavailable(format!(
                    "connection to {} failed: {}",
                    url, e
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        IndexError::EmbeddingUnavailable("embedding failed after retries".to_string())
    }))
}

fn json_to_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    let array = value
        .as_array()
        .ok_or_else(|| IndexError::Embedding("embedding is not an array".to_string()))?;
    Ok(array
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Ready when `OPENAI_API_KEY` is present in the environment.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    max_retries: u32,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            max_retries: config.max_retries,
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            client: build_client(config)?,
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

    fn is_ready(&self) -> bool {
        self.api_key.is_some()
    }

    async fn initialize(&self) -> Result<()> {
        if self.api_key.is_none() {
            return Err(IndexError::EmbeddingUnavailable(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        check_input(text)?;
        let key = self.api_key.as_deref().ok_or_else(|| {
            IndexError::EmbeddingUnavailable("OPENAI_API_KEY not set".to_string())
        })?;

        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json = post_with_retry(
            &self.client,
            OPENAI_EMBEDDINGS_URL,
            Some(key),
            &body,
            self.max_retries,
        )
        .await?;

        let first = json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|item| item.get("embedding"))
            .ok_or_else(|| {
                IndexError::Embedding("invalid OpenAI response: missing data[0].embedding".into())
            })?;

        check_dims(self.dims, json_to_vector(first)?)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Becomes ready after a successful probe in
/// [`initialize`](EmbeddingProvider::initialize) or any successful embed.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
    ready: AtomicBool,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client: build_client(config)?,
            ready: AtomicBool::new(false),
        })
    }

    async fn request(&self, text: &str, max_retries: u32) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json = post_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url),
            None,
            &body,
            max_retries,
        )
        .await?;

        let first = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .and_then(|e| e.first())
            .ok_or_else(|| {
                IndexError::Embedding("invalid Ollama response: missing embeddings".into())
            })?;

        let vector = check_dims(self.dims, json_to_vector(first)?)?;
        self.ready.store(true, Ordering::Release);
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn initialize(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        // Probe once without retries so a missing daemon fails fast.
        self.request("ping", 0).await?;
        info!(model = %self.model, url = %self.url, "ollama embedding provider ready");
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        check_input(text)?;
        self.request(text, self.max_retries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_to_vector() {
        let v = json_to_vector(&serde_json::json!([0.5, -1.0, 2])).unwrap();
        assert_eq!(v, vec![0.5, -1.0, 2.0]);
        assert!(json_to_vector(&serde_json::json!({"x": 1})).is_err());
    }

    #[test]
    fn test_ollama_not_ready_until_probed() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            url: Some("http://127.0.0.1:9/".into()),
            ..EmbeddingConfig::default()
        };
        let provider = OllamaProvider::new(&config).unwrap();
        assert!(!provider.is_ready());
        assert_eq!(provider.url, "http://127.0.0.1:9");
    }
}
