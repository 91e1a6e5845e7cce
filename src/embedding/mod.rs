//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: never ready; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: runs a model in-process via fastembed (feature
//!   `local-embeddings-fastembed`); no network calls after model download.
//!
//! The index treats the provider as a black box: `embed(text) -> vector`
//! plus a readiness flag. When the provider is not ready, search falls back
//! to text scoring and index writes report
//! [`IndexError::EmbeddingUnavailable`].
//!
//! # Provider Selection
//!
//! ```rust
//! # use cardbase::config::EmbeddingConfig;
//! # use cardbase::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! assert!(!provider.is_ready());
//! ```

#[cfg(feature = "local-embeddings-fastembed")]
mod local;
mod remote;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalProvider;
pub use remote::{OllamaProvider, OpenAIProvider};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in index metadata. Changing it invalidates
    /// every index built with the previous model.
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Whether [`embed`](EmbeddingProvider::embed) can be expected to work.
    fn is_ready(&self) -> bool;

    /// Load or probe the backend. Safe to call repeatedly; a no-op once
    /// the provider is ready.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ============ Disabled Provider ============

/// A provider that is never ready.
///
/// Used when `embedding.provider = "disabled"`; every search takes the text
/// fallback path.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    fn is_ready(&self) -> bool {
        false
    }

    async fn initialize(&self) -> Result<()> {
        Err(IndexError::EmbeddingUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(IndexError::EmbeddingUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

/// Create the [`EmbeddingProvider`] named by the configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(IndexError::Config(
            "local embedding provider requires --features local-embeddings-fastembed".to_string(),
        )),
        other => Err(IndexError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Reject input the backends cannot embed.
pub(crate) fn check_input(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(IndexError::Embedding(
            "cannot embed empty text".to_string(),
        ));
    }
    Ok(())
}

/// Reject vectors whose length differs from the configured dimensionality.
pub(crate) fn check_dims(expected: usize, vector: Vec<f32>) -> Result<Vec<f32>> {
    if vector.len() != expected {
        return Err(IndexError::Embedding(format!(
            "unexpected embedding dimensions: expected {}, got {}",
            expected,
            vector.len()
        )));
    }
    Ok(vector)
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero vectors.
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
