//! In-process embeddings via fastembed.
//!
//! The model is downloaded on first use and cached by fastembed. Loading and
//! inference run on blocking threads.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use super::{check_dims, check_input, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};

type SharedModel = Arc<Mutex<fastembed::TextEmbedding>>;

/// Embedding provider for local inference.
pub struct LocalProvider {
    model: String,
    dims: usize,
    loaded: OnceCell<SharedModel>,
}

impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config.model.clone(),
            dims: config.dims,
            loaded: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<SharedModel> {
        let model = self
            .loaded
            .get_or_try_init(|| async {
                let kind = fastembed_model(&self.model)?;
                let name = self.model.clone();
                let loaded = tokio::task::spawn_blocking(move || {
                    fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(kind).with_show_download_progress(false),
                    )
                    .map_err(|e| {
                        IndexError::EmbeddingUnavailable(format!(
                            "failed to load local model {}: {}",
                            name, e
                        ))
                    })
                })
                .await
                .map_err(|e| IndexError::EmbeddingUnavailable(e.to_string()))??;
                info!(model = %self.model, "local embedding model loaded");
                Ok::<_, IndexError>(Arc::new(Mutex::new(loaded)))
            })
            .await?;
        Ok(Arc::clone(model))
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn is_ready(&self) -> bool {
        self.loaded.initialized()
    }

    async fn initialize(&self) -> Result<()> {
        self.model().await.map(|_| ())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        check_input(text)?;
        let model = self.model().await?;
        let input = vec![text.to_string()];

        let mut vectors = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| IndexError::Embedding("local model lock poisoned".to_string()))?;
            guard
                .embed(input, None)
                .map_err(|e| IndexError::Embedding(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| IndexError::Embedding(e.to_string()))??;

        let vector = vectors
            .pop()
            .ok_or_else(|| IndexError::Embedding("local model returned no vector".to_string()))?;
        check_dims(self.dims, vector)
    }
}

fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => Err(IndexError::Config(format!(
            "unsupported local embedding model: {}",
            other
        ))),
    }
}
