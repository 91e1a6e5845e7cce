//! The memory index as one object.
//!
//! [`MemoryIndex`] owns everything with process lifetime: the open index
//! registry, the per-scope rebuild markers and locks, the embedding
//! provider. Create one with [`MemoryIndex::init`] and pass it by
//! reference; separate instances share nothing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cards::CardSource;
use crate::chunk::TextSplitter;
use crate::config::Config;
use crate::consistency::{Consistency, ConsistencyManager, RebuildReport};
use crate::context::{context_cards, ContextRequest};
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::metadata::{IndexMetadata, MetadataTracker};
use crate::models::{CardSearchResult, MemoryCard, Scope};
use crate::search::SearchEngine;
use crate::store::local::LocalIndexBackend;
use crate::store::{IndexBackend, VectorIndexStore};

/// Snapshot of a scope's index state.
#[derive(Debug, Clone)]
pub struct ScopeStatus {
    pub scope: Scope,
    pub metadata: Option<IndexMetadata>,
    pub consistency: Consistency,
    pub entries: usize,
    pub rebuilding: bool,
    pub embedder_ready: bool,
}

pub struct MemoryIndex {
    config: Config,
    manager: Arc<ConsistencyManager>,
    search: SearchEngine,
}

impl MemoryIndex {
    /// Build an index over `cards` with the on-disk backend at
    /// `config.storage.index_dir()`.
    pub async fn init(
        config: Config,
        cards: Arc<dyn CardSource>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let backend = Arc::new(LocalIndexBackend::new(config.storage.index_dir()));
        Self::with_backend(config, cards, embedder, backend).await
    }

    /// Like [`init`](Self::init) with a caller-supplied backend.
    pub async fn with_backend(
        config: Config,
        cards: Arc<dyn CardSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        backend: Arc<dyn IndexBackend>,
    ) -> Self {
        if !embedder.is_ready() {
            match embedder.initialize().await {
                Ok(()) => info!(model = %embedder.model_name(), "embedding provider ready"),
                Err(e) if config.embedding.is_enabled() => {
                    warn!(error = %e, "embedding provider unavailable, text search only until it recovers")
                }
                Err(e) => debug!(error = %e, "semantic search disabled"),
            }
        }

        let tracker = MetadataTracker::new(config.storage.index_dir(), embedder.model_name());
        let store = VectorIndexStore::new(backend, embedder);
        let manager = Arc::new(ConsistencyManager::new(
            cards,
            store,
            tracker,
            TextSplitter::from_config(&config.chunking),
        ));
        let search = SearchEngine::new(Arc::clone(&manager), config.search.clone());

        Self {
            config,
            manager,
            search,
        }
    }

    /// Wait for in-flight rebuilds and single-card updates, then release
    /// everything.
    pub async fn shutdown(self) {
        self.manager.quiesce().await;
        info!("memory index shut down");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConsistencyManager> {
        &self.manager
    }

    /// Best effort; never fails.
    pub async fn ensure_scope_consistent(&self, scope: &Scope) {
        self.manager.ensure_scope_consistent(scope).await
    }

    /// Index or re-index one card. Returns the number of chunks written.
    pub async fn index_document(&self, scope: &Scope, card: &MemoryCard) -> Result<usize> {
        self.manager.index_document(scope, card).await
    }

    /// `true` if the card had chunks or a recorded hash.
    pub async fn remove_document_from_index(&self, scope: &Scope, name: &str) -> Result<bool> {
        self.manager.remove_document(scope, name).await
    }

    /// Ranked cards with excerpts. `limit` defaults and clamps per
    /// `[search]` configuration.
    pub async fn search(
        &self,
        scope: &Scope,
        query: &str,
        limit: Option<usize>,
    ) -> Vec<CardSearchResult> {
        let limit = self.config.search.resolve_limit(limit);
        self.search.search(scope, query, limit).await
    }

    /// Explicit full rebuild; errors are returned, not swallowed.
    pub async fn rebuild(&self, scope: &Scope) -> Result<RebuildReport> {
        self.manager.rebuild_scope(scope).await
    }

    pub async fn status(&self, scope: &Scope) -> Result<ScopeStatus> {
        Ok(ScopeStatus {
            scope: scope.clone(),
            metadata: self.manager.tracker().load(scope).await?,
            consistency: self.manager.validate(scope).await?,
            entries: self.manager.store().entry_count(scope).await?,
            rebuilding: self.manager.is_rebuilding(scope),
            embedder_ready: self.manager.store().embedder().is_ready(),
        })
    }

    pub async fn context_cards(
        &self,
        scope: &Scope,
        request: &ContextRequest,
    ) -> Result<Vec<MemoryCard>> {
        context_cards(
            &self.search,
            self.manager.cards().as_ref(),
            self.manager.splitter(),
            scope,
            request,
        )
        .await
    }
}
