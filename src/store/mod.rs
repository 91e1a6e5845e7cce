//! Per-scope vector index storage.
//!
//! The [`IndexBackend`] trait is the persistence primitive: one independent
//! entry list per [`Scope`], with append, nearest-neighbor lookup, per-card
//! removal and whole-index deletion. Two backends ship with the crate:
//!
//! - [`local::LocalIndexBackend`]: one JSON file per scope under the index
//!   root, used by the CLI.
//! - [`memory::InMemoryBackend`]: process-local, for tests and embedding
//!   the index in other programs.
//!
//! [`VectorIndexStore`] sits on top of a backend and the embedding
//! provider. It embeds chunk and query text, converts backend distances to
//! scores and drops entries whose recorded scope disagrees with the scope
//! being queried.

pub mod local;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::{IndexError, Result};
use crate::models::{Chunk, ChunkHit, EntryMetadata, IndexEntry, Scope};

/// An index entry paired with its cosine distance from a query vector.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub entry: IndexEntry,
    /// `1 - cosine_similarity`, so `0.0` is identical direction.
    pub distance: f32,
}

/// Abstract storage for per-scope vector indexes.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`open`](IndexBackend::open) | Get or create the index for a scope |
/// | [`exists`](IndexBackend::exists) | Whether a readable index is present |
/// | [`append`](IndexBackend::append) | Add entries |
/// | [`nearest`](IndexBackend::nearest) | Closest entries to a vector |
/// | [`remove_card`](IndexBackend::remove_card) | Delete one card's entries |
/// | [`drop_index`](IndexBackend::drop_index) | Delete the whole index |
/// | [`count`](IndexBackend::count) | Number of stored entries |
///
/// Implementations must make concurrent `open` calls for one scope resolve
/// to the same logical index.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Create the backing structure for `scope` if absent. Idempotent.
    async fn open(&self, scope: &Scope) -> Result<()>;

    /// Whether the scope has an index that can be read, without creating
    /// one. An index that is present but unreadable is an error.
    async fn exists(&self, scope: &Scope) -> Result<bool>;

    /// Append entries to the scope's index, creating it if needed.
    async fn append(&self, scope: &Scope, entries: Vec<IndexEntry>) -> Result<()>;

    /// Up to `limit` entries closest to `vector`, nearest first.
    async fn nearest(&self, scope: &Scope, vector: &[f32], limit: usize)
        -> Result<Vec<Neighbor>>;

    /// Delete every entry for `card_name`; returns how many were removed.
    async fn remove_card(&self, scope: &Scope, card_name: &str) -> Result<usize>;

    /// Delete the scope's index entirely. A missing index is not an error.
    async fn drop_index(&self, scope: &Scope) -> Result<()>;

    /// Number of entries currently stored for `scope` (0 if no index).
    async fn count(&self, scope: &Scope) -> Result<usize>;
}

/// Rank `entries` by cosine distance to `vector`, nearest first.
///
/// Shared brute-force search used by both bundled backends. The sort is
/// stable, so equal distances keep insertion order.
pub(crate) fn rank_by_distance<'a, I>(entries: I, vector: &[f32], limit: usize) -> Vec<Neighbor>
where
    I: IntoIterator<Item = &'a IndexEntry>,
{
    let mut scored: Vec<Neighbor> = entries
        .into_iter()
        .map(|entry| Neighbor {
            distance: 1.0 - cosine_similarity(&entry.vector, vector),
            entry: entry.clone(),
        })
        .collect();

    scored.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(limit);
    scored
}

/// Embedding-aware façade over an [`IndexBackend`].
#[derive(Clone)]
pub struct VectorIndexStore {
    backend: Arc<dyn IndexBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl VectorIndexStore {
    pub fn new(backend: Arc<dyn IndexBackend>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { backend, embedder }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    fn require_ready(&self) -> Result<()> {
        if self.embedder.is_ready() {
            Ok(())
        } else {
            Err(IndexError::EmbeddingUnavailable(format!(
                "embedding provider '{}' is not ready",
                self.embedder.model_name()
            )))
        }
    }

    /// Get or create the on-disk index for `scope`.
    pub async fn get_or_create_index(&self, scope: &Scope) -> Result<()> {
        self.backend.open(scope).await
    }

    /// Whether `scope` has a readable index. Never creates one.
    pub async fn index_exists(&self, scope: &Scope) -> Result<bool> {
        self.backend.exists(scope).await
    }

    /// Embed one chunk and append it to the scope's index.
    pub async fn insert(&self, scope: &Scope, chunk: &Chunk, metadata: EntryMetadata) -> Result<()> {
        self.require_ready()?;
        let vector = self.embedder.embed(&chunk.text).await?;
        self.backend
            .append(
                scope,
                vec![IndexEntry {
                    id: chunk.id.clone(),
                    vector,
                    metadata,
                }],
            )
            .await
    }

    /// Embed a batch of chunks and append them with a single backend write.
    ///
    /// Nothing is written if any embedding fails.
    pub async fn insert_all(
        &self,
        scope: &Scope,
        chunks: Vec<(Chunk, EntryMetadata)>,
    ) -> Result<usize> {
        self.require_ready()?;
        let mut entries = Vec::with_capacity(chunks.len());
        for (chunk, metadata) in chunks {
            let vector = self.embedder.embed(&chunk.text).await?;
            entries.push(IndexEntry {
                id: chunk.id,
                vector,
                metadata,
            });
        }

        let count = entries.len();
        if count > 0 {
            self.backend.append(scope, entries).await?;
        }
        Ok(count)
    }

    /// Embed `query` and return up to `limit` chunk hits from `scope`,
    /// most similar first.
    pub async fn query(&self, scope: &Scope, query: &str, limit: usize) -> Result<Vec<ChunkHit>> {
        self.require_ready()?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query).await?;
        let neighbors = self.backend.nearest(scope, &vector, limit).await?;

        let hits: Vec<ChunkHit> = neighbors
            .into_iter()
            .filter(|n| {
                let same = n.entry.metadata.scope == scope.as_str();
                if !same {
                    debug!(
                        %scope,
                        entry = %n.entry.id,
                        stored_scope = %n.entry.metadata.scope,
                        "dropping entry from foreign scope"
                    );
                }
                same
            })
            .map(|n| ChunkHit {
                score: (1.0 - f64::from(n.distance)).clamp(0.0, 1.0),
                card_name: n.entry.metadata.card_name,
                chunk_index: n.entry.metadata.chunk_index,
                total_chunks: n.entry.metadata.total_chunks,
                text: n.entry.metadata.text_content,
            })
            .take(limit)
            .collect();

        Ok(hits)
    }

    /// Delete every chunk of `card_name`; returns the number removed.
    pub async fn remove_chunks_for_document(&self, scope: &Scope, card_name: &str) -> Result<usize> {
        self.backend.remove_card(scope, card_name).await
    }

    /// Delete the scope's whole index.
    pub async fn remove_index(&self, scope: &Scope) -> Result<()> {
        self.backend.drop_index(scope).await
    }

    pub async fn entry_count(&self, scope: &Scope) -> Result<usize> {
        self.backend.count(scope).await
    }
}
