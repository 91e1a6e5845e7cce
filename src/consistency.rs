//! Keeps each scope's vector index in step with its cards.
//!
//! A scope is consistent when its metadata exists and was built with the
//! current embedding model, its index file is present and readable, the
//! metadata records exactly the current set of card names and every
//! recorded hash matches the card's current content. Anything else triggers
//! a full rebuild of the scope.
//!
//! Two layers of per-scope coordination:
//!
//! - a "rebuilding" marker, checked and set without waiting. Callers that
//!   find it set skip their check and trust the running rebuild.
//! - a mutation lock shared by rebuilds and single-card updates, so an
//!   incremental update never interleaves with a rebuild. The rebuild
//!   re-validates after taking it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cards::CardSource;
use crate::chunk::{chunk_card, TextSplitter};
use crate::error::{IndexError, Result};
use crate::metadata::{compute_hash, MetadataTracker};
use crate::models::{EntryMetadata, MemoryCard, Scope};
use crate::store::VectorIndexStore;

/// Why a scope needs rebuilding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    MissingMetadata,
    ModelChanged { recorded: String, current: String },
    IndexMissing,
    IndexUnreadable(String),
    /// Metadata records cards but the index holds no entries.
    IndexEmpty { recorded: usize },
    CardCountChanged { recorded: usize, current: usize },
    UnrecordedCard(String),
    ContentChanged(String),
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::MissingMetadata => write!(f, "no index metadata"),
            StaleReason::ModelChanged { recorded, current } => {
                write!(f, "embedding model changed from {} to {}", recorded, current)
            }
            StaleReason::IndexMissing => write!(f, "vector index missing"),
            StaleReason::IndexUnreadable(e) => write!(f, "vector index unreadable: {}", e),
            StaleReason::IndexEmpty { recorded } => write!(
                f,
                "vector index is empty but {} cards are recorded",
                recorded
            ),
            StaleReason::CardCountChanged { recorded, current } => write!(
                f,
                "card count mismatch: index has {}, store has {}",
                recorded, current
            ),
            StaleReason::UnrecordedCard(name) => write!(f, "new memory card '{}'", name),
            StaleReason::ContentChanged(name) => write!(f, "memory card '{}' changed", name),
        }
    }
}

/// Result of [`ConsistencyManager::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consistency {
    Consistent,
    Stale(StaleReason),
}

/// Summary of a completed rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub scope: Scope,
    pub cards: usize,
    pub chunks: usize,
}

/// Removes the scope's rebuilding marker when dropped.
struct RebuildMarker<'a> {
    markers: &'a Mutex<HashSet<Scope>>,
    scope: Scope,
}

impl Drop for RebuildMarker<'_> {
    fn drop(&mut self) {
        self.markers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.scope);
    }
}

pub struct ConsistencyManager {
    cards: Arc<dyn CardSource>,
    store: VectorIndexStore,
    tracker: MetadataTracker,
    splitter: TextSplitter,
    rebuilding: Mutex<HashSet<Scope>>,
    locks: Mutex<HashMap<Scope, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConsistencyManager {
    pub fn new(
        cards: Arc<dyn CardSource>,
        store: VectorIndexStore,
        tracker: MetadataTracker,
        splitter: TextSplitter,
    ) -> Self {
        Self {
            cards,
            store,
            tracker,
            splitter,
            rebuilding: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &VectorIndexStore {
        &self.store
    }

    pub fn tracker(&self) -> &MetadataTracker {
        &self.tracker
    }

    pub fn splitter(&self) -> &TextSplitter {
        &self.splitter
    }

    pub fn cards(&self) -> &Arc<dyn CardSource> {
        &self.cards
    }

    pub fn is_rebuilding(&self, scope: &Scope) -> bool {
        self.rebuilding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(scope)
    }

    fn try_mark(&self, scope: &Scope) -> Option<RebuildMarker<'_>> {
        let mut markers = self.rebuilding.lock().unwrap_or_else(PoisonError::into_inner);
        if !markers.insert(scope.clone()) {
            return None;
        }
        Some(RebuildMarker {
            markers: &self.rebuilding,
            scope: scope.clone(),
        })
    }

    fn scope_lock(&self, scope: &Scope) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(scope.clone()).or_default())
    }

    /// Wait until no scope has a rebuild or single-card update running.
    pub async fn quiesce(&self) {
        let locks: Vec<_> = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for lock in locks {
            drop(lock.lock().await);
        }
    }

    /// Whether the embedding provider can be used, initializing it on
    /// first need.
    pub async fn embedder_ready(&self) -> bool {
        let embedder = self.store.embedder();
        if embedder.is_ready() {
            return true;
        }
        match embedder.initialize().await {
            Ok(()) => embedder.is_ready(),
            Err(e) => {
                debug!(error = %e, "embedding provider not ready");
                false
            }
        }
    }

    async fn require_embedder(&self) -> Result<()> {
        if self.embedder_ready().await {
            Ok(())
        } else {
            Err(IndexError::EmbeddingUnavailable(format!(
                "embedding provider '{}' is not ready",
                self.store.embedder().model_name()
            )))
        }
    }

    /// Current cards paired with their serialized content.
    async fn snapshot(&self, scope: &Scope) -> Result<Vec<(MemoryCard, String)>> {
        let mut snapshot = Vec::new();
        for card in self.cards.list_cards(scope).await? {
            if let Some(content) = self.cards.card_content(scope, &card.name).await? {
                snapshot.push((card, content));
            }
        }
        Ok(snapshot)
    }

    /// Compare the scope's metadata against its current cards.
    pub async fn validate(&self, scope: &Scope) -> Result<Consistency> {
        let Some(metadata) = self.tracker.load(scope).await? else {
            return Ok(Consistency::Stale(StaleReason::MissingMetadata));
        };

        let current_model = self.store.embedder().model_name();
        if metadata.embedding_model != current_model {
            return Ok(Consistency::Stale(StaleReason::ModelChanged {
                recorded: metadata.embedding_model,
                current: current_model.to_string(),
            }));
        }

        match self.store.index_exists(scope).await {
            Ok(true) => {}
            Ok(false) => return Ok(Consistency::Stale(StaleReason::IndexMissing)),
            Err(e) if e.is_fatal() && !matches!(e, IndexError::Serialization { .. }) => {
                return Err(e)
            }
            Err(e) => {
                warn!(%scope, error = %e, "vector index unreadable");
                return Ok(Consistency::Stale(StaleReason::IndexUnreadable(e.to_string())));
            }
        }

        // Every card has a non-empty title, so it always yields a chunk.
        if !metadata.file_hashes.is_empty() && self.store.entry_count(scope).await? == 0 {
            return Ok(Consistency::Stale(StaleReason::IndexEmpty {
                recorded: metadata.file_hashes.len(),
            }));
        }

        let cards = self.cards.list_cards(scope).await?;
        if cards.len() != metadata.file_hashes.len() {
            return Ok(Consistency::Stale(StaleReason::CardCountChanged {
                recorded: metadata.file_hashes.len(),
                current: cards.len(),
            }));
        }

        // Equal counts plus every current name recorded means equal sets.
        if let Some(card) = cards
            .iter()
            .find(|c| !metadata.file_hashes.contains_key(&c.name))
        {
            return Ok(Consistency::Stale(StaleReason::UnrecordedCard(
                card.name.clone(),
            )));
        }

        for card in &cards {
            let current = self
                .cards
                .card_content(scope, &card.name)
                .await?
                .map(|content| compute_hash(&content));
            if current.as_ref() != metadata.file_hashes.get(&card.name) {
                return Ok(Consistency::Stale(StaleReason::ContentChanged(
                    card.name.clone(),
                )));
            }
        }

        Ok(Consistency::Consistent)
    }

    /// Make sure the scope's index reflects its cards, rebuilding if not.
    ///
    /// Never fails: problems are logged and the caller carries on, falling
    /// back to text search if the index is unusable.
    pub async fn ensure_scope_consistent(&self, scope: &Scope) {
        if !self.embedder_ready().await {
            return;
        }
        if self.is_rebuilding(scope) {
            debug!(%scope, "rebuild in progress, skipping consistency check");
            return;
        }

        let reason = match self.validate(scope).await {
            Ok(Consistency::Consistent) => return,
            Ok(Consistency::Stale(reason)) => reason,
            Err(e) => {
                warn!(%scope, error = %e, "failed to validate index consistency");
                return;
            }
        };

        let Some(_marker) = self.try_mark(scope) else {
            debug!(%scope, "rebuild started elsewhere, skipping");
            return;
        };
        info!(%scope, %reason, "index inconsistency detected, rebuilding");

        let lock = self.scope_lock(scope);
        let _held = lock.lock().await;

        // Another caller may have repaired the scope while we waited.
        match self.validate(scope).await {
            Ok(Consistency::Consistent) => {
                debug!(%scope, "index became consistent while waiting");
            }
            Ok(Consistency::Stale(_)) => {
                if let Err(e) = self.rebuild_locked(scope).await {
                    warn!(%scope, error = %e, "index rebuild failed");
                }
            }
            Err(e) => warn!(%scope, error = %e, "failed to validate index consistency"),
        }
    }

    /// Rebuild the scope's index unconditionally.
    ///
    /// Unlike [`ensure_scope_consistent`](Self::ensure_scope_consistent),
    /// failures are returned to the caller.
    pub async fn rebuild_scope(&self, scope: &Scope) -> Result<RebuildReport> {
        self.require_embedder().await?;
        let _marker = self.try_mark(scope);
        let lock = self.scope_lock(scope);
        let _held = lock.lock().await;
        self.rebuild_locked(scope).await
    }

    /// Delete, recreate and refill the index. Caller holds the scope lock.
    async fn rebuild_locked(&self, scope: &Scope) -> Result<RebuildReport> {
        let started = Instant::now();
        info!(%scope, "rebuilding memory card index");

        // Metadata goes first so an interrupted rebuild is detected as stale.
        self.tracker.clear(scope).await?;
        self.store.remove_index(scope).await?;
        self.store.get_or_create_index(scope).await?;

        let snapshot = self.snapshot(scope).await?;
        let mut chunks = 0;
        for (card, _) in &snapshot {
            chunks += self.index_chunks(scope, card).await?;
        }

        let metadata = self.tracker.build_fresh(
            snapshot
                .iter()
                .map(|(card, content)| (card.name.as_str(), content.as_str())),
        );
        self.tracker.save(scope, &metadata).await?;

        info!(
            %scope,
            cards = snapshot.len(),
            chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rebuilt memory card index"
        );
        Ok(RebuildReport {
            scope: scope.clone(),
            cards: snapshot.len(),
            chunks,
        })
    }

    /// Chunk, embed and append one card. Returns the chunk count.
    async fn index_chunks(&self, scope: &Scope, card: &MemoryCard) -> Result<usize> {
        let chunks = chunk_card(scope, card, &self.splitter);
        let batch = chunks
            .into_iter()
            .map(|chunk| {
                let metadata = EntryMetadata::for_chunk(&chunk, card);
                (chunk, metadata)
            })
            .collect();
        self.store.insert_all(scope, batch).await
    }

    /// Re-index a single card and patch its hash in the metadata.
    ///
    /// Runs a consistency pass first. The card's previous chunks are
    /// replaced, never merged. Returns the number of chunks written.
    pub async fn index_document(&self, scope: &Scope, card: &MemoryCard) -> Result<usize> {
        self.ensure_scope_consistent(scope).await;
        self.require_embedder().await?;

        let lock = self.scope_lock(scope);
        let _held = lock.lock().await;

        self.store.get_or_create_index(scope).await?;
        let replaced = self
            .store
            .remove_chunks_for_document(scope, &card.name)
            .await?;
        let written = self.index_chunks(scope, card).await?;

        let content = self.cards.card_content(scope, &card.name).await?;
        match (self.tracker.load(scope).await?, content) {
            (Some(mut metadata), Some(content)) => {
                metadata
                    .file_hashes
                    .insert(card.name.clone(), compute_hash(&content));
                metadata.embedding_model = self.tracker.model().to_string();
                self.tracker.save(scope, &metadata).await?;
            }
            _ => {
                let snapshot = self.snapshot(scope).await?;
                let metadata = self.tracker.build_fresh(
                    snapshot
                        .iter()
                        .map(|(card, content)| (card.name.as_str(), content.as_str())),
                );
                self.tracker.save(scope, &metadata).await?;
            }
        }

        debug!(%scope, card = %card.name, replaced, written, "indexed memory card");
        Ok(written)
    }

    /// Remove a card's chunks and its hash entry.
    ///
    /// Returns `true` if either the index or the metadata held anything for
    /// the card. Does not require the embedding provider.
    pub async fn remove_document(&self, scope: &Scope, name: &str) -> Result<bool> {
        let lock = self.scope_lock(scope);
        let _held = lock.lock().await;

        let removed = self.store.remove_chunks_for_document(scope, name).await?;

        let mut forgotten = false;
        if let Some(mut metadata) = self.tracker.load(scope).await? {
            if metadata.file_hashes.remove(name).is_some() {
                self.tracker.save(scope, &metadata).await?;
                forgotten = true;
            }
        }

        if removed > 0 || forgotten {
            info!(%scope, card = %name, chunks = removed, "removed memory card from index");
            Ok(true)
        } else {
            debug!(%scope, card = %name, "memory card was not indexed");
            Ok(false)
        }
    }
}
