//! Card-level search over a scope.
//!
//! # Semantic path
//!
//! 1. Make sure the scope's index is consistent (best effort).
//! 2. Fetch `limit × over_fetch` chunk hits from the vector index.
//! 3. Group hits by card. A card's relevance is the **mean** of its chunk
//!    scores; its best chunks (up to `max_excerpts`) become excerpts.
//! 4. Sort cards by relevance (desc, stable) and truncate to `limit`.
//!
//! # Text fallback
//!
//! Used when the embedding provider is not ready or the vector path fails.
//! Each card's searchable text scores +10 when it contains the whole query
//! (case-insensitive) and +1 per occurrence of every query word longer
//! than two characters. The total is divided by 10; zero scores are
//! dropped.
//!
//! Both paths return [`CardSearchResult`]s, so callers cannot tell them
//! apart by shape.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cards::CardSource;
use crate::config::SearchConfig;
use crate::consistency::ConsistencyManager;
use crate::error::Result;
use crate::models::{CardSearchResult, ChunkHit, Excerpt, MemoryCard, Scope};

/// Chunk hits of one card after grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct CardHits {
    pub card_name: String,
    /// Mean of the card's chunk scores.
    pub score: f64,
    /// Best chunks first.
    pub excerpts: Vec<Excerpt>,
}

/// Group chunk hits by card and rank the cards by mean chunk score.
///
/// Cards and excerpts with equal scores keep the order in which they were
/// first encountered in `hits`.
pub fn aggregate_hits(hits: Vec<ChunkHit>, max_excerpts: usize) -> Vec<CardHits> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ChunkHit>> = HashMap::new();

    for hit in hits {
        if !groups.contains_key(&hit.card_name) {
            order.push(hit.card_name.clone());
        }
        groups.entry(hit.card_name.clone()).or_default().push(hit);
    }

    let mut cards: Vec<CardHits> = order
        .into_iter()
        .filter_map(|name| {
            let mut chunk_hits = groups.remove(&name)?;
            let score = chunk_hits.iter().map(|h| h.score).sum::<f64>() / chunk_hits.len() as f64;

            sort_desc(&mut chunk_hits, |h| h.score);
            let excerpts = chunk_hits
                .into_iter()
                .take(max_excerpts)
                .map(|h| Excerpt {
                    text: h.text,
                    score: h.score,
                    chunk_index: h.chunk_index,
                    total_chunks: h.total_chunks,
                })
                .collect();

            Some(CardHits {
                card_name: name,
                score,
                excerpts,
            })
        })
        .collect();

    sort_desc(&mut cards, |c| c.score);
    cards
}

/// Stable descending sort on a float key.
fn sort_desc<T>(items: &mut [T], key: impl Fn(&T) -> f64) {
    items.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Heuristic relevance of `text` to `query`, before normalization.
///
/// +10 for a case-insensitive substring match of the whole query, +1 per
/// occurrence of each query word longer than two characters.
pub fn text_relevance(text: &str, query: &str) -> f64 {
    let haystack = text.to_lowercase();
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    if haystack.contains(&needle) {
        score += 10.0;
    }
    for word in needle.split_whitespace() {
        if word.chars().count() > 2 {
            score += haystack.matches(word).count() as f64;
        }
    }
    score
}

pub struct SearchEngine {
    manager: Arc<ConsistencyManager>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(manager: Arc<ConsistencyManager>, config: SearchConfig) -> Self {
        Self { manager, config }
    }

    fn cards(&self) -> &Arc<dyn CardSource> {
        self.manager.cards()
    }

    /// Search `scope` for `query`, returning at most `limit` cards.
    ///
    /// Never fails: vector-path errors fall back to text scoring, and a
    /// card store that cannot be read yields no results.
    pub async fn search(&self, scope: &Scope, query: &str, limit: usize) -> Vec<CardSearchResult> {
        if query.trim().is_empty() || limit == 0 {
            return Vec::new();
        }

        if self.manager.embedder_ready().await {
            match self.semantic_search(scope, query, limit).await {
                Ok(results) => return results,
                Err(e) => {
                    warn!(%scope, error = %e, "semantic search failed, falling back to text search")
                }
            }
        } else {
            debug!(%scope, "embedding provider not ready, using text search");
        }

        match self.text_search(scope, query, limit).await {
            Ok(results) => results,
            Err(e) => {
                warn!(%scope, error = %e, "text search failed");
                Vec::new()
            }
        }
    }

    async fn semantic_search(
        &self,
        scope: &Scope,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CardSearchResult>> {
        self.manager.ensure_scope_consistent(scope).await;

        let fetch = limit.saturating_mul(self.config.over_fetch.max(1));
        let hits = self.manager.store().query(scope, query, fetch).await?;
        debug!(%scope, hits = hits.len(), fetch, "vector query complete");

        let grouped = aggregate_hits(hits, self.config.max_excerpts);
        let mut by_name: HashMap<String, MemoryCard> = self
            .cards()
            .list_cards(scope)
            .await?
            .into_iter()
            .map(|card| (card.name.clone(), card))
            .collect();

        Ok(grouped
            .into_iter()
            .filter_map(|hits| {
                // Cards deleted since indexing are dropped.
                let card = by_name.remove(&hits.card_name)?;
                Some(CardSearchResult {
                    card,
                    relevance_score: hits.score,
                    excerpts: hits.excerpts,
                })
            })
            .take(limit)
            .collect())
    }

    async fn text_search(
        &self,
        scope: &Scope,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CardSearchResult>> {
        let splitter = self.manager.splitter();
        let mut results: Vec<CardSearchResult> = Vec::new();

        for card in self.cards().list_cards(scope).await? {
            let text = card.searchable_text();
            let raw = text_relevance(&text, query);
            if raw <= 0.0 {
                continue;
            }

            let chunks = splitter.split(&text);
            let total = chunks.len();
            let mut excerpts: Vec<Excerpt> = chunks
                .into_iter()
                .enumerate()
                .map(|(i, chunk)| Excerpt {
                    score: text_relevance(&chunk, query) / 10.0,
                    text: chunk,
                    chunk_index: i,
                    total_chunks: total,
                })
                .filter(|e| e.score > 0.0)
                .collect();
            sort_desc(&mut excerpts, |e| e.score);
            excerpts.truncate(self.config.max_excerpts);

            results.push(CardSearchResult {
                card,
                relevance_score: raw / 10.0,
                excerpts,
            });
        }

        sort_desc(&mut results, |r| r.relevance_score);
        results.truncate(limit);
        Ok(results)
    }
}
