//! Selecting the memory cards that go into an agent's working context.
//!
//! Cards with the `always` policy are always included. Semantic queries add
//! further cards: every query is split like card text, each piece is
//! searched, and hits are merged by card name keeping the best score.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::cards::CardSource;
use crate::chunk::TextSplitter;
use crate::error::Result;
use crate::models::{ContextPolicy, MemoryCard, Scope};
use crate::search::SearchEngine;

/// Results fetched per query piece.
pub const CONTEXT_QUERY_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    /// Include every card, not only `always` ones.
    pub include_all: bool,
    pub semantic_queries: Vec<String>,
}

/// Base cards first (in store order), then semantic additions by
/// descending score.
pub async fn context_cards(
    engine: &SearchEngine,
    cards: &dyn CardSource,
    splitter: &TextSplitter,
    scope: &Scope,
    request: &ContextRequest,
) -> Result<Vec<MemoryCard>> {
    let mut selected: Vec<MemoryCard> = cards
        .list_cards(scope)
        .await?
        .into_iter()
        .filter(|card| request.include_all || card.context_policy == ContextPolicy::Always)
        .collect();

    if request.semantic_queries.is_empty() {
        return Ok(selected);
    }

    let included: HashSet<String> = selected.iter().map(|c| c.name.clone()).collect();
    let mut found: Vec<(MemoryCard, f64)> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for query in &request.semantic_queries {
        let pieces = splitter.split(query);
        if pieces.is_empty() {
            warn!(%scope, "ignoring empty context query");
        }
        for piece in pieces {
            for result in engine.search(scope, &piece, CONTEXT_QUERY_LIMIT).await {
                let card = result.card;
                if card.context_policy == ContextPolicy::Always || included.contains(&card.name) {
                    continue;
                }
                match position.get(&card.name) {
                    Some(&i) => {
                        if found[i].1 < result.relevance_score {
                            found[i].1 = result.relevance_score;
                        }
                    }
                    None => {
                        position.insert(card.name.clone(), found.len());
                        found.push((card, result.relevance_score));
                    }
                }
            }
        }
    }

    found.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    selected.extend(found.into_iter().map(|(card, _)| card));
    Ok(selected)
}
