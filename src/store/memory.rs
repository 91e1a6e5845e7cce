//! In-memory [`IndexBackend`] for testing.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over the scope's entries.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IndexEntry, Scope};

use super::{rank_by_distance, IndexBackend, Neighbor};

/// Process-local index backend. Nothing survives the process.
pub struct InMemoryBackend {
    indexes: RwLock<HashMap<Scope, Vec<IndexEntry>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    async fn open(&self, scope: &Scope) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        indexes.entry(scope.clone()).or_default();
        Ok(())
    }

    async fn exists(&self, scope: &Scope) -> Result<bool> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(indexes.contains_key(scope))
    }

    async fn append(&self, scope: &Scope, entries: Vec<IndexEntry>) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        indexes.entry(scope.clone()).or_default().extend(entries);
        Ok(())
    }

    async fn nearest(
        &self,
        scope: &Scope,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(indexes
            .get(scope)
            .map(|entries| rank_by_distance(entries, vector, limit))
            .unwrap_or_default())
    }

    async fn remove_card(&self, scope: &Scope, card_name: &str) -> Result<usize> {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = indexes.get_mut(scope) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| e.metadata.card_name != card_name);
        Ok(before - entries.len())
    }

    async fn drop_index(&self, scope: &Scope) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        indexes.remove(scope);
        Ok(())
    }

    async fn count(&self, scope: &Scope) -> Result<usize> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(indexes.get(scope).map(Vec::len).unwrap_or(0))
    }
}
