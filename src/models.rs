//! Core data models used throughout cardbase.
//!
//! These types represent the memory cards, scopes, chunks, index entries,
//! and search results that flow through the indexing and retrieval pipeline.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

/// Validated initiative identifier. Only [`Scope::parse`] creates one, so
/// every id is safe to use as a directory name and chunk-id segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InitiativeId(String);

impl InitiativeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InitiativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Isolation namespace for an index: the global knowledge base or one
/// initiative.
///
/// On the wire and on disk a scope is a bare string; `"global"` is the
/// reserved name of the global namespace and anything else is an
/// initiative id. [`Scope::parse`] is the only place that mapping happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Global,
    Initiative(InitiativeId),
}

impl Scope {
    pub const GLOBAL: &'static str = "global";

    /// Normalize a wire string into a scope.
    ///
    /// Initiative ids become directory names and chunk-id prefixes, so they
    /// may not be empty, contain path separators or `::`, or start with `.`.
    pub fn parse(raw: &str) -> Result<Scope> {
        let raw = raw.trim();
        if raw == Self::GLOBAL {
            return Ok(Scope::Global);
        }
        if raw.is_empty()
            || raw.starts_with('.')
            || raw.contains('/')
            || raw.contains('\\')
            || raw.contains("::")
        {
            return Err(IndexError::InvalidScope(raw.to_string()));
        }
        Ok(Scope::Initiative(InitiativeId(raw.to_string())))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Scope::Global => Self::GLOBAL,
            Scope::Initiative(id) => id.as_str(),
        }
    }

    /// Directory of this scope relative to an index or knowledge root.
    pub fn relative_dir(&self) -> PathBuf {
        match self {
            Scope::Global => PathBuf::from(Self::GLOBAL),
            Scope::Initiative(id) => PathBuf::from("initiatives").join(id.as_str()),
        }
    }

    /// Human-readable label used in CLI output.
    pub fn describe(&self) -> String {
        match self {
            Scope::Global => "global scope".to_string(),
            Scope::Initiative(id) => format!("initiative '{}'", id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::parse(s)
    }
}

impl TryFrom<String> for Scope {
    type Error = IndexError;

    fn try_from(value: String) -> Result<Self> {
        Scope::parse(&value)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.as_str().to_string()
    }
}

/// When a card is pulled into an agent's working context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPolicy {
    /// Included only when a semantic query finds it.
    #[default]
    Auto,
    /// Always included.
    Always,
}

impl ContextPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextPolicy::Auto => "auto",
            ContextPolicy::Always => "always",
        }
    }
}

impl FromStr for ContextPolicy {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(ContextPolicy::Auto),
            "always" => Ok(ContextPolicy::Always),
            other => Err(IndexError::InvalidCard(format!(
                "unknown context policy '{}': expected auto or always",
                other
            ))),
        }
    }
}

/// A memory card. Owned by the card store; the index only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCard {
    /// Unique key within a scope (also the file stem).
    pub name: String,
    pub title: String,
    /// Markdown body.
    pub content: String,
    #[serde(rename = "contextIncludingPolicy", default)]
    pub context_policy: ContextPolicy,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MemoryCard {
    /// The text that gets chunked and embedded: title, blank line, body.
    pub fn searchable_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.content)
    }
}

/// A bounded-size fragment of a card, ready for embedding.
///
/// Chunks of one card are always replaced together: `total_chunks` only
/// means something for the full set.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `"{scope}::{card}::chunk{index}"`, see [`crate::chunk::chunk_id`].
    pub id: String,
    pub card_name: String,
    pub scope: Scope,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
}

/// Metadata persisted alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub card_name: String,
    /// Stored as a plain string so entries can be checked against the
    /// namespace they were loaded from.
    pub scope: String,
    pub title: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "contextIncludingPolicy", default)]
    pub context_policy: ContextPolicy,
    pub text_content: String,
}

impl EntryMetadata {
    pub fn for_chunk(chunk: &Chunk, card: &MemoryCard) -> Self {
        Self {
            card_name: chunk.card_name.clone(),
            scope: chunk.scope.as_str().to_string(),
            title: card.title.clone(),
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            tags: card.tags.clone(),
            context_policy: card.context_policy,
            text_content: chunk.text.clone(),
        }
    }
}

/// Persisted unit of the vector index: one embedded chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

/// A chunk-level result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    pub card_name: String,
    /// Similarity in `[0.0, 1.0]`, higher is more relevant.
    pub score: f64,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
}

/// A chunk surfaced next to a search result as supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Excerpt {
    pub text: String,
    pub score: f64,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// A card-level search result. Both the semantic and the text-fallback
/// paths produce this shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSearchResult {
    pub card: MemoryCard,
    pub relevance_score: f64,
    pub excerpts: Vec<Excerpt>,
}
