//! Recursive text splitter for memory cards.
//!
//! Splits card text into overlapping [`Chunk`]s that respect a configurable
//! `chunk_size` (in characters), preferring semantic boundaries.
//!
//! # Algorithm
//!
//! 1. Empty or whitespace-only text produces no chunks.
//! 2. Text no longer than `chunk_size` is returned untouched as one chunk.
//! 3. Otherwise the text is split on the coarsest separator (`\n\n`); any
//!    piece still longer than `chunk_size` is split again on the next,
//!    finer separator (`\n`, sentence endings, space, single characters).
//!    Separators stay attached to the piece they terminate, so pieces
//!    concatenate back to the original text.
//! 4. Pieces are packed greedily into a buffer. When the next piece would
//!    overflow the buffer, the buffer is closed as a chunk and the next
//!    buffer is seeded with the trailing `chunk_overlap` characters of the
//!    closed one.
//! 5. Chunks are trimmed; empty chunks are dropped.
//!
//! The output is fully determined by the input text and the configuration.
//!
//! # Example
//!
//! ```rust
//! use cardbase::chunk::TextSplitter;
//!
//! let splitter = TextSplitter::default();
//! assert_eq!(splitter.split("short note"), vec!["short note".to_string()]);
//! assert!(splitter.split("   ").is_empty());
//! ```

use crate::config::ChunkingConfig;
use crate::models::{Chunk, MemoryCard, Scope};

/// Default maximum characters per chunk (~400 tokens at 4 chars/token).
pub const DEFAULT_CHUNK_SIZE: usize = 1600;

/// Default overlap carried from one chunk into the next (~50 tokens).
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separators from coarsest to finest. The empty string means "split into
/// single characters".
pub const DEFAULT_SEPARATORS: [&str; 7] = ["\n\n", "\n", ". ", "! ", "? ", " ", ""];

/// Configured text splitter.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Replace the separator list. Without a trailing `""` separator,
    /// fragments that contain none of the separators can exceed
    /// `chunk_size`; they are emitted whole.
    pub fn with_separators<I, S>(mut self, separators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.separators = separators.into_iter().map(Into::into).collect();
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` into chunk strings.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        if char_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }

        let pieces = recursive_split(text, &self.separators, self.chunk_size);

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for piece in pieces {
            let piece_len = char_len(piece);

            if piece_len > self.chunk_size {
                // Atomic fragment: no separator left to break it on.
                push_trimmed(&mut chunks, &current);
                push_trimmed(&mut chunks, piece);
                current.clear();
                current_len = 0;
                continue;
            }

            if current_len + piece_len <= self.chunk_size {
                current.push_str(piece);
                current_len += piece_len;
                continue;
            }

            if current.trim().is_empty() {
                current = piece.to_string();
                current_len = piece_len;
                continue;
            }

            push_trimmed(&mut chunks, &current);

            // The seeded overlap never pushes the next buffer past chunk_size.
            let overlap = if current_len > self.chunk_overlap {
                self.chunk_overlap.min(self.chunk_size - piece_len)
            } else {
                0
            };
            let mut next = tail_chars(&current, overlap).to_string();
            next.push_str(piece);
            current_len = overlap + piece_len;
            current = next;
        }

        push_trimmed(&mut chunks, &current);
        chunks
    }
}

/// Split a card into [`Chunk`]s with ids and indices.
pub fn chunk_card(scope: &Scope, card: &MemoryCard, splitter: &TextSplitter) -> Vec<Chunk> {
    let texts = splitter.split(&card.searchable_text());
    let total = texts.len();
    texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            id: chunk_id(scope, &card.name, index),
            card_name: card.name.clone(),
            scope: scope.clone(),
            chunk_index: index,
            total_chunks: total,
            text,
        })
        .collect()
}

/// Identity of a chunk inside the vector index.
pub fn chunk_id(scope: &Scope, card_name: &str, chunk_index: usize) -> String {
    format!("{}::{}::chunk{}", scope, card_name, chunk_index)
}

/// Components of a parsed chunk id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkId {
    pub scope: String,
    pub card_name: String,
    pub chunk_index: usize,
}

/// Parse an id produced by [`chunk_id`]. Returns `None` for anything else.
pub fn parse_chunk_id(id: &str) -> Option<ChunkId> {
    let marker = id.rfind("::chunk")?;
    let chunk_index = id[marker + "::chunk".len()..].parse::<usize>().ok()?;
    let (scope, card_name) = id[..marker].split_once("::")?;
    if scope.is_empty() || card_name.is_empty() {
        return None;
    }
    Some(ChunkId {
        scope: scope.to_string(),
        card_name: card_name.to_string(),
        chunk_index,
    })
}

/// Whether `id` looks like a chunk id.
pub fn is_chunk_id(id: &str) -> bool {
    parse_chunk_id(id).is_some()
}

fn recursive_split<'a>(text: &'a str, separators: &[String], chunk_size: usize) -> Vec<&'a str> {
    if text.is_empty() {
        return Vec::new();
    }

    let Some((separator, finer)) = separators.split_first() else {
        return vec![text];
    };

    let splits: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split_inclusive(separator.as_str()).collect()
    };

    if finer.is_empty() {
        return splits;
    }

    let mut out = Vec::with_capacity(splits.len());
    for piece in splits {
        if char_len(piece) > chunk_size {
            out.extend(recursive_split(piece, finer, chunk_size));
        } else {
            out.push(piece);
        }
    }
    out
}

fn push_trimmed(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// The last `n` characters of `s` (char-boundary safe).
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextPolicy;

    fn squash(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn test_empty_and_whitespace() {
        let splitter = TextSplitter::default();
        assert!(splitter.split("").is_empty());
        assert!(splitter.split(" \n\n\t ").is_empty());
    }

    #[test]
    fn test_short_text_returned_unchanged() {
        let splitter = TextSplitter::new(100, 20);
        let text = "  Keep my whitespace.\n";
        assert_eq!(splitter.split(text), vec![text.to_string()]);
    }

    #[test]
    fn test_exactly_chunk_size_is_single_chunk() {
        let splitter = TextSplitter::new(10, 2);
        assert_eq!(splitter.split("abcdefghij"), vec!["abcdefghij".to_string()]);
    }

    #[test]
    fn test_chunks_respect_size_bound() {
        let text = (0..200)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
            .collect::<Vec<_>>()
            .join(" ");
        let splitter = TextSplitter::new(120, 30);
        let chunks = splitter.split(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 120, "chunk too long: {}", c.len());
        }
    }

    #[test]
    fn test_no_separator_string_falls_back_to_characters() {
        let text = "x".repeat(5000);
        let splitter = TextSplitter::default();
        let chunks = splitter.split(&text);
        assert!(chunks.len() >= 4);
        for c in &chunks {
            assert!(c.chars().count() <= DEFAULT_CHUNK_SIZE);
        }
    }

    #[test]
    fn test_atomic_fragment_emitted_whole() {
        let text = format!("{}\n\nshort tail", "y".repeat(300));
        let splitter = TextSplitter::new(100, 10).with_separators(["\n\n"]);
        let chunks = splitter.split(&text);
        assert_eq!(chunks[0], "y".repeat(300));
        assert_eq!(chunks.last().unwrap(), "short tail");
    }

    #[test]
    fn test_coverage_without_overlap() {
        let text = "Alpha paragraph here.\n\nBeta paragraph is a bit longer than alpha.\n\
                    Gamma line follows.\n\nDelta closes. It has two sentences! Right?";
        let splitter = TextSplitter::new(30, 0);
        let chunks = splitter.split(text);
        assert!(chunks.len() > 2);
        assert_eq!(squash(&chunks.concat()), squash(text));
    }

    #[test]
    fn test_overlap_carries_context() {
        let text = (0..40)
            .map(|i| format!("word{:02}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let splitter = TextSplitter::new(60, 15);
        let chunks = splitter.split(&text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0]
                .chars()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            assert!(
                pair[1].contains(&prev_tail),
                "expected {:?} to carry {:?}",
                pair[1],
                prev_tail
            );
        }
        for c in &chunks {
            assert!(text.contains(c.as_str()));
        }
    }

    #[test]
    fn test_multibyte_text() {
        let text = "┌──┐ héllo wörld ünïcode ".repeat(40);
        let splitter = TextSplitter::new(50, 10);
        let chunks = splitter.split(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 50);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta ".repeat(30);
        let splitter = TextSplitter::new(40, 8);
        assert_eq!(splitter.split(&text), splitter.split(&text));
    }

    #[test]
    fn test_chunk_card_indices_and_ids() {
        let card = MemoryCard {
            name: "auth-notes".into(),
            title: "Auth".into(),
            content: "OAuth flow uses PKCE. ".repeat(30),
            context_policy: ContextPolicy::Auto,
            tags: vec![],
        };
        let chunks = chunk_card(&Scope::Global, &card, &TextSplitter::new(100, 20));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert_eq!(c.total_chunks, chunks.len());
            assert_eq!(c.id, format!("global::auth-notes::chunk{}", i));
        }
    }

    #[test]
    fn test_parse_chunk_id() {
        let id = chunk_id(&Scope::parse("init-1").unwrap(), "my::card", 12);
        let parsed = parse_chunk_id(&id).unwrap();
        assert_eq!(parsed.scope, "init-1");
        assert_eq!(parsed.card_name, "my::card");
        assert_eq!(parsed.chunk_index, 12);
        assert!(is_chunk_id(&id));
        assert!(!is_chunk_id("global::card"));
        assert!(parse_chunk_id("global::card::chunkX").is_none());
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("hello", 2), "lo");
        assert_eq!(tail_chars("hé", 1), "é");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("ab", 0), "");
    }
}
