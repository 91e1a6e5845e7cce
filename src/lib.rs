//! # cardbase
//!
//! Semantic indexing for memory cards: short markdown notes kept per scope
//! (the global knowledge base, or one initiative).
//!
//! Cards are split into overlapping chunks, embedded, and stored in one
//! vector index per scope. Each index carries metadata recording a content
//! hash per card and the embedding model used, so a stale index is noticed
//! and rebuilt before it is searched. Search groups chunk hits back into
//! cards with excerpts and falls back to plain text scoring whenever the
//! embedding provider is unavailable.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────┐   ┌───────────┐   ┌──────────────┐
//! │ CardSource │──▶│ Chunker │──▶│ Embedding │──▶│ Vector index │
//! │ (markdown) │   └─────────┘   │ provider  │   │ (per scope)  │
//! └─────┬──────┘                 └───────────┘   └──────┬───────┘
//!       │         ┌─────────────────────┐               │
//!       └────────▶│ Consistency manager │◀──────────────┤
//!                 │ (hashes + metadata) │               │
//!                 └─────────────────────┘               ▼
//!                                               ┌──────────────┐
//!                                               │ Search +     │
//!                                               │ aggregation  │
//!                                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core data types |
//! | [`chunk`] | Text splitting and chunk ids |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Per-scope vector index storage |
//! | [`metadata`] | Index metadata and content hashes |
//! | [`cards`] | Card source trait and markdown card store |
//! | [`consistency`] | Staleness detection and rebuilds |
//! | [`search`] | Card-level search with text fallback |
//! | [`context`] | Context card selection |
//! | [`engine`] | The [`MemoryIndex`](engine::MemoryIndex) registry |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |
//! | [`commands`] | CLI command implementations |

pub mod cards;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod consistency;
pub mod context;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod models;
pub mod search;
pub mod store;
