//! CLI command implementations.
//!
//! Each `run_*` function opens a [`MemoryIndex`] from configuration, does
//! its work, prints to stdout and shuts the index down.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::cards::{CardSource, FsCardStore};
use crate::config::Config;
use crate::consistency::Consistency;
use crate::context::ContextRequest;
use crate::embedding::create_provider;
use crate::engine::MemoryIndex;
use crate::models::{ContextPolicy, MemoryCard, Scope};

/// Arguments of `cardbase add`.
pub struct AddCard {
    pub scope: String,
    pub name: String,
    pub title: String,
    pub content: Option<String>,
    pub file: Option<PathBuf>,
    pub tags: Vec<String>,
    pub always: bool,
}

fn parse_scope(raw: &str) -> Result<Scope> {
    Scope::parse(raw).with_context(|| format!("invalid scope '{}'", raw))
}

async fn open(config: &Config) -> Result<(MemoryIndex, Arc<FsCardStore>)> {
    let store = Arc::new(FsCardStore::new(config.storage.knowledge_dir()));
    let embedder = create_provider(&config.embedding)?;
    let index = MemoryIndex::init(config.clone(), store.clone(), embedder).await;
    Ok((index, store))
}

fn excerpt_line(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 120 {
        format!("{}...", flat.chars().take(120).collect::<String>())
    } else {
        flat
    }
}

pub async fn run_add(config: &Config, args: AddCard) -> Result<()> {
    let scope = parse_scope(&args.scope)?;
    let content = match (args.content, args.file) {
        (Some(_), Some(_)) => bail!("pass either --content or --file, not both"),
        (Some(content), None) => content,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => bail!("one of --content or --file is required"),
    };
    if args.title.trim().is_empty() {
        bail!("--title must not be empty");
    }

    let card = MemoryCard {
        name: args.name,
        title: args.title,
        content,
        context_policy: if args.always {
            ContextPolicy::Always
        } else {
            ContextPolicy::Auto
        },
        tags: args.tags,
    };

    let (index, store) = open(config).await?;
    let created = store.save_card(&scope, &card).await?;

    match index.index_document(&scope, &card).await {
        Ok(chunks) => println!(
            "{} memory card '{}' in {} ({} chunks indexed)",
            if created { "Created" } else { "Updated" },
            card.name,
            scope.describe(),
            chunks
        ),
        Err(e) => {
            warn!(%scope, card = %card.name, error = %e, "card saved but not indexed");
            println!(
                "{} memory card '{}' in {} (not indexed: {})",
                if created { "Created" } else { "Updated" },
                card.name,
                scope.describe(),
                e
            );
        }
    }

    index.shutdown().await;
    Ok(())
}

pub async fn run_remove(config: &Config, scope: &str, name: &str) -> Result<()> {
    let scope = parse_scope(scope)?;
    let (index, store) = open(config).await?;

    if !store.remove_card(&scope, name).await? {
        index.shutdown().await;
        bail!("memory card '{}' not found in {}", name, scope.describe());
    }

    match index.remove_document_from_index(&scope, name).await {
        Ok(true) => println!("Removed memory card '{}' from {}", name, scope.describe()),
        Ok(false) => println!(
            "Removed memory card '{}' from {} (it was not indexed)",
            name,
            scope.describe()
        ),
        Err(e) => {
            warn!(%scope, card = %name, error = %e, "card deleted but index not updated");
            println!("Removed memory card '{}' (index not updated: {})", name, e);
        }
    }

    index.shutdown().await;
    Ok(())
}

pub async fn run_search(
    config: &Config,
    scope: &str,
    query: &str,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let scope = parse_scope(scope)?;
    if let Some(limit) = limit {
        if limit == 0 || limit > config.search.max_limit {
            bail!("--limit must be between 1 and {}", config.search.max_limit);
        }
    }

    let (index, _) = open(config).await?;
    let results = index.search(&scope, query, limit).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("No memory cards found for '{}' in {}.", query, scope.describe());
    } else {
        for (i, result) in results.iter().enumerate() {
            println!(
                "{}. [{:.2}] {} / {}",
                i + 1,
                result.relevance_score,
                result.card.name,
                result.card.title
            );
            for excerpt in &result.excerpts {
                println!(
                    "    ({}/{}) [{:.2}] {}",
                    excerpt.chunk_index + 1,
                    excerpt.total_chunks,
                    excerpt.score,
                    excerpt_line(&excerpt.text)
                );
            }
        }
    }

    index.shutdown().await;
    Ok(())
}

pub async fn run_rebuild(config: &Config, scope: &str) -> Result<()> {
    let scope = parse_scope(scope)?;
    let (index, _) = open(config).await?;
    let result = index.rebuild(&scope).await;
    index.shutdown().await;

    let report = result.with_context(|| format!("rebuild of {} failed", scope.describe()))?;
    println!(
        "Rebuilt index for {}: {} cards, {} chunks",
        scope.describe(),
        report.cards,
        report.chunks
    );
    Ok(())
}

pub async fn run_status(config: &Config, scope: &str) -> Result<()> {
    let scope = parse_scope(scope)?;
    let (index, _) = open(config).await?;
    let status = index.status(&scope).await?;

    println!("Scope:          {}", status.scope);
    println!(
        "Embedding:      {} ({})",
        index.manager().store().embedder().model_name(),
        if status.embedder_ready { "ready" } else { "unavailable" }
    );
    match &status.metadata {
        Some(metadata) => {
            let rebuilt = chrono::DateTime::from_timestamp_millis(metadata.last_rebuild_time)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| metadata.last_rebuild_time.to_string());
            println!("Indexed model:  {}", metadata.embedding_model);
            println!("Last rebuild:   {}", rebuilt);
            println!("Cards tracked:  {}", metadata.file_hashes.len());
        }
        None => println!("Metadata:       none"),
    }
    println!("Index entries:  {}", status.entries);
    match &status.consistency {
        Consistency::Consistent => println!("Consistency:    consistent"),
        Consistency::Stale(reason) => println!("Consistency:    stale ({})", reason),
    }
    if status.rebuilding {
        println!("Rebuild:        in progress");
    }

    index.shutdown().await;
    Ok(())
}

pub async fn run_list(config: &Config, scope: &str) -> Result<()> {
    let scope = parse_scope(scope)?;
    let store = FsCardStore::new(config.storage.knowledge_dir());
    let cards = store.list_cards(&scope).await?;

    if cards.is_empty() {
        println!("No memory cards in {}.", scope.describe());
        return Ok(());
    }
    for card in &cards {
        let tags = if card.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", card.tags.join(", "))
        };
        println!(
            "{} ({}) - {}{}",
            card.name,
            card.context_policy.as_str(),
            card.title,
            tags
        );
    }
    Ok(())
}

pub async fn run_context(
    config: &Config,
    scope: &str,
    include_all: bool,
    queries: Vec<String>,
) -> Result<()> {
    let scope = parse_scope(scope)?;
    let (index, _) = open(config).await?;
    let request = ContextRequest {
        include_all,
        semantic_queries: queries,
    };
    let cards = index.context_cards(&scope, &request).await?;

    if cards.is_empty() {
        println!("No context memory cards for {}.", scope.describe());
    }
    for card in &cards {
        println!("## {} ({})\n", card.title, card.name);
        println!("{}\n", card.content.trim_end());
    }

    index.shutdown().await;
    Ok(())
}
