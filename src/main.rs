//! # cardbase CLI
//!
//! Manage memory cards and their semantic index from the command line.
//!
//! ## Usage
//!
//! ```bash
//! cardbase --config ./config/cardbase.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cardbase add <scope> <name>` | Create or update a card and index it |
//! | `cardbase remove <scope> <name>` | Delete a card and its index entries |
//! | `cardbase search <scope> "<query>"` | Ranked cards with excerpts |
//! | `cardbase rebuild <scope>` | Rebuild a scope's index from scratch |
//! | `cardbase status <scope>` | Index metadata and consistency |
//! | `cardbase list <scope>` | List cards in a scope |
//! | `cardbase context <scope>` | Cards for an agent's working context |
//!
//! `<scope>` is `global` or an initiative id.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cardbase::commands::{self, AddCard};
use cardbase::config;

/// cardbase: memory cards with a self-healing semantic index.
#[derive(Parser)]
#[command(
    name = "cardbase",
    about = "Memory cards with per-scope semantic search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cardbase.toml`. When the file does not exist,
    /// built-in defaults rooted at `./.knowledge` are used.
    #[arg(long, global = true, default_value = "./config/cardbase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a memory card, then index it.
    ///
    /// Indexing is best effort: the card is saved even when the embedding
    /// provider is unavailable.
    Add {
        scope: String,
        name: String,

        #[arg(long)]
        title: String,

        /// Card body (markdown).
        #[arg(long, conflicts_with = "file")]
        content: Option<String>,

        /// Read the card body from a file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Tag the card. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Always include this card in context.
        #[arg(long)]
        always: bool,
    },

    /// Delete a memory card and remove it from the index.
    Remove { scope: String, name: String },

    /// Search memory cards.
    ///
    /// Uses the vector index when the embedding provider is ready and
    /// text matching otherwise.
    Search {
        scope: String,
        query: String,

        /// Maximum number of cards (1-20, default 5).
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete and rebuild a scope's index.
    Rebuild { scope: String },

    /// Show a scope's index metadata and whether it is consistent.
    Status { scope: String },

    /// List the cards in a scope.
    List { scope: String },

    /// Print the cards to include in an agent's context.
    Context {
        scope: String,

        /// Include every card, not only those with the `always` policy.
        #[arg(long)]
        all: bool,

        /// Semantic query adding relevant cards. Repeatable.
        #[arg(long = "query")]
        queries: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    // RUST_LOG wins over the configured level. Logs go to stderr so
    // `search --json` output stays clean.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Add {
            scope,
            name,
            title,
            content,
            file,
            tags,
            always,
        } => {
            commands::run_add(
                &cfg,
                AddCard {
                    scope,
                    name,
                    title,
                    content,
                    file,
                    tags,
                    always,
                },
            )
            .await?;
        }
        Commands::Remove { scope, name } => {
            commands::run_remove(&cfg, &scope, &name).await?;
        }
        Commands::Search {
            scope,
            query,
            limit,
            json,
        } => {
            commands::run_search(&cfg, &scope, &query, limit, json).await?;
        }
        Commands::Rebuild { scope } => {
            commands::run_rebuild(&cfg, &scope).await?;
        }
        Commands::Status { scope } => {
            commands::run_status(&cfg, &scope).await?;
        }
        Commands::List { scope } => {
            commands::run_list(&cfg, &scope).await?;
        }
        Commands::Context {
            scope,
            all,
            queries,
        } => {
            commands::run_context(&cfg, &scope, all, queries).await?;
        }
    }

    Ok(())
}
