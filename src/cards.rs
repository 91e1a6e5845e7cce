//! Memory card storage.
//!
//! The index reads cards through the [`CardSource`] trait and never writes
//! them. [`FsCardStore`] is the markdown implementation used by the CLI:
//! one `<name>.md` file per card with a YAML front-matter block.
//!
//! ```text
//! <root>/base/memory-cards/<name>.md
//! <root>/base/initiatives/<id>/memory-cards/<name>.md
//! ```
//!
//! ```markdown
//! ---
//! title: Auth notes
//! contextIncludingPolicy: auto
//! tags:
//! - security
//! ---
//! OAuth flow uses PKCE...
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{IndexError, Result};
use crate::models::{ContextPolicy, MemoryCard, Scope};

const CARD_EXTENSION: &str = "md";
const FRONT_MATTER_DELIMITER: &str = "---";

/// Read access to the cards of a scope.
#[async_trait]
pub trait CardSource: Send + Sync {
    /// Every valid card in the scope, ordered by name.
    async fn list_cards(&self, scope: &Scope) -> Result<Vec<MemoryCard>>;

    /// The full serialized form of one card, or `None` if it does not exist.
    /// This is the text the consistency check hashes.
    async fn card_content(&self, scope: &Scope, name: &str) -> Result<Option<String>>;
}

#[derive(Serialize, Deserialize)]
struct FrontMatter {
    title: String,
    #[serde(rename = "contextIncludingPolicy", default)]
    context_policy: ContextPolicy,
    #[serde(default)]
    tags: Vec<String>,
}

/// Card names become file stems and chunk-id segments.
pub fn validate_card_name(name: &str) -> Result<()> {
    if name.trim().is_empty()
        || name != name.trim()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("::")
    {
        return Err(IndexError::InvalidCard(format!(
            "invalid card name {:?}",
            name
        )));
    }
    Ok(())
}

/// Parse a card file. `name` comes from the file stem.
pub fn parse_card(name: &str, raw: &str) -> Result<MemoryCard> {
    let invalid = |msg: &str| IndexError::InvalidCard(format!("{}: {}", name, msg));

    let rest = raw
        .strip_prefix(FRONT_MATTER_DELIMITER)
        .and_then(|r| r.strip_prefix('\n').or_else(|| r.strip_prefix("\r\n")))
        .ok_or_else(|| invalid("missing front-matter"))?;

    let (yaml, body) = split_front_matter(rest).ok_or_else(|| invalid("unterminated front-matter"))?;

    let front: FrontMatter =
        serde_yaml::from_str(yaml).map_err(|e| invalid(&format!("bad front-matter: {}", e)))?;
    if front.title.trim().is_empty() {
        return Err(invalid("title is empty"));
    }

    Ok(MemoryCard {
        name: name.to_string(),
        title: front.title,
        content: body.to_string(),
        context_policy: front.context_policy,
        tags: front.tags,
    })
}

/// Split after the opening delimiter into (yaml, body) at the closing
/// `---` line.
fn split_front_matter(rest: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONT_MATTER_DELIMITER {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// Serialize a card in the on-disk format read by [`parse_card`].
pub fn render_card(card: &MemoryCard) -> Result<String> {
    let yaml = serde_yaml::to_string(&FrontMatter {
        title: card.title.clone(),
        context_policy: card.context_policy,
        tags: card.tags.clone(),
    })
    .map_err(|e| IndexError::InvalidCard(format!("{}: {}", card.name, e)))?;

    Ok(format!(
        "{delim}\n{yaml}{delim}\n{body}",
        delim = FRONT_MATTER_DELIMITER,
        yaml = yaml,
        body = card.content
    ))
}

/// Markdown card store rooted at the knowledge directory (`<root>/base`).
#[derive(Debug, Clone)]
pub struct FsCardStore {
    base: PathBuf,
}

impl FsCardStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn cards_dir(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::Global => self.base.join("memory-cards"),
            Scope::Initiative(_) => self.base.join(scope.relative_dir()).join("memory-cards"),
        }
    }

    pub fn card_path(&self, scope: &Scope, name: &str) -> PathBuf {
        self.cards_dir(scope)
            .join(format!("{}.{}", name, CARD_EXTENSION))
    }

    /// Names of all card files in the scope, sorted.
    pub async fn card_names(&self, scope: &Scope) -> Result<Vec<String>> {
        let dir = self.cards_dir(scope);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IndexError::io(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| IndexError::io(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CARD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // `card_content` refuses these names, so listing them would
            // leave the card unhashable and the scope permanently stale.
            if let Err(e) = validate_card_name(stem) {
                warn!(%scope, path = %path.display(), error = %e, "skipping memory card with invalid name");
                continue;
            }
            names.push(stem.to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Write a card. Returns `true` when the card did not exist before.
    pub async fn save_card(&self, scope: &Scope, card: &MemoryCard) -> Result<bool> {
        validate_card_name(&card.name)?;
        let path = self.card_path(scope, &card.name);
        let created = !tokio::fs::try_exists(&path).await.unwrap_or(false);

        let dir = self.cards_dir(scope);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| IndexError::io(&dir, e))?;
        tokio::fs::write(&path, render_card(card)?)
            .await
            .map_err(|e| IndexError::io(&path, e))?;
        Ok(created)
    }

    /// Delete a card file. Returns `false` if it did not exist.
    pub async fn remove_card(&self, scope: &Scope, name: &str) -> Result<bool> {
        validate_card_name(name)?;
        let path = self.card_path(scope, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(IndexError::io(&path, e)),
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IndexError::io(path, e)),
    }
}

#[async_trait]
impl CardSource for FsCardStore {
    async fn list_cards(&self, scope: &Scope) -> Result<Vec<MemoryCard>> {
        let mut cards = Vec::new();
        for name in self.card_names(scope).await? {
            let path = self.card_path(scope, &name);
            let Some(raw) = read_optional(&path).await? else {
                continue;
            };
            match parse_card(&name, &raw) {
                Ok(card) => cards.push(card),
                Err(e) => warn!(%scope, path = %path.display(), error = %e, "skipping invalid memory card"),
            }
        }
        Ok(cards)
    }

    async fn card_content(&self, scope: &Scope, name: &str) -> Result<Option<String>> {
        if validate_card_name(name).is_err() {
            return Ok(None);
        }
        read_optional(&self.card_path(scope, name)).await
    }
}
