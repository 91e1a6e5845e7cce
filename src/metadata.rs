//! Index metadata: which cards a scope's index was built from.
//!
//! One JSON file per scope, next to the scope's vector index:
//!
//! ```json
//! {
//!   "embeddingModel": "all-minilm-l6-v2",
//!   "lastRebuildTime": 1718000000000,
//!   "fileHashes": { "auth-notes": "9f86d08…" }
//! }
//! ```
//!
//! Unknown fields are ignored on load so older binaries can read files
//! written by newer ones.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{IndexError, Result};
use crate::models::Scope;

pub const METADATA_FILE_NAME: &str = "index-metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub embedding_model: String,
    /// Unix milliseconds.
    pub last_rebuild_time: i64,
    /// Card name → SHA-256 hex of the card's serialized content.
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

/// Hex SHA-256 of `content`.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Reads and writes per-scope [`IndexMetadata`] files.
#[derive(Debug, Clone)]
pub struct MetadataTracker {
    index_root: PathBuf,
    model: String,
}

impl MetadataTracker {
    pub fn new(index_root: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            index_root: index_root.into(),
            model: model.into(),
        }
    }

    /// The embedding model stamped on fresh metadata.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn path(&self, scope: &Scope) -> PathBuf {
        self.index_root
            .join(scope.relative_dir())
            .join(METADATA_FILE_NAME)
    }

    /// Load the scope's metadata, or `None` if it was never written.
    ///
    /// Unreadable or corrupt files are logged and reported as `None` so the
    /// scope gets rebuilt. Permission and disk-full errors propagate.
    pub async fn load(&self, scope: &Scope) -> Result<Option<IndexMetadata>> {
        let path = self.path(scope);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                let err = IndexError::io(&path, e);
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(%scope, error = %err, "unreadable index metadata");
                return Ok(None);
            }
        };

        match serde_json::from_str(&raw) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!(%scope, path = %path.display(), error = %e, "corrupt index metadata");
                Ok(None)
            }
        }
    }

    /// Persist metadata, creating the scope directory if needed.
    pub async fn save(&self, scope: &Scope, metadata: &IndexMetadata) -> Result<()> {
        let path = self.path(scope);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IndexError::io(parent, e))?;
        }
        let body = serde_json::to_string_pretty(metadata).map_err(|e| {
            IndexError::Serialization {
                path: path.clone(),
                source: e,
            }
        })?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| IndexError::io(&path, e))
    }

    /// Delete the scope's metadata. A missing file is not an error.
    pub async fn clear(&self, scope: &Scope) -> Result<()> {
        let path = self.path(scope);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IndexError::io(&path, e)),
        }
    }

    /// Fresh metadata for `cards` (name → serialized content), stamped with
    /// the current model and time.
    pub fn build_fresh<'a, I>(&self, cards: I) -> IndexMetadata
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        IndexMetadata {
            embedding_model: self.model.clone(),
            last_rebuild_time: chrono::Utc::now().timestamp_millis(),
            file_hashes: cards
                .into_iter()
                .map(|(name, content)| (name.to_string(), compute_hash(content)))
                .collect(),
        }
    }
}
