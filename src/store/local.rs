//! On-disk [`IndexBackend`]: one JSON file per scope.
//!
//! Layout under the index root:
//!
//! ```text
//! <index_root>/global/index.json
//! <index_root>/initiatives/<id>/index.json
//! ```
//!
//! Opened indexes are cached in a registry so every caller works on the same
//! in-memory copy. The registry map is only locked to find a scope's slot;
//! loading happens inside that slot, so a slow disk read for one scope never
//! blocks another. Each mutation rewrites the file through a temporary file
//! and a rename, so a crash never leaves a half-written index.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::models::{IndexEntry, Scope};

use super::{rank_by_distance, IndexBackend, Neighbor};

pub const INDEX_FILE_NAME: &str = "index.json";
const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<IndexEntry>,
}

struct ScopeIndex {
    path: PathBuf,
    entries: RwLock<Vec<IndexEntry>>,
}

impl ScopeIndex {
    fn new(path: PathBuf, entries: Vec<IndexEntry>) -> Arc<Self> {
        Arc::new(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Write `entries` to disk. Caller holds the write lock.
    async fn persist(&self, entries: &[IndexEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IndexError::io(parent, e))?;
        }

        let body = serde_json::to_vec(&IndexFileRef {
            version: INDEX_FORMAT_VERSION,
            entries,
        })
        .map_err(|e| IndexError::Serialization {
            path: self.path.clone(),
            source: e,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| IndexError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| IndexError::io(&self.path, e))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    version: u32,
    entries: &'a [IndexEntry],
}

/// A scope's place in the registry. Empty until the first successful load.
type Slot = Arc<OnceCell<Arc<ScopeIndex>>>;

/// Why a slot could not be filled.
enum LoadFailure {
    /// No file on disk and the caller did not ask to create one.
    Absent,
    Failed(IndexError),
}

impl From<IndexError> for LoadFailure {
    fn from(e: IndexError) -> Self {
        LoadFailure::Failed(e)
    }
}

/// File-backed index backend rooted at a directory.
pub struct LocalIndexBackend {
    root: PathBuf,
    open: Mutex<HashMap<Scope, Slot>>,
}

impl LocalIndexBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self, scope: &Scope) -> PathBuf {
        self.root.join(scope.relative_dir()).join(INDEX_FILE_NAME)
    }

    fn slot(&self, scope: &Scope) -> Slot {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(open.entry(scope.clone()).or_default())
    }

    fn forget(&self, scope: &Scope) -> Option<Slot> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope)
    }

    /// The cached index for `scope`, loading it on first use.
    ///
    /// Concurrent callers for one scope wait on the same slot, so the file is
    /// read (or created) once. A failed load leaves the slot empty and the
    /// next caller tries again. Returns `None` when the file is absent and
    /// `create` is false.
    async fn load(&self, scope: &Scope, create: bool) -> Result<Option<Arc<ScopeIndex>>> {
        let slot = self.slot(scope);
        let loaded = slot.get_or_try_init(|| self.read_or_create(scope, create)).await;

        match loaded {
            Ok(index) => Ok(Some(Arc::clone(index))),
            Err(LoadFailure::Absent) => Ok(None),
            Err(LoadFailure::Failed(e)) => Err(e),
        }
    }

    async fn read_or_create(
        &self,
        scope: &Scope,
        create: bool,
    ) -> std::result::Result<Arc<ScopeIndex>, LoadFailure> {
        let path = self.index_path(scope);
        match load_entries(&path).await? {
            Some(entries) => Ok(ScopeIndex::new(path, entries)),
            None if create => {
                let index = ScopeIndex::new(path, Vec::new());
                index.persist(&[]).await?;
                debug!(%scope, path = %index.path.display(), "created vector index");
                Ok(index)
            }
            None => Err(LoadFailure::Absent),
        }
    }

    /// Load or create the index for `scope`.
    async fn handle(&self, scope: &Scope) -> Result<Arc<ScopeIndex>> {
        match self.load(scope, true).await? {
            Some(index) => Ok(index),
            None => Err(IndexError::io(
                self.index_path(scope),
                ErrorKind::NotFound.into(),
            )),
        }
    }
}

/// Read a persisted index. `None` when the file does not exist.
///
/// Read failures, corrupt JSON and unknown format versions are all
/// returned as errors; the caller decides whether to rebuild.
async fn load_entries(path: &Path) -> Result<Option<Vec<IndexEntry>>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(IndexError::io(path, e)),
    };

    let file: IndexFile =
        serde_json::from_slice(&raw).map_err(|e| IndexError::Serialization {
            path: path.to_path_buf(),
            source: e,
        })?;
    if file.version != INDEX_FORMAT_VERSION {
        return Err(IndexError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: file.version,
            expected: INDEX_FORMAT_VERSION,
        });
    }
    Ok(Some(file.entries))
}

#[async_trait]
impl IndexBackend for LocalIndexBackend {
    async fn open(&self, scope: &Scope) -> Result<()> {
        self.handle(scope).await.map(|_| ())
    }

    async fn exists(&self, scope: &Scope) -> Result<bool> {
        let path = self.index_path(scope);
        let present = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| IndexError::io(&path, e))?;
        if !present {
            // Deleted behind our back; the cached copy is no longer backed.
            if self.forget(scope).is_some() {
                debug!(%scope, path = %path.display(), "vector index file disappeared");
            }
            return Ok(false);
        }
        Ok(self.load(scope, false).await?.is_some())
    }

    async fn append(&self, scope: &Scope, new_entries: Vec<IndexEntry>) -> Result<()> {
        let index = self.handle(scope).await?;
        let mut entries = index.entries.write().await;
        let before = entries.len();
        entries.extend(new_entries);
        if let Err(e) = index.persist(&entries).await {
            entries.truncate(before);
            return Err(e);
        }
        Ok(())
    }

    async fn nearest(
        &self,
        scope: &Scope,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let Some(index) = self.load(scope, false).await? else {
            return Ok(Vec::new());
        };
        let entries = index.entries.read().await;
        Ok(rank_by_distance(entries.iter(), vector, limit))
    }

    async fn remove_card(&self, scope: &Scope, card_name: &str) -> Result<usize> {
        let Some(index) = self.load(scope, false).await? else {
            return Ok(0);
        };
        let mut entries = index.entries.write().await;
        let (removed, kept): (Vec<IndexEntry>, Vec<IndexEntry>) = entries
            .drain(..)
            .partition(|e| e.metadata.card_name == card_name);
        *entries = kept;

        if !removed.is_empty() {
            if let Err(e) = index.persist(&entries).await {
                entries.extend(removed);
                return Err(e);
            }
        }
        Ok(removed.len())
    }

    async fn drop_index(&self, scope: &Scope) -> Result<()> {
        if let Some(index) = self.forget(scope).as_deref().and_then(OnceCell::get) {
            // Wait out in-flight readers and writers of the old handle.
            index.entries.write().await.clear();
        }

        let path = self.index_path(scope);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(IndexError::io(&path, e)),
        }

        // The scope directory also holds the metadata file; only remove it
        // when nothing else is left.
        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::remove_dir(dir).await {
                debug!(%scope, error = %e, "scope directory kept");
            }
        }
        debug!(%scope, "dropped vector index");
        Ok(())
    }

    async fn count(&self, scope: &Scope) -> Result<usize> {
        match self.load(scope, false).await? {
            Some(index) => Ok(index.entries.read().await.len()),
            None => Ok(0),
        }
    }
}
