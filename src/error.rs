//! Error taxonomy for the indexing core.
//!
//! Only explicit operations (a requested rebuild, a single-card index call)
//! surface these to callers. The consistency and search paths catch them,
//! log a warning, and degrade.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The embedding provider is not initialized or a call to it failed.
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt JSON at {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A persisted index written in a format this build does not read.
    #[error("unsupported index format version {found} at {} (expected {expected})", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("invalid scope: {0:?}")]
    InvalidScope(String),

    #[error("invalid memory card: {0}")]
    InvalidCard(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must propagate out of an explicit rebuild rather
    /// than being treated as "absent state".
    ///
    /// Permission and disk-full conditions, plus corrupt persisted JSON, are
    /// fatal. Everything else (missing files, transient read errors, an old
    /// index format) means the index simply needs rebuilding.
    pub fn is_fatal(&self) -> bool {
        match self {
            IndexError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::StorageFull
                    | io::ErrorKind::ReadOnlyFilesystem
            ),
            IndexError::Serialization { .. } => true,
            _ => false,
        }
    }
}
