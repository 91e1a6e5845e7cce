use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Project root. Cards live under `<root>/base`.
    pub root: PathBuf,
    /// Where per-scope vector indexes live. Defaults to `<root>/vector`.
    #[serde(default)]
    pub index_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn index_dir(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.root.join("vector"))
    }

    pub fn knowledge_dir(&self) -> PathBuf {
        self.root.join("base")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// Chunk hits fetched per requested card, so enough distinct cards
    /// survive grouping.
    #[serde(default = "default_over_fetch")]
    pub over_fetch: usize,
    #[serde(default = "default_max_excerpts")]
    pub max_excerpts: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            over_fetch: default_over_fetch(),
            max_excerpts: default_max_excerpts(),
        }
    }
}

fn default_limit() -> usize {
    5
}
fn default_max_limit() -> usize {
    20
}
fn default_over_fetch() -> usize {
    5
}
fn default_max_excerpts() -> usize {
    3
}

impl SearchConfig {
    /// Resolve a caller-supplied limit: default when absent, clamped to
    /// `1..=max_limit`.
    pub fn resolve_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Defaults rooted at `root`. Used when no config file exists and in tests.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                root: root.into(),
                index_path: None,
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Apply `CARDBASE_ROOT`, `CARDBASE_INDEX_PATH` and
    /// `CARDBASE_EMBEDDING_MODEL` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(root) = env_value("CARDBASE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(index_path) = env_value("CARDBASE_INDEX_PATH") {
            self.storage.index_path = Some(PathBuf::from(index_path));
        }
        if let Some(model) = env_value("CARDBASE_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
        }

        if self.search.max_limit == 0 {
            anyhow::bail!("search.max_limit must be >= 1");
        }
        if !(1..=self.search.max_limit).contains(&self.search.default_limit) {
            anyhow::bail!(
                "search.default_limit must be in [1, {}]",
                self.search.max_limit
            );
        }
        if self.search.over_fetch == 0 {
            anyhow::bail!("search.over_fetch must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims == 0 {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.trim().is_empty() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env_overrides();
    config.validate()?;

    Ok(config)
}

/// Load `path`, or fall back to defaults rooted at `./.knowledge` when the
/// file does not exist. Environment overrides apply either way.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    let mut config = Config::with_root(DEFAULT_ROOT);
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub const DEFAULT_ROOT: &str = "./.knowledge";
