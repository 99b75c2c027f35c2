//! Explicit runtime configuration.
//!
//! A [`Config`] is built once (from `docrag.json` in the data directory, or
//! the file named by `DOCRAG_CONFIG`, falling back to defaults) and handed
//! to every component constructor. Nothing reads configuration globally.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    data_dir::DataDir,
    error::{Error, Result},
    search::ScoreNormalization,
};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "DOCRAG_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub indexer: IndexerConfig,
    pub search: SearchConfig,
    pub bm25: Bm25Params,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Lowercase file extensions eligible for indexing.
    pub extensions: Vec<String>,
    /// Glob patterns (matched against the path relative to the walked
    /// root) excluded from discovery.
    pub ignore_patterns: Vec<String>,
    /// Files larger than this many bytes are not indexed.
    pub max_file_size: u64,
    pub max_workers: usize,
    /// Chunk budget in characters.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub skip_duplicates: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            extensions: ["txt", "text", "log", "csv", "rst", "md", "markdown"]
                .into_iter()
                .map(String::from)
                .collect(),
            ignore_patterns: vec![
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
            ],
            max_file_size: 10 * 1024 * 1024,
            max_workers: 4,
            chunk_size: 1000,
            chunk_overlap: 100,
            skip_duplicates: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Each sub-index returns `top_k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    /// Over-fetch factor applied by the vector index when filtering.
    pub filter_overfetch: usize,
    pub min_score: f32,
    /// Characters of context on each side of a snippet match.
    pub snippet_chars: usize,
    pub normalization: ScoreNormalization,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            keyword_weight: 0.3,
            candidate_multiplier: 2,
            filter_overfetch: 3,
            min_score: 0.0,
            snippet_chars: 100,
            normalization: ScoreNormalization::default(),
        }
    }
}

/// BM25 free parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Deterministic offline feature hashing.
    #[default]
    Hashed,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingBackend,
    pub dimension: usize,
    pub model: String,
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::default(),
            dimension: 384,
            model: "nomic-embed-text".to_string(),
            url: "http://localhost:11434".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Offline answers assembled from the retrieved context.
    #[default]
    Extractive,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmBackend,
    pub model: String,
    pub url: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmBackend::default(),
            model: "llama3.2".to_string(),
            url: "http://localhost:11434".to_string(),
            temperature: 0.1,
            timeout_secs: 300,
        }
    }
}

impl Config {
    /// Load the configuration for a data directory.
    ///
    /// `DOCRAG_CONFIG` takes priority over `docrag.json` in the data
    /// directory. A missing file yields the defaults.
    pub fn load(data_dir: &DataDir) -> Result<Self> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.config_file());
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents).map_err(|e| {
            Error::Config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let search = &self.search;
        if search.vector_weight < 0.0 || search.keyword_weight < 0.0 {
            return Err(Error::Config("fusion weights must be >= 0".into()));
        }
        if search.vector_weight + search.keyword_weight <= 0.0 {
            return Err(Error::Config(
                "at least one fusion weight must be positive".into(),
            ));
        }
        if search.candidate_multiplier == 0 || search.filter_overfetch == 0 {
            return Err(Error::Config(
                "candidate multiplier and filter over-fetch must be >= 1"
                    .into(),
            ));
        }
        if self.bm25.k1 < 0.0 || !(0.0..=1.0).contains(&self.bm25.b) {
            return Err(Error::Config(
                "bm25 requires k1 >= 0 and 0 <= b <= 1".into(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(Error::Config("embedding dimension must be > 0".into()));
        }
        if self.indexer.max_workers == 0 {
            return Err(Error::Config("max_workers must be >= 1".into()));
        }
        if self.indexer.chunk_size == 0
            || self.indexer.chunk_overlap >= self.indexer.chunk_size
        {
            return Err(Error::Config(
                "chunk_size must be positive and larger than chunk_overlap"
                    .into(),
            ));
        }
        Ok(())
    }
}
