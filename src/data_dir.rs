//! Location of docrag's on-disk state.
//!
//! A data directory holds three files: `metadata.redb` (documents, chunks,
//! content hashes, file fingerprints and skip records), `vectors.bin` (the
//! vector index snapshot) and the optional `docrag.json` configuration.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV_VAR: &str = "DOCRAG_DATA_DIR";

/// The directory one docrag index lives in. Created on resolve.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The DOCRAG_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/docrag/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("docrag")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The redb database with document and chunk rows, the content hash
    /// and file fingerprint lookups, and records of skipped files.
    pub fn metadata_db(&self) -> PathBuf {
        self.root.join("metadata.redb")
    }

    /// Binary snapshot of the vector index: chunk ids, embeddings and the
    /// text and metadata stored alongside each vector. Rewritten whenever
    /// the catalog is saved.
    pub fn vector_snapshot(&self) -> PathBuf {
        self.root.join("vectors.bin")
    }

    /// JSON configuration read by `Config::load` unless `DOCRAG_CONFIG`
    /// points elsewhere. A missing file means defaults.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("docrag.json")
    }
}
