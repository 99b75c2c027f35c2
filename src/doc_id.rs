use std::path::Path;

use serde::{Deserialize, Serialize};

fn hash_prefix(hasher: &blake3::Hasher) -> u64 {
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

fn short_hex(value: u64, len: usize) -> String {
    let full = format!("{value:016x}");
    full[..len].to_string()
}

/// A stable document identifier derived from the document's absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    /// The numeric ID used as the key in redb tables.
    pub numeric: u64,
    /// The short hex string for human display (e.g. "a1b2c3").
    pub short: String,
}

impl DocumentId {
    /// Generate a stable document ID from an absolute path.
    pub fn new(path: &Path) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.to_string_lossy().as_bytes());
        Self::from_numeric(hash_prefix(&hasher))
    }

    pub fn from_numeric(numeric: u64) -> Self {
        Self {
            numeric,
            short: short_hex(numeric, 6),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short)
    }
}

/// Globally unique chunk identifier, the join key between the vector index
/// and the metadata store.
///
/// Derived from the owning document, the document's content fingerprint and
/// the chunk ordinal, so the same file content always yields the same ids.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl ChunkId {
    pub fn new(
        document: &DocumentId,
        content_hash: &str,
        ordinal: u32,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&document.numeric.to_le_bytes());
        hasher.update(content_hash.as_bytes());
        hasher.update(&ordinal.to_le_bytes());
        Self(hash_prefix(&hasher))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
