//! Change detection.
//!
//! The *file fingerprint* is cheap: it hashes the path, size and
//! modification time, so an unchanged file is recognised without reading
//! it. The *content hash* covers the extracted text and identifies the same
//! document under a different path.

use std::path::Path;

use crate::walker::DiscoveredFile;

/// Hash of path + size + modification time.
///
/// # Examples
///
/// ```
/// use std::path::Path;
///
/// use docrag::fingerprint::file_fingerprint;
///
/// let a = file_fingerprint(Path::new("/notes/a.md"), 12, 1_700_000_000);
/// let b = file_fingerprint(Path::new("/notes/a.md"), 12, 1_700_000_001);
/// assert_ne!(a, b);
/// ```
pub fn file_fingerprint(path: &Path, size: u64, mtime_nanos: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(&size.to_le_bytes());
    hasher.update(b"\0");
    hasher.update(&mtime_nanos.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

impl DiscoveredFile {
    pub fn fingerprint(&self) -> String {
        file_fingerprint(&self.absolute_path, self.size, self.mtime)
    }
}

/// Hash of the extracted text of a document, in chunk order.
pub fn content_hash<'a>(texts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = blake3::Hasher::new();
    for text in texts {
        hasher.update(text.as_bytes());
        hasher.update(b"\0");
    }
    hasher.finalize().to_hex().to_string()
}
