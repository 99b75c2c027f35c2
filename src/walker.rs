use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::{
    config::IndexerConfig,
    error::{Error, Result},
};

/// A discovered document file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Path relative to the walked root directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time as nanoseconds since the Unix epoch.
    pub mtime: u64,
}

/// Decides which files are indexing candidates.
#[derive(Debug, Clone)]
pub struct FileFilter {
    extensions: Vec<String>,
    ignore: GlobSet,
    max_file_size: u64,
}

impl FileFilter {
    pub fn new(config: &IndexerConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::Config(format!("invalid ignore pattern {pattern}: {e}"))
            })?;
            builder.add(glob);
        }
        let ignore = builder.build().map_err(|e| {
            Error::Config(format!("invalid ignore patterns: {e}"))
        })?;

        Ok(Self {
            extensions: config
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            ignore,
            max_file_size: config.max_file_size,
        })
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_lowercase()))
    }

    pub fn is_ignored(&self, relative_path: &Path) -> bool {
        self.ignore.is_match(relative_path)
    }

    pub fn within_size_limit(&self, size: u64) -> bool {
        size <= self.max_file_size
    }
}

/// Recursively walk a directory and discover eligible document files.
///
/// Skips hidden files/directories (names starting with `.`), files with
/// extensions outside the allow-list, files matching an ignore pattern and
/// files above the size ceiling. Results are sorted by relative path.
///
/// Only a missing or unreadable root is an error. Entries below it that
/// cannot be read are logged and left out.
pub fn discover_files(
    root: &Path,
    filter: &FileFilter,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize().map_err(|_| Error::NotFound {
        kind: "directory",
        name: root.display().to_string(),
    })?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, filter, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    filter: &FileFilter,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    dir = %current.display(),
                    error = %e,
                    "skipping unreadable entry"
                );
                continue;
            }
        };
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        // Skip hidden files and directories.
        if name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping entry without file type"
                );
                continue;
            }
        };

        if file_type.is_dir() {
            if let Err(e) = walk_dir(root, &path, filter, results) {
                tracing::warn!(
                    dir = %path.display(),
                    error = %e,
                    "skipping unreadable directory"
                );
            }
        } else if file_type.is_symlink() {
            let resolved = match path.canonicalize() {
                Ok(p) => p,
                Err(_) => continue, // Skip broken symlinks
            };
            // Directory symlinks are never followed (cycle prevention).
            if resolved.is_file()
                && let Some(df) = make_discovered(root, &path, &resolved, filter)
            {
                results.push(df);
            }
        } else if file_type.is_file() {
            let abs = match path.canonicalize() {
                Ok(abs) => abs,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unresolvable file"
                    );
                    continue;
                }
            };
            if let Some(df) = make_discovered(root, &path, &abs, filter) {
                results.push(df);
            }
        }
    }

    Ok(())
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: &Path,
    filter: &FileFilter,
) -> Option<DiscoveredFile> {
    if !filter.is_supported(original_path) {
        return None;
    }

    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();
    if filter.is_ignored(&relative_path) {
        tracing::debug!(path = %relative_path.display(), "ignored by pattern");
        return None;
    }

    let file = match inspect(relative_path, absolute_path) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(
                path = %absolute_path.display(),
                error = %e,
                "skipping file that cannot be stat'ed"
            );
            return None;
        }
    };
    if !filter.within_size_limit(file.size) {
        tracing::debug!(
            path = %file.relative_path.display(),
            size = file.size,
            "over size ceiling"
        );
        return None;
    }
    Some(file)
}

/// Stat a single file, resolving it to an absolute path.
pub fn inspect_file(path: &Path) -> Result<DiscoveredFile> {
    let absolute_path = path.canonicalize().map_err(|_| Error::NotFound {
        kind: "file",
        name: path.display().to_string(),
    })?;
    if !absolute_path.is_file() {
        return Err(Error::NotFound {
            kind: "file",
            name: path.display().to_string(),
        });
    }
    let relative_path = absolute_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| absolute_path.clone());
    inspect(relative_path, &absolute_path)
}

fn inspect(
    relative_path: PathBuf,
    absolute_path: &Path,
) -> Result<DiscoveredFile> {
    let metadata = std::fs::metadata(absolute_path)?;
    let mtime = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    Ok(DiscoveredFile {
        relative_path,
        absolute_path: absolute_path.to_path_buf(),
        size: metadata.len(),
        mtime: u64::try_from(mtime).unwrap_or(u64::MAX),
    })
}
