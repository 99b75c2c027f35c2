//! Parallel document ingestion.
//!
//! Files are parsed, chunked and embedded on a fixed-size rayon pool;
//! each worker then hands its prepared document to [`Catalog::commit`],
//! which serializes the write into both indexes and the metadata store.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::{Instant, SystemTime},
};

use serde::Serialize;

use crate::{
    catalog::{Catalog, CommitOutcome},
    chunking::ChunkingConfig,
    config::IndexerConfig,
    doc_id::{ChunkId, DocumentId},
    embedding::{Embedder, EmbeddingProvider},
    error::{Error, Result},
    fingerprint::content_hash,
    metadata_store::{ChunkRecord, DocumentRecord, SkippedFile},
    parser::{ParserRegistry, extension_of},
    vector_index::{Metadata, VectorRecord},
    walker::{DiscoveredFile, FileFilter, discover_files, inspect_file},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Fingerprint matches the last indexed version.
    Unchanged,
    /// The parser produced no chunks.
    Empty,
    /// Same content is indexed under another existing path.
    Duplicate { of: PathBuf },
}

/// What happened to one file.
#[derive(Debug)]
pub enum FileOutcome {
    Indexed { chunks: usize },
    Skipped(SkipReason),
    Failed(Error),
}

impl FileOutcome {
    pub fn is_indexed(&self) -> bool {
        matches!(self, FileOutcome::Indexed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of a directory run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total_files: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub chunks: usize,
    pub failures: Vec<FileFailure>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

/// Cooperative cancellation flag, checked before each file.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reported to the progress callback after each finished file.
#[derive(Debug)]
pub struct Progress<'a> {
    pub completed: usize,
    pub total: usize,
    pub path: &'a Path,
    pub outcome: &'a FileOutcome,
}

/// Per-run knobs for [`Indexer::index_directory_with`].
#[derive(Default)]
pub struct IndexOptions<'a> {
    /// Overrides the configured worker count.
    pub max_workers: Option<usize>,
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a mut dyn FnMut(Progress<'_>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbedStatus {
    NotReached,
    Succeeded,
    Failed,
}

struct Report {
    path: PathBuf,
    outcome: FileOutcome,
    embed: EmbedStatus,
}

pub struct Indexer {
    catalog: Arc<Catalog>,
    embedder: Arc<EmbeddingProvider>,
    parsers: ParserRegistry,
    filter: FileFilter,
    config: IndexerConfig,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Indexer {
    pub fn new(
        catalog: Arc<Catalog>,
        embedder: Arc<EmbeddingProvider>,
        config: &IndexerConfig,
    ) -> Result<Self> {
        Ok(Self {
            catalog,
            embedder,
            parsers: ParserRegistry::new(ChunkingConfig::from(config)),
            filter: FileFilter::new(config)?,
            config: config.clone(),
        })
    }

    /// Index a single file and persist the vector snapshot.
    ///
    /// Per-file problems (missing file, unsupported type, embedding error)
    /// come back as [`FileOutcome::Failed`]; only a failure to save the
    /// snapshot is returned as an error.
    pub fn index_file(&self, path: &Path) -> Result<FileOutcome> {
        let outcome = match inspect_file(path) {
            Ok(file) => self.process(&file).outcome,
            Err(e) => FileOutcome::Failed(e),
        };
        log_outcome(path, &outcome);
        if outcome.is_indexed() {
            self.catalog.save()?;
        }
        Ok(outcome)
    }

    pub fn index_directory(&self, root: &Path) -> Result<IndexStats> {
        self.index_directory_with(root, IndexOptions::default())
    }

    /// Walk `root` and index every eligible file on a bounded worker pool.
    pub fn index_directory_with(
        &self,
        root: &Path,
        options: IndexOptions<'_>,
    ) -> Result<IndexStats> {
        let started = Instant::now();
        let files = discover_files(root, &self.filter)?;
        let total = files.len();
        tracing::info!(root = %root.display(), files = total, "indexing directory");

        let workers = options
            .max_workers
            .unwrap_or(self.config.max_workers)
            .clamp(1, total.max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("docrag-index-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot start worker pool: {e}")))?;

        let cancel = options.cancel.cloned().unwrap_or_default();
        let mut progress = options.progress;
        let queue = Mutex::new(VecDeque::from(files));
        let (sender, receiver) = mpsc::channel::<Report>();

        let mut stats = IndexStats {
            total_files: total,
            ..IndexStats::default()
        };
        let mut embed_attempts = 0usize;
        let mut embed_failures = 0usize;

        pool.in_place_scope(|scope| {
            for _ in 0..workers {
                let sender = sender.clone();
                let queue = &queue;
                let cancel = &cancel;
                scope.spawn(move |_| {
                    loop {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let Some(file) =
                            queue.lock().ok().and_then(|mut q| q.pop_front())
                        else {
                            break;
                        };
                        if sender.send(self.process(&file)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(sender);

            for (completed, report) in receiver.iter().enumerate() {
                log_outcome(&report.path, &report.outcome);
                match report.embed {
                    EmbedStatus::NotReached => {}
                    EmbedStatus::Succeeded => embed_attempts += 1,
                    EmbedStatus::Failed => {
                        embed_attempts += 1;
                        embed_failures += 1;
                    }
                }
                match &report.outcome {
                    FileOutcome::Indexed { chunks } => {
                        stats.indexed += 1;
                        stats.chunks += chunks;
                    }
                    FileOutcome::Skipped(_) => stats.skipped += 1,
                    FileOutcome::Failed(e) => {
                        stats.failed += 1;
                        stats.failures.push(FileFailure {
                            path: report.path.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
                if let Some(callback) = progress.as_mut() {
                    callback(Progress {
                        completed: completed + 1,
                        total,
                        path: &report.path,
                        outcome: &report.outcome,
                    });
                }
            }
        });

        if embed_attempts > 0 && embed_failures == embed_attempts {
            let warning = format!(
                "embedding failed for all {embed_attempts} file(s) that reached it; \
                 check the embedding provider"
            );
            tracing::warn!("{warning}");
            stats.warnings.push(warning);
        }

        stats.failures.sort_by(|a, b| a.path.cmp(&b.path));
        stats.cancelled = cancel.is_cancelled();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.catalog.save()?;

        tracing::info!(
            indexed = stats.indexed,
            skipped = stats.skipped,
            failed = stats.failed,
            cancelled = stats.cancelled,
            duration_ms = stats.duration_ms,
            "indexing finished"
        );
        Ok(stats)
    }

    /// Remove the document indexed from `path`.
    pub fn remove_document(&self, path: &Path) -> Result<bool> {
        let key = document_key(path)?;
        self.catalog.store().forget_skipped(&key)?;
        let removed = self.catalog.remove(&key)?;
        if removed {
            tracing::info!(path = %key, "removed document");
            self.catalog.save()?;
        }
        Ok(removed)
    }

    /// Remove documents under `root` whose files no longer exist.
    ///
    /// Skip records of missing files are dropped too but not counted.
    pub fn prune(&self, root: &Path) -> Result<usize> {
        let root = document_key(root)?;
        let store = self.catalog.store();
        for path in store.skipped_paths()? {
            if Path::new(&path).starts_with(&root) && !Path::new(&path).exists() {
                store.forget_skipped(&path)?;
            }
        }

        let stale: Vec<u64> = self
            .catalog
            .store()
            .list_documents()?
            .into_iter()
            .filter(|doc| {
                Path::new(&doc.path).starts_with(&root)
                    && !Path::new(&doc.path).exists()
            })
            .map(|doc| doc.id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let removed = self.catalog.remove_by_ids(&stale)?;
        for doc in &removed {
            tracing::info!(path = %doc.document.path, "pruned missing document");
        }
        self.catalog.save()?;
        Ok(removed.len())
    }

    fn process(&self, file: &DiscoveredFile) -> Report {
        let mut embed = EmbedStatus::NotReached;
        let outcome = self
            .try_process(file, &mut embed)
            .unwrap_or_else(FileOutcome::Failed);
        Report {
            path: file.absolute_path.clone(),
            outcome,
            embed,
        }
    }

    /// True when `path` was indexed or skipped at this fingerprint and
    /// that decision still holds.
    fn is_unchanged(&self, path: &str, fingerprint: &str) -> Result<bool> {
        let store = self.catalog.store();
        if store.file_fingerprint(path)?.as_deref() == Some(fingerprint) {
            return Ok(true);
        }
        let Some(skipped) = store.skipped_file(path)? else {
            return Ok(false);
        };
        if skipped.fingerprint != fingerprint {
            return Ok(false);
        }
        match &skipped.duplicate_of {
            None => Ok(true),
            Some(hash) => {
                Ok(self.config.skip_duplicates && store.has_content_hash(hash)?)
            }
        }
    }

    /// An existing file with a smaller path already indexed with `hash`.
    fn duplicate_owner(&self, path: &str, hash: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .catalog
            .store()
            .find_by_content_hash(hash)?
            .into_iter()
            .filter(|doc| doc.path.as_str() < path)
            .map(|doc| PathBuf::from(doc.path))
            .find(|owner| owner.exists()))
    }

    fn try_process(
        &self,
        file: &DiscoveredFile,
        embed: &mut EmbedStatus,
    ) -> Result<FileOutcome> {
        let key = file.absolute_path.to_string_lossy().into_owned();
        let fingerprint = file.fingerprint();
        if self.is_unchanged(&key, &fingerprint)? {
            return Ok(FileOutcome::Skipped(SkipReason::Unchanged));
        }

        if !self.filter.within_size_limit(file.size) {
            return Err(Error::Parse {
                path: file.absolute_path.clone(),
                reason: format!(
                    "file is {} bytes, over the {} byte limit",
                    file.size, self.config.max_file_size
                ),
            });
        }

        let parsed = self.parsers.parse(&file.absolute_path)?;
        if parsed.chunks.is_empty() {
            if self.catalog.remove(&key)? {
                tracing::debug!(path = %key, "dropped document that became empty");
            }
            self.catalog.store().record_skipped(
                &key,
                &SkippedFile {
                    fingerprint,
                    duplicate_of: None,
                },
            )?;
            return Ok(FileOutcome::Skipped(SkipReason::Empty));
        }

        let doc_id = DocumentId::new(&file.absolute_path);
        let hash = content_hash(parsed.chunks.iter().map(|c| c.text.as_str()));
        if self.config.skip_duplicates
            && let Some(of) = self.duplicate_owner(&key, &hash)?
        {
            if self.catalog.remove(&key)? {
                tracing::debug!(path = %key, "dropped document that became a duplicate");
            }
            self.catalog.store().record_skipped(
                &key,
                &SkippedFile {
                    fingerprint,
                    duplicate_of: Some(hash),
                },
            )?;
            return Ok(FileOutcome::Skipped(SkipReason::Duplicate { of }));
        }
        let file_type = extension_of(&file.absolute_path).unwrap_or_default();
        let name = file
            .absolute_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.clone());

        let chunks: Vec<ChunkRecord> = parsed
            .chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let ordinal = i as u32;
                let mut metadata: Metadata = parsed.metadata.extra.clone();
                metadata.insert("document_id".into(), doc_id.to_string());
                metadata.insert("path".into(), key.clone());
                metadata.insert("file_name".into(), name.clone());
                metadata.insert("file_type".into(), file_type.clone());
                metadata.insert("chunk_index".into(), ordinal.to_string());
                if let Some(title) = &parsed.metadata.title {
                    metadata.insert("title".into(), title.clone());
                }
                if let Some(page) = chunk.page {
                    metadata.insert("page".into(), page.to_string());
                }
                if let Some(section) = &chunk.section {
                    metadata.insert("section".into(), section.clone());
                }
                ChunkRecord {
                    id: ChunkId::new(&doc_id, &hash, ordinal),
                    document_id: doc_id.numeric,
                    ordinal,
                    text: chunk.text,
                    start: chunk.start,
                    end: chunk.end,
                    page: chunk.page,
                    section: chunk.section,
                    metadata,
                }
            })
            .collect();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        *embed = EmbedStatus::Failed;
        let vectors = self.embedder.embed_batch(&texts)?;
        if vectors.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        *embed = EmbedStatus::Succeeded;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.id,
                vector,
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
            })
            .collect();

        let document = DocumentRecord {
            id: doc_id.numeric,
            path: key,
            name,
            file_type,
            size: file.size,
            content_hash: hash,
            file_fingerprint: fingerprint,
            chunk_count: chunks.len() as u32,
            title: parsed.metadata.title,
            author: parsed.metadata.author,
            indexed_at: unix_seconds(),
        };

        let chunk_count = chunks.len();
        match self.catalog.commit(
            document,
            chunks,
            records,
            self.config.skip_duplicates,
        )? {
            CommitOutcome::Committed => {
                Ok(FileOutcome::Indexed { chunks: chunk_count })
            }
            CommitOutcome::Duplicate { of } => {
                Ok(FileOutcome::Skipped(SkipReason::Duplicate { of }))
            }
        }
    }
}

/// The store key for a path: canonical when the file exists, otherwise
/// made absolute against the working directory.
fn document_key(path: &Path) -> Result<String> {
    let resolved = match path.canonicalize() {
        Ok(p) => p,
        Err(_) => std::path::absolute(path)?,
    };
    Ok(resolved.to_string_lossy().into_owned())
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn log_outcome(path: &Path, outcome: &FileOutcome) {
    match outcome {
        FileOutcome::Indexed { chunks } => {
            tracing::debug!(path = %path.display(), chunks, "indexed");
        }
        FileOutcome::Skipped(reason) => {
            tracing::debug!(path = %path.display(), ?reason, "skipped");
        }
        FileOutcome::Failed(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to index");
        }
    }
}
