//! Shared index state.
//!
//! The [`Catalog`] owns the metadata store and, behind one read-write lock,
//! both in-memory indexes. Every mutation takes the write lock for its
//! whole duration, so readers always see the vector and keyword indexes at
//! the same commit. Vectors are written before metadata; the worst case
//! after a crash is vectors without metadata rows, which
//! [`Catalog::reconcile`] removes.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::Serialize;

use crate::{
    config::Config,
    data_dir::DataDir,
    doc_id::ChunkId,
    error::{Error, Result},
    keyword_index::KeywordIndex,
    metadata_store::{
        ChunkRecord,
        DocumentRecord,
        MetadataStore,
        RemovedDocument,
        SkippedFile,
    },
    vector_index::{Metadata, VectorIndex, VectorRecord},
};

/// The two in-memory indexes, always locked together.
#[derive(Debug)]
pub struct Indexes {
    pub vectors: VectorIndex,
    pub keywords: KeywordIndex,
}

impl Indexes {
    fn add(&mut self, records: Vec<VectorRecord>) -> Result<Vec<ChunkId>> {
        let texts: Vec<(ChunkId, String)> =
            records.iter().map(|r| (r.id, r.text.clone())).collect();
        let added = self.vectors.add(records)?;
        self.keywords
            .add_documents(texts.iter().map(|(id, text)| (*id, text.as_str())));
        Ok(added)
    }

    fn delete(&mut self, ids: &[ChunkId]) -> Vec<VectorRecord> {
        self.keywords.remove(ids);
        self.vectors.delete(ids)
    }

    fn restore_metadata(&mut self, previous: Vec<(ChunkId, Metadata)>) {
        for (id, metadata) in previous {
            self.vectors.replace_metadata(id, metadata);
        }
    }

    fn clear(&mut self) {
        self.vectors.clear();
        self.keywords.clear();
    }
}

/// Result of [`Catalog::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Identical content is already indexed under another existing path.
    Duplicate { of: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub orphan_vectors_removed: usize,
    pub documents_removed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_vectors_removed == 0 && self.documents_removed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogCounts {
    pub documents: u64,
    pub chunks: u64,
    pub vectors: usize,
}

#[derive(Debug)]
pub struct Catalog {
    store: MetadataStore,
    indexes: RwLock<Indexes>,
    snapshot_path: PathBuf,
}

impl Catalog {
    /// Open the persisted state of a data directory.
    ///
    /// Loads the metadata store and the vector snapshot, reconciles the two
    /// and rebuilds the keyword index from the surviving vector records.
    pub fn open(data_dir: &DataDir, config: &Config) -> Result<Self> {
        let store = MetadataStore::open(&data_dir.metadata_db())?;
        let snapshot_path = data_dir.vector_snapshot();
        let vectors = VectorIndex::load(
            &snapshot_path,
            config.embedding.dimension,
            config.search.filter_overfetch,
        )?;

        let catalog = Self {
            store,
            indexes: RwLock::new(Indexes {
                vectors,
                keywords: KeywordIndex::new(config.bm25),
            }),
            snapshot_path,
        };

        let report = catalog.reconcile()?;
        if !report.is_clean() {
            tracing::warn!(
                orphan_vectors = report.orphan_vectors_removed,
                documents = report.documents_removed,
                "repaired index state on startup"
            );
        }

        {
            let mut indexes = catalog.write()?;
            let Indexes { vectors, keywords } = &mut *indexes;
            keywords.clear();
            keywords.add_documents(vectors.texts());
        }

        Ok(catalog)
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Indexes>> {
        self.indexes.read().map_err(|_| Error::Poisoned("index"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Indexes>> {
        self.indexes.write().map_err(|_| Error::Poisoned("index"))
    }

    /// Atomically replace a document's rows and vectors.
    ///
    /// New vectors are added first, then the metadata transaction swaps the
    /// document's rows, then vectors of the replaced rows are dropped. If
    /// the metadata transaction fails the new vectors are removed again.
    /// Chunk ids already present (unchanged text) keep their vectors but
    /// take the incoming metadata, which is rolled back on failure too.
    ///
    /// With `skip_duplicates`, content indexed under several existing
    /// paths belongs to the lexicographically smallest one. A document
    /// losing to an existing smaller path is not committed and its path is
    /// recorded as skipped. A larger existing owner is superseded and
    /// recorded as skipped, and an owner whose file is gone is dropped as
    /// moved.
    pub fn commit(
        &self,
        document: DocumentRecord,
        chunks: Vec<ChunkRecord>,
        records: Vec<VectorRecord>,
        skip_duplicates: bool,
    ) -> Result<CommitOutcome> {
        let mut indexes = self.write()?;

        if skip_duplicates {
            for other in self.store.find_by_content_hash(&document.content_hash)? {
                if other.path == document.path {
                    continue;
                }
                let other_path = PathBuf::from(&other.path);
                let other_exists = other_path.exists();
                if other_exists && other.path < document.path {
                    if let Some(stale) = self.store.get_document(&document.path)? {
                        self.remove_locked(&mut indexes, &[stale.id])?;
                    }
                    self.store.record_skipped(
                        &document.path,
                        &SkippedFile {
                            fingerprint: document.file_fingerprint.clone(),
                            duplicate_of: Some(document.content_hash.clone()),
                        },
                    )?;
                    return Ok(CommitOutcome::Duplicate { of: other_path });
                }

                self.remove_locked(&mut indexes, &[other.id])?;
                if other_exists {
                    tracing::info!(
                        from = %other.path,
                        to = %document.path,
                        "duplicate content now owned by smaller path"
                    );
                    self.store.record_skipped(
                        &other.path,
                        &SkippedFile {
                            fingerprint: other.file_fingerprint,
                            duplicate_of: Some(other.content_hash),
                        },
                    )?;
                } else {
                    tracing::info!(
                        from = %other.path,
                        to = %document.path,
                        "document moved"
                    );
                }
            }
        }

        let mut fresh = Vec::with_capacity(records.len());
        let mut refreshed = Vec::new();
        for record in records {
            let metadata = record.metadata.clone();
            match indexes.vectors.replace_metadata(record.id, metadata) {
                Some(previous) => refreshed.push((record.id, previous)),
                None => fresh.push(record),
            }
        }
        let added = match indexes.add(fresh) {
            Ok(added) => added,
            Err(e) => {
                indexes.restore_metadata(refreshed);
                return Err(e);
            }
        };

        match self.store.upsert_document(&document, &chunks) {
            Ok(replaced) => {
                let current: HashSet<ChunkId> =
                    chunks.iter().map(|c| c.id).collect();
                let stale: Vec<ChunkId> = replaced
                    .into_iter()
                    .filter(|id| !current.contains(id))
                    .collect();
                indexes.delete(&stale);
                tracing::debug!(
                    path = %document.path,
                    chunks = chunks.len(),
                    replaced = stale.len(),
                    "committed document"
                );
                Ok(CommitOutcome::Committed)
            }
            Err(e) => {
                indexes.delete(&added);
                indexes.restore_metadata(refreshed);
                Err(e)
            }
        }
    }

    /// Remove the document stored under `path`. Returns false if unknown.
    pub fn remove(&self, path: &str) -> Result<bool> {
        let mut indexes = self.write()?;
        let Some(document) = self.store.get_document(path)? else {
            return Ok(false);
        };
        Ok(!self.remove_locked(&mut indexes, &[document.id])?.is_empty())
    }

    /// Remove documents by id, vectors first. If the metadata delete fails
    /// the removed vectors are restored.
    pub fn remove_by_ids(&self, ids: &[u64]) -> Result<Vec<RemovedDocument>> {
        let mut indexes = self.write()?;
        self.remove_locked(&mut indexes, ids)
    }

    fn remove_locked(
        &self,
        indexes: &mut Indexes,
        ids: &[u64],
    ) -> Result<Vec<RemovedDocument>> {
        let mut chunk_ids = Vec::new();
        for &id in ids {
            chunk_ids.extend(self.store.chunk_ids_for_document(id)?);
        }

        let removed_vectors = indexes.delete(&chunk_ids);
        match self.store.delete_documents_by_id(ids) {
            Ok(removed) => Ok(removed),
            Err(e) => {
                if let Err(restore) = indexes.add(removed_vectors) {
                    tracing::error!(error = %restore, "failed to restore vectors");
                }
                Err(e)
            }
        }
    }

    /// Check that the vector index and the metadata store reference the
    /// same chunk ids.
    pub fn verify(&self) -> Result<()> {
        let indexes = self.read()?;
        let vector_ids: HashSet<ChunkId> =
            indexes.vectors.ids().iter().copied().collect();
        let chunk_ids: HashSet<ChunkId> =
            self.store.all_chunk_ids()?.into_iter().collect();

        let orphan_vectors = vector_ids.difference(&chunk_ids).count();
        let orphan_chunks = chunk_ids.difference(&vector_ids).count();
        if orphan_vectors == 0 && orphan_chunks == 0 {
            Ok(())
        } else {
            Err(Error::StoreInconsistency {
                orphan_vectors,
                orphan_chunks,
            })
        }
    }

    /// Repair disagreement between the stores.
    ///
    /// Vectors without a chunk row are deleted. Documents with chunk rows
    /// missing from the vector index are deleted together with whatever
    /// vectors they still have, so the next index run ingests them again.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut indexes = self.write()?;
        let mut report = ReconcileReport::default();

        let ownership = self.store.document_chunk_ids()?;
        let known: HashSet<ChunkId> =
            ownership.values().flatten().copied().collect();

        let orphans: Vec<ChunkId> = indexes
            .vectors
            .ids()
            .iter()
            .copied()
            .filter(|id| !known.contains(id))
            .collect();
        report.orphan_vectors_removed = indexes.delete(&orphans).len();

        let incomplete: Vec<u64> = ownership
            .iter()
            .filter(|(_, ids)| ids.iter().any(|id| !indexes.vectors.contains(*id)))
            .map(|(doc_id, _)| *doc_id)
            .collect();
        // Documents that lost all their chunk rows are incomplete too.
        let mut incomplete = incomplete;
        for doc in self.store.list_documents()? {
            if doc.chunk_count > 0 && !ownership.contains_key(&doc.id) {
                incomplete.push(doc.id);
            }
        }
        report.documents_removed =
            self.remove_locked(&mut indexes, &incomplete)?.len();

        if !report.is_clean() {
            indexes.vectors.save(&self.snapshot_path)?;
        }
        Ok(report)
    }

    /// Persist the vector snapshot.
    pub fn save(&self) -> Result<()> {
        let indexes = self.read()?;
        indexes.vectors.save(&self.snapshot_path)
    }

    pub fn counts(&self) -> Result<CatalogCounts> {
        let indexes = self.read()?;
        Ok(CatalogCounts {
            documents: self.store.document_count()?,
            chunks: self.store.chunk_count()?,
            vectors: indexes.vectors.count(),
        })
    }

    /// Drop every document, chunk and vector.
    pub fn clear(&self) -> Result<()> {
        let mut indexes = self.write()?;
        self.store.clear()?;
        indexes.clear();
        indexes.vectors.save(&self.snapshot_path)
    }
}
