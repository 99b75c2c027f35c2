use std::{collections::BTreeMap, path::Path};

use redb::{
    Database,
    MultimapTable,
    MultimapTableDefinition,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    Table,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{doc_id::ChunkId, error::Result, vector_index::Metadata};

const DOCUMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("documents");
const PATHS: TableDefinition<&str, u64> = TableDefinition::new("paths");
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const DOCUMENT_CHUNKS: TableDefinition<(u64, u32), u64> =
    TableDefinition::new("document_chunks");
const CONTENT_HASHES: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("content_hashes");
const FILE_FINGERPRINTS: TableDefinition<&str, &str> =
    TableDefinition::new("file_fingerprints");
const SKIPPED_FILES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("skipped_files");

/// A catalogued document. One live record per absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: u64,
    pub path: String,
    /// Display name (the file name).
    pub name: String,
    /// Lowercase file extension.
    pub file_type: String,
    pub size: u64,
    /// Hash of the extracted text.
    pub content_hash: String,
    /// Hash of path, size and modification time.
    pub file_fingerprint: String,
    pub chunk_count: u32,
    pub title: Option<String>,
    pub author: Option<String>,
    /// Seconds since the Unix epoch.
    pub indexed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub document_id: u64,
    pub ordinal: u32,
    pub text: String,
    /// Character span in the source text.
    pub start: usize,
    pub end: usize,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub metadata: Metadata,
}

/// A file that was examined but deliberately not indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    /// File fingerprint at the time of the skip.
    pub fingerprint: String,
    /// Content hash of the indexed document this file duplicates, or
    /// `None` when the file produced no chunks.
    pub duplicate_of: Option<String>,
}

/// A document removed from the store together with its chunk ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedDocument {
    pub document: DocumentRecord,
    pub chunk_ids: Vec<ChunkId>,
}

/// Durable catalogue of documents and chunks.
///
/// Every mutation runs in a single redb write transaction, so chunk rows
/// never outlive their document and a re-indexed path atomically swaps its
/// old rows for the new ones.
pub struct MetadataStore {
    db: Database,
}

/// All tables opened inside one write transaction.
struct Tables<'txn> {
    documents: Table<'txn, u64, &'static [u8]>,
    paths: Table<'txn, &'static str, u64>,
    chunks: Table<'txn, u64, &'static [u8]>,
    document_chunks: Table<'txn, (u64, u32), u64>,
    content_hashes: MultimapTable<'txn, &'static str, u64>,
    fingerprints: Table<'txn, &'static str, &'static str>,
    skipped: Table<'txn, &'static str, &'static [u8]>,
}

impl<'txn> Tables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            documents: txn.open_table(DOCUMENTS)?,
            paths: txn.open_table(PATHS)?,
            chunks: txn.open_table(CHUNKS)?,
            document_chunks: txn.open_table(DOCUMENT_CHUNKS)?,
            content_hashes: txn.open_multimap_table(CONTENT_HASHES)?,
            fingerprints: txn.open_table(FILE_FINGERPRINTS)?,
            skipped: txn.open_table(SKIPPED_FILES)?,
        })
    }

    fn remove_document(&mut self, id: u64) -> Result<Option<RemovedDocument>> {
        let document: DocumentRecord = match self.documents.remove(id)? {
            Some(raw) => decode(raw.value())?,
            None => return Ok(None),
        };

        let mut keys = Vec::new();
        for entry in self.document_chunks.range((id, 0)..=(id, u32::MAX))? {
            let (key, value) = entry?;
            keys.push((key.value(), value.value()));
        }

        let mut chunk_ids = Vec::with_capacity(keys.len());
        for (key, chunk_id) in keys {
            self.document_chunks.remove(key)?;
            self.chunks.remove(chunk_id)?;
            chunk_ids.push(ChunkId(chunk_id));
        }

        let owns_path = self
            .paths
            .get(document.path.as_str())?
            .is_some_and(|v| v.value() == id);
        if owns_path {
            self.paths.remove(document.path.as_str())?;
            self.fingerprints.remove(document.path.as_str())?;
        }
        self.content_hashes
            .remove(document.content_hash.as_str(), id)?;

        Ok(Some(RemovedDocument {
            document,
            chunk_ids,
        }))
    }

    fn insert_document(
        &mut self,
        document: &DocumentRecord,
        chunks: &[ChunkRecord],
    ) -> Result<()> {
        let bytes = serde_json::to_vec(document)?;
        self.documents.insert(document.id, bytes.as_slice())?;
        self.paths.insert(document.path.as_str(), document.id)?;
        self.content_hashes
            .insert(document.content_hash.as_str(), document.id)?;
        self.fingerprints.insert(
            document.path.as_str(),
            document.file_fingerprint.as_str(),
        )?;
        self.skipped.remove(document.path.as_str())?;

        for chunk in chunks {
            let bytes = serde_json::to_vec(chunk)?;
            self.chunks.insert(chunk.id.as_u64(), bytes.as_slice())?;
            self.document_chunks
                .insert((document.id, chunk.ordinal), chunk.id.as_u64())?;
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

impl MetadataStore {
    /// Open or create the store at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use docrag::metadata_store::MetadataStore;
    ///
    /// let store = MetadataStore::open(&tmp.path().join("metadata.redb")).unwrap();
    /// assert_eq!(store.document_count().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        Tables::open(&txn)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Mutations --

    /// Insert a document and its chunks, replacing any document previously
    /// stored under the same path or id.
    ///
    /// Returns the chunk ids of the replaced rows.
    pub fn upsert_document(
        &self,
        document: &DocumentRecord,
        chunks: &[ChunkRecord],
    ) -> Result<Vec<ChunkId>> {
        let txn = self.db.begin_write()?;
        let replaced = {
            let mut tables = Tables::open(&txn)?;
            let mut stale = vec![document.id];
            if let Some(existing) = tables.paths.get(document.path.as_str())? {
                let existing = existing.value();
                if existing != document.id {
                    stale.push(existing);
                }
            }

            let mut replaced = Vec::new();
            for id in stale {
                if let Some(removed) = tables.remove_document(id)? {
                    replaced.extend(removed.chunk_ids);
                }
            }
            tables.insert_document(document, chunks)?;
            replaced
        };
        txn.commit()?;
        Ok(replaced)
    }

    /// Delete the document stored under `path` and all of its chunks.
    pub fn delete_document(&self, path: &str) -> Result<Option<RemovedDocument>> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut tables = Tables::open(&txn)?;
            let id = tables.paths.get(path)?.map(|v| v.value());
            match id {
                Some(id) => tables.remove_document(id)?,
                None => None,
            }
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Delete several documents (with their chunks) in one transaction.
    pub fn delete_documents_by_id(
        &self,
        ids: &[u64],
    ) -> Result<Vec<RemovedDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_write()?;
        let removed = {
            let mut tables = Tables::open(&txn)?;
            let mut removed = Vec::new();
            for &id in ids {
                if let Some(doc) = tables.remove_document(id)? {
                    removed.push(doc);
                }
            }
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Remove every document and chunk.
    pub fn clear(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(DOCUMENTS)?;
        txn.delete_table(PATHS)?;
        txn.delete_table(CHUNKS)?;
        txn.delete_table(DOCUMENT_CHUNKS)?;
        txn.delete_multimap_table(CONTENT_HASHES)?;
        txn.delete_table(FILE_FINGERPRINTS)?;
        txn.delete_table(SKIPPED_FILES)?;
        Tables::open(&txn)?;
        txn.commit()?;
        Ok(())
    }

    // -- Documents --

    pub fn get_document(&self, path: &str) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let paths = txn.open_table(PATHS)?;
        let Some(id) = paths.get(path)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let documents = txn.open_table(DOCUMENTS)?;
        documents
            .get(id)?
            .map(|raw| decode(raw.value()))
            .transpose()
    }

    pub fn get_document_by_id(&self, id: u64) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let documents = txn.open_table(DOCUMENTS)?;
        documents
            .get(id)?
            .map(|raw| decode(raw.value()))
            .transpose()
    }

    /// All documents, sorted by path.
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let documents = txn.open_table(DOCUMENTS)?;
        let mut result: Vec<DocumentRecord> = Vec::new();
        for entry in documents.iter()? {
            let (_id, raw) = entry?;
            result.push(decode(raw.value())?);
        }
        result.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(result)
    }

    pub fn document_count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        Ok(txn.open_table(DOCUMENTS)?.len()?)
    }

    pub fn counts_by_type(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for doc in self.list_documents()? {
            *counts.entry(doc.file_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self.list_documents()?.iter().map(|d| d.size).sum())
    }

    /// Documents whose name or title contains `query`, ignoring case.
    pub fn search_documents(&self, query: &str) -> Result<Vec<DocumentRecord>> {
        let needle = query.to_lowercase();
        Ok(self
            .list_documents()?
            .into_iter()
            .filter(|doc| {
                doc.name.to_lowercase().contains(&needle)
                    || doc
                        .title
                        .as_deref()
                        .is_some_and(|t| t.to_lowercase().contains(&needle))
            })
            .collect())
    }

    pub fn find_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Vec<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let hashes = txn.open_multimap_table(CONTENT_HASHES)?;
        let documents = txn.open_table(DOCUMENTS)?;

        let mut result = Vec::new();
        for id in hashes.get(content_hash)? {
            if let Some(raw) = documents.get(id?.value())? {
                result.push(decode(raw.value())?);
            }
        }
        Ok(result)
    }

    pub fn has_content_hash(&self, content_hash: &str) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let hashes = txn.open_multimap_table(CONTENT_HASHES)?;
        Ok(hashes.get(content_hash)?.next().is_some())
    }

    /// The file fingerprint recorded when `path` was last indexed.
    pub fn file_fingerprint(&self, path: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_FINGERPRINTS)?;
        Ok(table.get(path)?.map(|v| v.value().to_string()))
    }

    // -- Skipped files --

    /// Remember that `path` was skipped, replacing any earlier record.
    pub fn record_skipped(&self, path: &str, skipped: &SkippedFile) -> Result<()> {
        let bytes = serde_json::to_vec(skipped)?;
        let txn = self.db.begin_write()?;
        txn.open_table(SKIPPED_FILES)?
            .insert(path, bytes.as_slice())?;
        txn.commit()?;
        Ok(())
    }

    pub fn skipped_file(&self, path: &str) -> Result<Option<SkippedFile>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SKIPPED_FILES)?;
        table.get(path)?.map(|raw| decode(raw.value())).transpose()
    }

    /// Paths with a skip record, sorted.
    pub fn skipped_paths(&self) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SKIPPED_FILES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (path, _raw) = entry?;
            result.push(path.value().to_string());
        }
        Ok(result)
    }

    /// Drop the skip record of `path`. Returns false if there was none.
    pub fn forget_skipped(&self, path: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = txn.open_table(SKIPPED_FILES)?.remove(path)?.is_some();
        txn.commit()?;
        Ok(removed)
    }

    // -- Chunks --

    /// Chunks of a document in ordinal order.
    pub fn chunks_for_document(&self, id: u64) -> Result<Vec<ChunkRecord>> {
        let txn = self.db.begin_read()?;
        let document_chunks = txn.open_table(DOCUMENT_CHUNKS)?;
        let chunks = txn.open_table(CHUNKS)?;

        let mut result = Vec::new();
        for entry in document_chunks.range((id, 0)..=(id, u32::MAX))? {
            let (_key, chunk_id) = entry?;
            if let Some(raw) = chunks.get(chunk_id.value())? {
                result.push(decode(raw.value())?);
            }
        }
        Ok(result)
    }

    pub fn chunk_ids_for_document(&self, id: u64) -> Result<Vec<ChunkId>> {
        let txn = self.db.begin_read()?;
        let document_chunks = txn.open_table(DOCUMENT_CHUNKS)?;
        let mut result = Vec::new();
        for entry in document_chunks.range((id, 0)..=(id, u32::MAX))? {
            let (_key, chunk_id) = entry?;
            result.push(ChunkId(chunk_id.value()));
        }
        Ok(result)
    }

    /// Chunk ids grouped by owning document, in ordinal order.
    pub fn document_chunk_ids(&self) -> Result<BTreeMap<u64, Vec<ChunkId>>> {
        let txn = self.db.begin_read()?;
        let document_chunks = txn.open_table(DOCUMENT_CHUNKS)?;
        let mut result: BTreeMap<u64, Vec<ChunkId>> = BTreeMap::new();
        for entry in document_chunks.iter()? {
            let (key, chunk_id) = entry?;
            let (doc_id, _ordinal) = key.value();
            result
                .entry(doc_id)
                .or_default()
                .push(ChunkId(chunk_id.value()));
        }
        Ok(result)
    }

    pub fn get_chunk(&self, id: ChunkId) -> Result<Option<ChunkRecord>> {
        let txn = self.db.begin_read()?;
        let chunks = txn.open_table(CHUNKS)?;
        chunks
            .get(id.as_u64())?
            .map(|raw| decode(raw.value()))
            .transpose()
    }

    pub fn all_chunk_ids(&self) -> Result<Vec<ChunkId>> {
        let txn = self.db.begin_read()?;
        let chunks = txn.open_table(CHUNKS)?;
        let mut result = Vec::new();
        for entry in chunks.iter()? {
            let (id, _raw) = entry?;
            result.push(ChunkId(id.value()));
        }
        Ok(result)
    }

    pub fn chunk_count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        Ok(txn.open_table(CHUNKS)?.len()?)
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}
