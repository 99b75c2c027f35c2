//! Exact in-memory vector index with on-disk snapshots.
//!
//! Vectors live in one contiguous `f32` buffer with parallel arrays for the
//! chunk id, text and metadata of each row, so the four never disagree in
//! length. All vectors are L2-normalized on insert and search uses the
//! inner product, i.e. cosine similarity.
//!
//! Snapshot format (single file):
//! - 4 bytes: magic `DRVX`
//! - 4 bytes: format version (u32 LE)
//! - 4 bytes: dimension D (u32 LE)
//! - 8 bytes: row count N (u64 LE)
//! - N * D * 4 bytes: f32 values, row-major, native byte order
//! - JSON array of N `{id, text, metadata}` objects

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    doc_id::ChunkId,
    embedding::normalize,
    error::{Error, Result},
};

const MAGIC: &[u8; 4] = b"DRVX";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 20;

/// Denormalized key-value metadata stored with every vector.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: ChunkId,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: ChunkId,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
    pub text: String,
    pub metadata: Metadata,
}

/// Equality constraints on metadata keys. An empty filter matches all.
///
/// # Examples
///
/// ```
/// use docrag::vector_index::{Metadata, MetadataFilter};
///
/// let filter = MetadataFilter::file_type("md");
/// let mut metadata = Metadata::new();
/// metadata.insert("file_type".into(), "md".into());
/// assert!(filter.matches(&metadata));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    equals: BTreeMap<String, String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_type(file_type: impl Into<String>) -> Self {
        Self::new().with("file_type", file_type)
    }

    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    filter_overfetch: usize,
    data: Vec<f32>,
    ids: Vec<ChunkId>,
    texts: Vec<String>,
    metadatas: Vec<Metadata>,
    positions: HashMap<ChunkId, usize>,
}

impl VectorIndex {
    pub fn new(dimension: usize, filter_overfetch: usize) -> Self {
        Self {
            dimension,
            filter_overfetch: filter_overfetch.max(1),
            data: Vec::new(),
            ids: Vec::new(),
            texts: Vec::new(),
            metadatas: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Chunk ids in insertion order.
    pub fn ids(&self) -> &[ChunkId] {
        &self.ids
    }

    pub fn get(&self, id: ChunkId) -> Option<VectorRecord> {
        self.positions.get(&id).map(|&pos| self.record_at(pos))
    }

    /// Text and metadata of a row without copying its vector.
    pub fn payload(&self, id: ChunkId) -> Option<(&str, &Metadata)> {
        self.positions
            .get(&id)
            .map(|&pos| (self.texts[pos].as_str(), &self.metadatas[pos]))
    }

    /// Swap the metadata of an existing row, returning the previous value.
    pub fn replace_metadata(
        &mut self,
        id: ChunkId,
        metadata: Metadata,
    ) -> Option<Metadata> {
        let pos = *self.positions.get(&id)?;
        Some(std::mem::replace(&mut self.metadatas[pos], metadata))
    }

    /// `(id, text)` of every row in insertion order.
    pub fn texts(&self) -> impl Iterator<Item = (ChunkId, &str)> {
        self.ids
            .iter()
            .copied()
            .zip(self.texts.iter().map(String::as_str))
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<VectorRecord> {
        (0..self.count()).map(|pos| self.record_at(pos)).collect()
    }

    fn row(&self, pos: usize) -> &[f32] {
        &self.data[pos * self.dimension..(pos + 1) * self.dimension]
    }

    fn record_at(&self, pos: usize) -> VectorRecord {
        VectorRecord {
            id: self.ids[pos],
            vector: self.row(pos).to_vec(),
            text: self.texts[pos].clone(),
            metadata: self.metadatas[pos].clone(),
        }
    }

    /// Add records, normalizing their vectors.
    ///
    /// The batch is validated up front: a wrong dimension, a zero vector or
    /// an id that is already present (or repeated in the batch) rejects
    /// the whole batch and leaves the index untouched.
    pub fn add(&mut self, records: Vec<VectorRecord>) -> Result<Vec<ChunkId>> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if record.vector.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: record.vector.len(),
                });
            }
            if record.vector.iter().all(|v| *v == 0.0) {
                return Err(Error::Embedding(format!(
                    "zero vector for chunk {}",
                    record.id
                )));
            }
            if self.contains(record.id) || !seen.insert(record.id) {
                return Err(Error::Embedding(format!(
                    "chunk {} is already indexed",
                    record.id
                )));
            }
        }

        let mut added = Vec::with_capacity(records.len());
        for record in records {
            added.push(record.id);
            self.push(record);
        }
        Ok(added)
    }

    fn push(&mut self, mut record: VectorRecord) {
        normalize(&mut record.vector);
        self.positions.insert(record.id, self.ids.len());
        self.data.extend_from_slice(&record.vector);
        self.ids.push(record.id);
        self.texts.push(record.text);
        self.metadatas.push(record.metadata);
    }

    /// The `top_k` most similar rows, best first.
    ///
    /// With a non-empty filter, `top_k * filter_overfetch` candidates are
    /// ranked first and the filter is applied to those. Equal scores keep
    /// insertion order.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        normalize(&mut query);

        let scores: Vec<f32> = self
            .data
            .par_chunks_exact(self.dimension)
            .map(|row| row.iter().zip(&query).map(|(a, b)| a * b).sum())
            .collect();

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

        let filter = filter.filter(|f| !f.is_empty());
        let fetch = match filter {
            Some(_) => top_k.saturating_mul(self.filter_overfetch),
            None => top_k,
        };

        Ok(order
            .into_iter()
            .take(fetch)
            .filter(|&pos| filter.is_none_or(|f| f.matches(&self.metadatas[pos])))
            .take(top_k)
            .map(|pos| VectorHit {
                id: self.ids[pos],
                score: scores[pos],
                text: self.texts[pos].clone(),
                metadata: self.metadatas[pos].clone(),
            })
            .collect())
    }

    /// Delete rows by rebuilding the index from the survivors.
    ///
    /// Survivors keep their relative order. Returns the removed records so
    /// a caller can restore them; unknown ids are ignored.
    pub fn delete(&mut self, ids: &[ChunkId]) -> Vec<VectorRecord> {
        let doomed: HashSet<ChunkId> =
            ids.iter().copied().filter(|id| self.contains(*id)).collect();
        if doomed.is_empty() {
            return Vec::new();
        }

        let (removed, survivors): (Vec<_>, Vec<_>) = self
            .records()
            .into_iter()
            .partition(|record| doomed.contains(&record.id));

        self.clear();
        for record in survivors {
            self.push(record);
        }
        tracing::debug!(
            removed = removed.len(),
            remaining = self.count(),
            "rebuilt vector index"
        );
        removed
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.ids.clear();
        self.texts.clear();
        self.metadatas.clear();
        self.positions.clear();
    }

    /// Write a snapshot to `path` atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(MAGIC)?;
            writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&(self.dimension as u32).to_le_bytes())?;
            writer.write_all(&(self.count() as u64).to_le_bytes())?;
            writer.write_all(bytemuck::cast_slice(&self.data))?;

            let entries: Vec<EntryRef<'_>> = (0..self.count())
                .map(|pos| EntryRef {
                    id: self.ids[pos],
                    text: &self.texts[pos],
                    metadata: &self.metadatas[pos],
                })
                .collect();
            serde_json::to_writer(&mut writer, &entries)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a snapshot, or start empty when none exists.
    ///
    /// A snapshot written with another dimension is a configuration error.
    pub fn load(
        path: &Path,
        dimension: usize,
        filter_overfetch: usize,
    ) -> Result<Self> {
        let mut index = Self::new(dimension, filter_overfetch);
        if !path.exists() {
            return Ok(index);
        }

        let file_len = std::fs::metadata(path)?.len();
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut header).map_err(truncated)?;
        if &header[0..4] != MAGIC {
            return Err(Error::Snapshot("not a vector snapshot".into()));
        }
        let version = u32::from_le_bytes(le_bytes(&header[4..8]));
        if version != FORMAT_VERSION {
            return Err(Error::Snapshot(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let stored_dim = u32::from_le_bytes(le_bytes(&header[8..12])) as usize;
        if stored_dim != dimension {
            return Err(Error::Config(format!(
                "vector snapshot has dimension {stored_dim} but the \
                 embedding provider produces {dimension}"
            )));
        }
        let count = u64::from_le_bytes(le_bytes(&header[12..20]));

        let value_bytes = count
            .checked_mul(dimension as u64 * 4)
            .filter(|bytes| HEADER_SIZE + bytes <= file_len)
            .ok_or_else(|| {
                Error::Snapshot(format!(
                    "snapshot too short for {count} vectors"
                ))
            })?;

        let mut data = vec![0f32; (value_bytes / 4) as usize];
        reader
            .read_exact(bytemuck::cast_slice_mut(&mut data))
            .map_err(truncated)?;
        index.data = data;

        let entries: Vec<Entry> = serde_json::from_reader(reader)
            .map_err(|e| Error::Snapshot(format!("bad record table: {e}")))?;
        if entries.len() as u64 != count {
            return Err(Error::Snapshot(format!(
                "{} vectors but {} records",
                count,
                entries.len()
            )));
        }

        for (pos, entry) in entries.into_iter().enumerate() {
            if index.positions.insert(entry.id, pos).is_some() {
                return Err(Error::Snapshot(format!(
                    "duplicate chunk {}",
                    entry.id
                )));
            }
            index.ids.push(entry.id);
            index.texts.push(entry.text);
            index.metadatas.push(entry.metadata);
        }

        tracing::debug!(count, dimension, "loaded vector snapshot");
        Ok(index)
    }
}

#[derive(Serialize)]
struct EntryRef<'a> {
    id: ChunkId,
    text: &'a str,
    metadata: &'a Metadata,
}

#[derive(Deserialize)]
struct Entry {
    id: ChunkId,
    text: String,
    metadata: Metadata,
}

fn le_bytes<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn truncated(e: std::io::Error) -> Error {
    Error::Snapshot(format!("truncated snapshot: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, vector: Vec<f32>, file_type: &str) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("file_type".to_string(), file_type.to_string());
        VectorRecord {
            id: ChunkId(id),
            vector,
            text: format!("chunk {id}"),
            metadata,
        }
    }

    fn ids(hits: &[VectorHit]) -> Vec<u64> {
        hits.iter().map(|h| h.id.as_u64()).collect()
    }

    fn sample() -> VectorIndex {
        let mut index = VectorIndex::new(2, 3);
        index
            .add(vec![
                record(1, vec![1.0, 0.0], "txt"),
                record(2, vec![0.0, 1.0], "md"),
                record(3, vec![1.0, 1.0], "md"),
            ])
            .unwrap();
        index
    }

    #[test]
    fn search_ranks_by_cosine() {
        let index = sample();
        let hits = index.search(&[1.0, 0.1], 3, None).unwrap();
        assert_eq!(ids(&hits), vec![1, 3, 2]);
        assert!(hits[0].score <= 1.0 + 1e-6);
        assert_eq!(hits[0].text, "chunk 1");
    }

    #[test]
    fn vectors_are_normalized() {
        let mut index = VectorIndex::new(2, 3);
        index.add(vec![record(1, vec![10.0, 0.0], "txt")]).unwrap();
        let hits = index.search(&[0.5, 0.0], 1, None).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(index.get(ChunkId(1)).unwrap().vector, vec![1.0, 0.0]);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut index = VectorIndex::new(2, 3);
        index
            .add(vec![
                record(9, vec![1.0, 0.0], "txt"),
                record(4, vec![2.0, 0.0], "txt"),
                record(7, vec![3.0, 0.0], "txt"),
            ])
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 3, None).unwrap();
        assert_eq!(ids(&hits), vec![9, 4, 7]);
    }

    #[test]
    fn add_rejects_bad_batches_atomically() {
        let mut index = sample();

        let err = index.add(vec![
            record(10, vec![1.0, 0.0], "txt"),
            record(11, vec![1.0, 0.0, 0.0], "txt"),
        ]);
        assert!(matches!(
            err,
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(index.add(vec![record(12, vec![0.0, 0.0], "txt")]).is_err());
        assert!(index.add(vec![record(1, vec![1.0, 0.0], "txt")]).is_err());
        assert!(
            index
                .add(vec![
                    record(13, vec![1.0, 0.0], "txt"),
                    record(13, vec![0.0, 1.0], "txt"),
                ])
                .is_err()
        );
        assert_eq!(index.count(), 3);
        assert!(!index.contains(ChunkId(10)));
    }

    #[test]
    fn replace_metadata_feeds_filtered_search() {
        let mut index = sample();
        let mut moved = Metadata::new();
        moved.insert("file_type".to_string(), "md".to_string());

        let previous = index.replace_metadata(ChunkId(1), moved).unwrap();
        assert_eq!(previous["file_type"], "txt");
        let filter = MetadataFilter::file_type("md");
        let hits = index.search(&[1.0, 0.0], 3, Some(&filter)).unwrap();
        assert_eq!(ids(&hits), vec![1, 3, 2]);
        assert!(index.replace_metadata(ChunkId(42), Metadata::new()).is_none());
    }

    #[test]
    fn query_dimension_is_checked() {
        let index = sample();
        assert!(matches!(
            index.search(&[1.0], 1, None),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn empty_index_and_zero_top_k_return_nothing() {
        let index = VectorIndex::new(2, 3);
        assert!(index.search(&[1.0, 0.0], 5, None).unwrap().is_empty());
        assert!(sample().search(&[1.0, 0.0], 0, None).unwrap().is_empty());
    }

    #[test]
    fn filter_applies_after_overfetch() {
        let mut index = VectorIndex::new(2, 3);
        let mut batch = Vec::new();
        for i in 0..6 {
            batch.push(record(i, vec![1.0, i as f32 * 0.01], "txt"));
        }
        batch.push(record(100, vec![0.0, 1.0], "pdf"));
        index.add(batch).unwrap();

        // pdf ranks last: outside the 1 * 3 over-fetch window.
        let filter = MetadataFilter::file_type("pdf");
        assert!(index.search(&[1.0, 0.0], 1, Some(&filter)).unwrap().is_empty());

        let hits = index.search(&[0.0, 1.0], 2, Some(&filter)).unwrap();
        assert_eq!(ids(&hits), vec![100]);
        assert!(hits.iter().all(|h| h.metadata["file_type"] == "pdf"));
    }

    #[test]
    fn delete_rebuilds_preserving_order() {
        let mut index = sample();
        let removed = index.delete(&[ChunkId(2), ChunkId(99)]);

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, ChunkId(2));
        assert_eq!(index.ids(), &[ChunkId(1), ChunkId(3)]);
        assert_eq!(index.count(), 2);
        assert!(index.get(ChunkId(3)).is_some());

        // Removed records can be restored as-is.
        index.add(removed).unwrap();
        assert_eq!(index.count(), 3);
    }

    #[test]
    fn delete_of_unknown_ids_is_noop() {
        let mut index = sample();
        assert!(index.delete(&[ChunkId(42)]).is_empty());
        assert_eq!(index.count(), 3);
    }

    #[test]
    fn snapshot_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let index = sample();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, 2, 3).unwrap();
        assert_eq!(loaded.records(), index.records());
        assert!(!tmp.path().join("vectors.tmp").exists());
    }

    #[test]
    fn load_missing_snapshot_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let index =
            VectorIndex::load(&tmp.path().join("none.bin"), 8, 3).unwrap();
        assert_eq!(index.count(), 0);
        assert_eq!(index.dimension(), 8);
    }

    #[test]
    fn load_rejects_dimension_change() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        sample().save(&path).unwrap();
        assert!(matches!(
            VectorIndex::load(&path, 4, 3),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_rejects_length_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        sample().save(&path).unwrap();

        // Claim one more row than the file holds.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[12..20].copy_from_slice(&4u64.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            VectorIndex::load(&path, 2, 3),
            Err(Error::Snapshot(_))
        ));

        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(
            VectorIndex::load(&path, 2, 3),
            Err(Error::Snapshot(_))
        ));
    }
}
