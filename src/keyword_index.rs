//! In-memory BM25 keyword index over chunk text.
//!
//! Not persisted: the catalog rebuilds it from the vector snapshot records
//! at startup.

use std::collections::{HashMap, HashSet};

use crate::{config::Bm25Params, doc_id::ChunkId, text_util::tokenize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeywordHit {
    pub id: ChunkId,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct Entry {
    /// Insertion sequence, the tie-breaker for equal scores.
    seq: u64,
    length: u32,
    term_freqs: HashMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct KeywordIndex {
    params: Bm25Params,
    entries: HashMap<ChunkId, Entry>,
    postings: HashMap<String, HashSet<ChunkId>>,
    total_length: u64,
    next_seq: u64,
}

impl KeywordIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            entries: HashMap::new(),
            postings: HashMap::new(),
            total_length: 0,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Index `(id, text)` pairs. Re-adding an id replaces its text and moves
    /// it to the end of the insertion order.
    pub fn add_documents<'a>(
        &mut self,
        documents: impl IntoIterator<Item = (ChunkId, &'a str)>,
    ) {
        for (id, text) in documents {
            self.remove_one(id);

            let tokens = tokenize(text);
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens.iter() {
                *term_freqs.entry(token.clone()).or_default() += 1;
            }
            for term in term_freqs.keys() {
                self.postings.entry(term.clone()).or_default().insert(id);
            }

            self.total_length += tokens.len() as u64;
            self.entries.insert(
                id,
                Entry {
                    seq: self.next_seq,
                    length: tokens.len() as u32,
                    term_freqs,
                },
            );
            self.next_seq += 1;
        }
    }

    /// Remove ids from the index, returning how many were present.
    pub fn remove(&mut self, ids: &[ChunkId]) -> usize {
        ids.iter().filter(|id| self.remove_one(**id)).count()
    }

    fn remove_one(&mut self, id: ChunkId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        for term in entry.term_freqs.keys() {
            if let Some(docs) = self.postings.get_mut(term) {
                docs.remove(&id);
                if docs.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_length -= u64::from(entry.length);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.postings.clear();
        self.total_length = 0;
    }

    /// Rank chunks containing at least one query term, best first.
    ///
    /// `idf(t) = ln((N - df + 0.5) / (df + 0.5) + 1)` and each present term
    /// contributes `idf * tf * (k1 + 1) / (tf + k1 * (1 - b + b * L / avgL))`.
    /// Repeated query terms count once.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<KeywordHit> {
        if top_k == 0 || self.entries.is_empty() {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();

        let n = self.entries.len() as f32;
        let avg_length = self.total_length as f32 / n;
        let Bm25Params { k1, b } = self.params;

        let mut scores: HashMap<ChunkId, f32> = HashMap::new();
        for term in &terms {
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for id in docs {
                let entry = &self.entries[id];
                let tf = entry.term_freqs[term] as f32;
                let length_ratio = if avg_length > 0.0 {
                    entry.length as f32 / avg_length
                } else {
                    1.0
                };
                let contribution = idf * tf * (k1 + 1.0)
                    / (tf + k1 * (1.0 - b + b * length_ratio));
                *scores.entry(*id).or_default() += contribution;
            }
        }

        let mut hits: Vec<(u64, KeywordHit)> = scores
            .into_iter()
            .map(|(id, score)| (self.entries[&id].seq, KeywordHit { id, score }))
            .collect();
        hits.sort_by(|(seq_a, a), (seq_b, b)| {
            b.score.total_cmp(&a.score).then(seq_a.cmp(seq_b))
        });
        hits.into_iter().take(top_k).map(|(_, hit)| hit).collect()
    }
}
