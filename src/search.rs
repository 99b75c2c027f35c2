use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    catalog::Indexes,
    config::SearchConfig,
    doc_id::ChunkId,
    error::Result,
    text_util::{snippet, tokenize},
    vector_index::{Metadata, MetadataFilter},
};

/// How raw sub-scores are mapped to `[0, 1]` before fusion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreNormalization {
    /// Cosine clamped to `[0, 1]`; BM25 divided by the candidate maximum.
    #[default]
    Calibrated,
    /// Min-max within each candidate set. A flat set maps to 1.
    MinMax,
    /// `1 - rank / len` within each candidate set.
    Rank,
}

impl ScoreNormalization {
    fn vector(self, scores: &[f32]) -> Vec<f32> {
        match self {
            ScoreNormalization::Calibrated => {
                scores.iter().map(|s| s.clamp(0.0, 1.0)).collect()
            }
            ScoreNormalization::MinMax => min_max(scores),
            ScoreNormalization::Rank => by_rank(scores.len()),
        }
    }

    fn keyword(self, scores: &[f32]) -> Vec<f32> {
        match self {
            ScoreNormalization::Calibrated => {
                let max = scores.iter().copied().fold(0.0f32, f32::max);
                if max > 0.0 {
                    scores.iter().map(|s| s / max).collect()
                } else {
                    vec![0.0; scores.len()]
                }
            }
            ScoreNormalization::MinMax => min_max(scores),
            ScoreNormalization::Rank => by_rank(scores.len()),
        }
    }
}

fn min_max(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range <= f32::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / range).collect()
}

fn by_rank(len: usize) -> Vec<f32> {
    (0..len).map(|i| 1.0 - i as f32 / len as f32).collect()
}

/// Per-query options. Unset fields fall back to [`SearchConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    pub top_k: usize,
    pub filter: Option<MetadataFilter>,
    pub min_score: Option<f32>,
}

impl SearchOptions {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }

    pub fn file_type(mut self, file_type: Option<&str>) -> Self {
        self.filter = file_type.map(MetadataFilter::file_type);
        self
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// A fused search hit.
///
/// `vector_score` and `keyword_score` are the normalized components, so
/// `score = w_vector * vector_score + w_keyword * keyword_score`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub rank: usize,
    pub chunk_id: ChunkId,
    pub score: f32,
    pub vector_score: f32,
    pub keyword_score: f32,
    pub text: String,
    pub snippet: String,
    pub metadata: Metadata,
}

struct Candidate {
    id: ChunkId,
    vector: f32,
    keyword: f32,
    combined: f32,
}

/// Hybrid retrieval over both indexes.
///
/// 1. Each index returns `top_k * candidate_multiplier` candidates
///    (times the filter over-fetch factor when a filter is set)
/// 2. Sub-scores are normalized and combined by weighted sum
/// 3. Filter and minimum score are applied to the fused list
/// 4. The list is truncated to `top_k` and snippets are attached
///
/// Vector candidates come first in the tie order, followed by keyword-only
/// candidates in keyword rank order.
pub fn hybrid_search(
    indexes: &Indexes,
    query: &str,
    query_vector: &[f32],
    options: &SearchOptions,
    config: &SearchConfig,
) -> Result<Vec<SearchResult>> {
    if options.top_k == 0
        || tokenize(query).is_empty()
        || indexes.vectors.is_empty()
    {
        return Ok(Vec::new());
    }

    let filter = options.filter.as_ref().filter(|f| !f.is_empty());
    let mut candidates_per_index =
        options.top_k.saturating_mul(config.candidate_multiplier.max(1));
    if filter.is_some() {
        candidates_per_index =
            candidates_per_index.saturating_mul(config.filter_overfetch.max(1));
    }

    let vector_hits =
        indexes.vectors.search(query_vector, candidates_per_index, None)?;
    let keyword_hits = indexes.keywords.search(query, candidates_per_index);

    let vector_norm = config.normalization.vector(
        &vector_hits.iter().map(|h| h.score).collect::<Vec<_>>(),
    );
    let keyword_norm = config.normalization.keyword(
        &keyword_hits.iter().map(|h| h.score).collect::<Vec<_>>(),
    );
    let keyword_lookup: HashMap<ChunkId, f32> = keyword_hits
        .iter()
        .zip(&keyword_norm)
        .map(|(hit, norm)| (hit.id, *norm))
        .collect();

    let mut candidates: Vec<Candidate> = vector_hits
        .iter()
        .zip(&vector_norm)
        .map(|(hit, &vector)| Candidate {
            id: hit.id,
            vector,
            keyword: keyword_lookup.get(&hit.id).copied().unwrap_or(0.0),
            combined: 0.0,
        })
        .collect();
    let in_vector_set: HashSet<ChunkId> =
        candidates.iter().map(|c| c.id).collect();
    candidates.extend(
        keyword_hits
            .iter()
            .zip(&keyword_norm)
            .filter(|(hit, _)| !in_vector_set.contains(&hit.id))
            .filter(|(hit, _)| indexes.vectors.contains(hit.id))
            .map(|(hit, &keyword)| Candidate {
                id: hit.id,
                vector: 0.0,
                keyword,
                combined: 0.0,
            }),
    );

    for candidate in &mut candidates {
        candidate.combined = config.vector_weight * candidate.vector
            + config.keyword_weight * candidate.keyword;
    }
    // Stable: equal scores keep candidate order.
    candidates.sort_by(|a, b| b.combined.total_cmp(&a.combined));

    let min_score = options.min_score.unwrap_or(config.min_score);
    let results = candidates
        .into_iter()
        .filter(|c| c.combined >= min_score)
        .filter_map(|c| {
            let (text, metadata) = indexes.vectors.payload(c.id)?;
            if filter.is_some_and(|f| !f.matches(metadata)) {
                return None;
            }
            Some((c, text, metadata))
        })
        .take(options.top_k)
        .enumerate()
        .map(|(i, (c, text, metadata))| SearchResult {
            rank: i + 1,
            chunk_id: c.id,
            score: c.combined,
            vector_score: c.vector,
            keyword_score: c.keyword,
            text: text.to_string(),
            snippet: snippet(text, query, config.snippet_chars),
            metadata: metadata.clone(),
        })
        .collect();

    Ok(results)
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for r in results {
        let path = r.metadata.get("path").map(String::as_str).unwrap_or("?");
        println!("{:>3}. [{:.3}] {path}", r.rank, r.score);
        if let Some(section) = r.metadata.get("section") {
            println!("     § {section}");
        }
        println!("     {}", r.snippet.replace('\n', " "));
    }
    println!("\n{} result(s)", results.len());
}

#[derive(Serialize)]
struct JsonResults<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [SearchResult],
}

/// Format results as JSON output.
pub fn format_json(results: &[SearchResult], query: &str) -> Result<()> {
    let output = JsonResults {
        query,
        result_count: results.len(),
        results,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        config::Bm25Params,
        keyword_index::KeywordIndex,
        vector_index::{VectorIndex, VectorRecord},
    };

    fn record(id: u64, vector: [f32; 2], text: &str, file_type: &str) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("file_type".to_string(), file_type.to_string());
        VectorRecord {
            id: ChunkId(id),
            vector: vector.to_vec(),
            text: text.to_string(),
            metadata,
        }
    }

    fn indexes(records: Vec<VectorRecord>) -> Indexes {
        let mut keywords = KeywordIndex::new(Bm25Params::default());
        keywords.add_documents(records.iter().map(|r| (r.id, r.text.as_str())));
        let mut vectors = VectorIndex::new(2, 3);
        vectors.add(records).unwrap();
        Indexes { vectors, keywords }
    }

    fn search(
        indexes: &Indexes,
        query: &str,
        vector: [f32; 2],
        options: SearchOptions,
    ) -> Vec<SearchResult> {
        hybrid_search(indexes, query, &vector, &options, &SearchConfig::default())
            .unwrap()
    }

    #[test]
    fn vector_only_hit_gets_zero_keyword_score() {
        let idx = indexes(vec![
            record(1, [1.0, 0.0], "alpha", "txt"),
            record(2, [0.6, 0.8], "beta gamma", "txt"),
        ]);
        let results = search(&idx, "beta", [1.0, 0.0], SearchOptions::new(5));

        assert_eq!(results.len(), 2);
        // 0.7 * 0.6 + 0.3 * 1.0 beats 0.7 * 1.0 + 0.3 * 0.0.
        assert_eq!(results[0].chunk_id, ChunkId(2));
        assert!((results[0].score - 0.72).abs() < 1e-5);
        assert_eq!(results[1].chunk_id, ChunkId(1));
        assert_eq!(results[1].keyword_score, 0.0);
        assert!((results[1].score - 0.7).abs() < 1e-5);
        assert_eq!(
            results.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn keyword_only_candidate_is_fused() {
        let idx = indexes(vec![
            record(1, [1.0, 0.0], "alpha", "txt"),
            record(2, [0.9, 0.1], "beta", "txt"),
            record(3, [0.0, 1.0], "needle", "txt"),
        ]);
        let config = SearchConfig {
            vector_weight: 0.2,
            keyword_weight: 0.8,
            ..SearchConfig::default()
        };
        // top_k 1 fetches two vector candidates; chunk 3 is not among them.
        let results = hybrid_search(
            &idx,
            "needle",
            &[1.0, 0.0],
            &SearchOptions::new(1),
            &config,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, ChunkId(3));
        assert_eq!(results[0].vector_score, 0.0);
        assert_eq!(results[0].keyword_score, 1.0);
        assert_eq!(results[0].text, "needle");
    }

    #[test]
    fn filter_is_applied_after_fusion() {
        let idx = indexes(vec![
            record(1, [1.0, 0.0], "report one", "txt"),
            record(2, [0.9, 0.1], "report two", "pdf"),
            record(3, [0.8, 0.2], "report three", "md"),
        ]);
        let results = search(
            &idx,
            "report",
            [1.0, 0.0],
            SearchOptions::new(5).file_type(Some("pdf")),
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata["file_type"], "pdf");
        assert_eq!(results[0].rank, 1);
    }

    #[test]
    fn min_score_drops_weak_hits() {
        let idx = indexes(vec![
            record(1, [1.0, 0.0], "alpha", "txt"),
            record(2, [0.0, 1.0], "beta", "txt"),
        ]);
        let results = search(
            &idx,
            "unrelated",
            [1.0, 0.0],
            SearchOptions::new(5).min_score(0.5),
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, ChunkId(1));

        let results = search(
            &idx,
            "unrelated",
            [-1.0, 0.0],
            SearchOptions::new(5).min_score(0.5),
        );
        assert!(results.is_empty());
    }

    #[test]
    fn ties_keep_vector_rank_order() {
        let idx = indexes(vec![
            record(1, [1.0, 0.0], "same words", "txt"),
            record(2, [1.0, 0.0], "same words", "txt"),
        ]);
        let results = search(&idx, "same", [1.0, 0.0], SearchOptions::new(5));
        assert_eq!(results[0].chunk_id, ChunkId(1));
        assert_eq!(results[1].chunk_id, ChunkId(2));
        assert_eq!(results[0].score, results[1].score);
    }

    #[test]
    fn empty_query_or_index_returns_nothing() {
        let idx = indexes(vec![record(1, [1.0, 0.0], "alpha", "txt")]);
        assert!(search(&idx, "", [1.0, 0.0], SearchOptions::new(5)).is_empty());
        assert!(search(&idx, "  ?! ", [1.0, 0.0], SearchOptions::new(5)).is_empty());
        assert!(search(&idx, "alpha", [1.0, 0.0], SearchOptions::new(0)).is_empty());

        let empty = indexes(Vec::new());
        assert!(search(&empty, "alpha", [1.0, 0.0], SearchOptions::new(5)).is_empty());
    }

    #[test]
    fn snippet_is_attached() {
        let text = format!("{} the needle is here {}", "x ".repeat(200), "y ".repeat(200));
        let idx = indexes(vec![record(1, [1.0, 0.0], &text, "txt")]);
        let results = search(&idx, "needle", [1.0, 0.0], SearchOptions::new(1));
        assert!(results[0].snippet.contains("needle"));
        assert!(results[0].snippet.starts_with("..."));
        assert!(results[0].snippet.ends_with("..."));
    }

    #[test]
    fn normalizations() {
        let scores = [4.0, 2.0, 2.0];
        assert_eq!(min_max(&scores), vec![1.0, 0.0, 0.0]);
        assert_eq!(min_max(&[3.0, 3.0]), vec![1.0, 1.0]);
        assert_eq!(by_rank(4), vec![1.0, 0.75, 0.5, 0.25]);
        assert_eq!(
            ScoreNormalization::Calibrated.keyword(&scores),
            vec![1.0, 0.5, 0.5]
        );
        assert_eq!(
            ScoreNormalization::Calibrated.vector(&[1.2, 0.5, -0.3]),
            vec![1.0, 0.5, 0.0]
        );
    }

    #[test]
    fn normalization_serializes_snake_case() {
        let json = serde_json::to_string(&ScoreNormalization::MinMax).unwrap();
        assert_eq!(json, "\"min_max\"");
    }

    proptest! {
        #[test]
        fn combined_scores_stay_in_unit_range(
            vectors in proptest::collection::vec((-1.0f32..1.0, -1.0f32..1.0), 1..20),
            query in (-1.0f32..1.0, -1.0f32..1.0),
            mode in prop_oneof![
                Just(ScoreNormalization::Calibrated),
                Just(ScoreNormalization::MinMax),
                Just(ScoreNormalization::Rank),
            ],
        ) {
            prop_assume!(query.0.abs() + query.1.abs() > 1e-3);
            let records: Vec<VectorRecord> = vectors
                .iter()
                .enumerate()
                .filter(|(_, (x, y))| x.abs() + y.abs() > 1e-3)
                .map(|(i, (x, y))| {
                    let text = if i % 2 == 0 { "even term" } else { "odd term" };
                    record(i as u64 + 1, [*x, *y], text, "txt")
                })
                .collect();
            prop_assume!(!records.is_empty());
            let idx = indexes(records);
            let config = SearchConfig {
                normalization: mode,
                ..SearchConfig::default()
            };
            let results = hybrid_search(
                &idx,
                "even",
                &[query.0, query.1],
                &SearchOptions::new(10),
                &config,
            )
            .unwrap();
            for r in &results {
                prop_assert!((0.0..=1.0 + 1e-5).contains(&r.score));
            }
            for pair in results.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
