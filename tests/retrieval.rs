use std::path::Path;

use docrag::{Config, DataDir, Engine, SearchOptions, engine::NO_SOURCES_ANSWER};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn indexed_engine(
    data: &Path,
    docs: &Path,
) -> Result<Engine, Box<dyn std::error::Error>> {
    std::fs::write(
        docs.join("rust.md"),
        "# Ownership\n\nEvery value in Rust has a single owner. When the owner \
         goes out of scope the value is dropped.\n\n\
         # Borrowing\n\nReferences borrow a value without taking ownership.",
    )?;
    std::fs::write(
        docs.join("kitchen.txt"),
        "Knead the dough for ten minutes, then let it rise.",
    )?;
    std::fs::write(
        docs.join("garden.txt"),
        "Water tomatoes early in the morning.",
    )?;

    let mut config = Config::default();
    config.embedding.dimension = 256;
    config.indexer.chunk_size = 120;
    config.indexer.chunk_overlap = 10;
    let engine = Engine::open(&DataDir::resolve(Some(data))?, config)?;
    engine.index(docs)?;
    Ok(engine)
}

#[test]
fn keyword_match_ranks_first() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    let engine = indexed_engine(data.path(), docs.path())?;

    let results = engine.search("dough", 3, None)?;
    assert_eq!(results[0].metadata["file_name"], "kitchen.txt");
    assert!(results[0].keyword_score > 0.0);
    assert!(results[0].snippet.contains("dough"));
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
        assert_eq!(pair[0].rank + 1, pair[1].rank);
    }
    Ok(())
}

#[test]
fn scores_are_bounded_and_decomposed() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    let engine = indexed_engine(data.path(), docs.path())?;
    let weights = engine.config().search.clone();

    for result in engine.search("value owner scope", 10, None)? {
        assert!((0.0..=1.0 + 1e-6).contains(&result.score));
        let expected = weights.vector_weight * result.vector_score
            + weights.keyword_weight * result.keyword_score;
        assert!((result.score - expected).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn file_type_filter_is_exact() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    let engine = indexed_engine(data.path(), docs.path())?;

    assert!(engine.search("value tomatoes dough", 10, Some("pdf"))?.is_empty());

    let md = engine.search("value tomatoes dough", 10, Some("md"))?;
    assert!(!md.is_empty());
    assert!(md.iter().all(|r| r.metadata["file_type"] == "md"));

    let txt = engine.search("value tomatoes dough", 10, Some("txt"))?;
    assert_eq!(txt.len(), 2);
    assert!(txt.iter().all(|r| r.metadata["file_type"] == "txt"));
    Ok(())
}

#[test]
fn unrelated_query_with_threshold_is_empty() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    let engine = indexed_engine(data.path(), docs.path())?;

    let options = SearchOptions::new(5).min_score(0.5);
    assert!(engine.search_with("zebra quasar xylophone", &options)?.is_empty());
    assert!(engine.search("", 5, None)?.is_empty());
    Ok(())
}

#[test]
fn empty_index_returns_empty_results() -> TestResult {
    let data = tempfile::tempdir()?;
    let mut config = Config::default();
    config.embedding.dimension = 32;
    let engine = Engine::open(&DataDir::resolve(Some(data.path()))?, config)?;

    assert!(engine.search("anything", 5, None)?.is_empty());
    let answer = engine.ask("anything?", 5, None)?;
    assert_eq!(answer.answer, NO_SOURCES_ANSWER);
    assert_eq!(answer.confidence, 0.0);
    Ok(())
}

#[test]
fn ask_cites_retrieved_sources() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    let engine = indexed_engine(data.path(), docs.path())?;

    let question = "What happens when the owner goes out of scope?";
    let answer = engine.ask(question, 3, Some("md"))?;
    assert!(answer.answer.contains("dropped"));
    assert!(!answer.sources.is_empty());
    assert!(answer.sources.iter().all(|s| s.metadata["file_type"] == "md"));
    assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);

    let streamed = engine.ask_stream(question, 3, Some("md"))?;
    let fragments: Vec<String> =
        streamed.tokens.collect::<Result<_, _>>()?;
    assert!(fragments.len() > 1);
    assert_eq!(fragments.concat(), answer.answer);
    Ok(())
}
