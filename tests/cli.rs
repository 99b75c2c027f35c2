use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

use serde_json::Value;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn docrag_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_docrag") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("docrag");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}

fn docrag(
    data_dir: &Path,
    args: &[&str],
) -> Result<Output, Box<dyn std::error::Error>> {
    Ok(Command::new(docrag_bin()?)
        .args(args)
        .env("DOCRAG_DATA_DIR", data_dir)
        .env_remove("DOCRAG_CONFIG")
        .env("DOCRAG_LOG", "off")
        .output()?)
}

fn json_stdout(output: &Output) -> Result<Value, Box<dyn std::error::Error>> {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn write_docs(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(
        dir.join("bread.txt"),
        "Knead the dough and let it rise overnight.",
    )?;
    std::fs::write(
        dir.join("tea.md"),
        "# Tea\n\nSteep green tea for two minutes.",
    )?;
    Ok(())
}

#[test]
fn index_search_and_stats_as_json() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    write_docs(docs.path())?;
    let docs_arg = docs.path().to_str().ok_or("non-utf8 temp path")?;

    let stats = json_stdout(&docrag(data.path(), &["index", docs_arg, "--json"])?)?;
    assert_eq!(stats["indexed"], 2);
    assert_eq!(stats["failed"], 0);

    let search = json_stdout(&docrag(
        data.path(),
        &["search", "dough", "-n", "1", "--json"],
    )?)?;
    assert_eq!(search["query"], "dough");
    assert_eq!(search["result_count"], 1);
    assert_eq!(search["results"][0]["metadata"]["file_name"], "bread.txt");

    let filtered = json_stdout(&docrag(
        data.path(),
        &["search", "dough", "--type", "md", "--json"],
    )?)?;
    let results = filtered["results"].as_array().ok_or("results array")?;
    assert!(results.iter().all(|r| r["metadata"]["file_type"] == "md"));

    let totals = json_stdout(&docrag(data.path(), &["stats", "--json"])?)?;
    assert_eq!(totals["total_documents"], 2);
    assert_eq!(totals["documents_by_type"]["txt"], 1);
    Ok(())
}

#[test]
fn ask_prints_answer_and_sources() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    write_docs(docs.path())?;
    let docs_arg = docs.path().to_str().ok_or("non-utf8 temp path")?;
    docrag(data.path(), &["index", docs_arg, "--no-progress"])?;

    let answer = json_stdout(&docrag(
        data.path(),
        &["ask", "How long should green tea steep?", "--json"],
    )?)?;
    assert!(
        answer["answer"]
            .as_str()
            .is_some_and(|a| a.contains("two minutes"))
    );
    assert!(!answer["sources"].as_array().ok_or("sources")?.is_empty());

    let streamed = docrag(
        data.path(),
        &["ask", "How long should green tea steep?", "--stream"],
    )?;
    assert!(streamed.status.success());
    let stdout = String::from_utf8(streamed.stdout)?;
    assert!(stdout.contains("two minutes"));
    assert!(stdout.contains("Sources"));
    Ok(())
}

#[test]
fn remove_and_clear_report_misuse() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    write_docs(docs.path())?;
    let docs_arg = docs.path().to_str().ok_or("non-utf8 temp path")?;
    docrag(data.path(), &["index", docs_arg, "--no-progress"])?;

    let bread = docs.path().join("bread.txt");
    let bread_arg = bread.to_str().ok_or("non-utf8 temp path")?;
    assert!(docrag(data.path(), &["remove", bread_arg])?.status.success());
    assert!(!docrag(data.path(), &["remove", bread_arg])?.status.success());

    assert!(!docrag(data.path(), &["clear"])?.status.success());
    assert!(docrag(data.path(), &["clear", "--yes"])?.status.success());

    let totals = json_stdout(&docrag(data.path(), &["stats", "--json"])?)?;
    assert_eq!(totals["total_documents"], 0);
    assert_eq!(totals["vector_count"], 0);

    let report = json_stdout(&docrag(data.path(), &["reconcile", "--json"])?)?;
    assert_eq!(report["orphan_vectors_removed"], 0);
    assert_eq!(report["documents_removed"], 0);
    Ok(())
}

#[test]
fn find_lists_matching_documents() -> TestResult {
    let data = tempfile::tempdir()?;
    let docs = tempfile::tempdir()?;
    write_docs(docs.path())?;
    let docs_arg = docs.path().to_str().ok_or("non-utf8 temp path")?;
    docrag(data.path(), &["index", docs_arg, "--no-progress"])?;

    let found = json_stdout(&docrag(data.path(), &["find", "TEA", "--json"])?)?;
    let found = found.as_array().ok_or("documents array")?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["name"], "tea.md");
    assert_eq!(found[0]["title"], "Tea");

    let none = json_stdout(&docrag(data.path(), &["find", "coffee", "--json"])?)?;
    assert_eq!(none.as_array().map(Vec::len), Some(0));
    Ok(())
}
