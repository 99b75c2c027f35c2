use std::io::Write;

use clap::Parser;
use kdam::BarExt;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};
use docrag::{
    Config,
    DataDir,
    Engine,
    error::{self, Error},
    indexer::{IndexOptions, IndexStats, Progress},
    search::{self, SearchOptions},
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(&data_dir)?,
    };
    let engine = Engine::open(&data_dir, config)?;

    match cli.command {
        Command::Index(args) => cmd_index(&engine, &args)?,
        Command::Search(args) => {
            let mut options = SearchOptions::new(args.count)
                .file_type(args.file_type.as_deref());
            options.min_score = args.min_score;
            let results = engine.search_with(&args.query, &options)?;
            if args.json {
                search::format_json(&results, &args.query)?;
            } else {
                search::format_human(&results);
            }
        }
        Command::Ask(args) => cmd_ask(&engine, &args)?,
        Command::Find(args) => {
            let documents = engine.find_documents(&args.query)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&documents)?);
            } else if documents.is_empty() {
                println!("No documents match \"{}\".", args.query);
            } else {
                for doc in &documents {
                    match &doc.title {
                        Some(title) => println!("{}  ({title})", doc.path),
                        None => println!("{}", doc.path),
                    }
                }
            }
        }
        Command::Remove(args) => {
            if !engine.remove_document(&args.path)? {
                return Err(Error::NotFound {
                    kind: "document",
                    name: args.path.display().to_string(),
                });
            }
            println!("Removed {}", args.path.display());
        }
        Command::Stats(args) => {
            let stats = engine.stats()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Data directory: {}", data_dir.root().display());
                println!("Documents: {}", stats.total_documents);
                for (file_type, count) in &stats.documents_by_type {
                    println!("  {file_type}: {count}");
                }
                println!("Chunks: {}", stats.total_chunks);
                println!("Vectors: {}", stats.vector_count);
                println!("Total size: {} bytes", stats.total_bytes);
            }
        }
        Command::Reconcile(args) => {
            let report = engine.reconcile()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_clean() {
                println!("Index is consistent.");
            } else {
                println!(
                    "Removed {} orphan vector(s) and {} incomplete document(s).",
                    report.orphan_vectors_removed, report.documents_removed
                );
            }
        }
        Command::Clear(args) => {
            if !args.yes {
                return Err(Error::Config(
                    "refusing to clear the index without --yes".into(),
                ));
            }
            engine.clear()?;
            println!("Cleared all documents.");
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn cmd_index(engine: &Engine, args: &cli::IndexArgs) -> error::Result<()> {
    let show_progress = !args.no_progress && !args.json && args.path.is_dir();
    let mut bar = kdam::tqdm!(desc = "Indexing", unit = " files");
    let mut on_progress = |p: Progress<'_>| {
        bar.total = p.total;
        bar.update(1).ok();
    };

    let stats = engine.index_with(
        &args.path,
        IndexOptions {
            max_workers: args.workers,
            cancel: None,
            progress: if show_progress {
                Some(&mut on_progress)
            } else {
                None
            },
        },
    )?;
    if show_progress {
        eprintln!();
    }

    let pruned = if args.prune && args.path.is_dir() {
        engine.prune(&args.path)?
    } else {
        0
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_index_summary(&stats, pruned);
    }
    Ok(())
}

fn print_index_summary(stats: &IndexStats, pruned: usize) {
    println!(
        "Indexed {} file(s) ({} chunks), skipped {}, failed {} in {} ms",
        stats.indexed, stats.chunks, stats.skipped, stats.failed, stats.duration_ms
    );
    if pruned > 0 {
        println!("Pruned {pruned} missing document(s)");
    }
    for failure in &stats.failures {
        eprintln!("  failed: {}: {}", failure.path.display(), failure.reason);
    }
    for warning in &stats.warnings {
        eprintln!("Warning: {warning}");
    }
    if stats.cancelled {
        eprintln!("Indexing was cancelled before all files were processed.");
    }
}

fn cmd_ask(engine: &Engine, args: &cli::AskArgs) -> error::Result<()> {
    let file_type = args.file_type.as_deref();

    if args.stream {
        let streaming = engine.ask_stream(&args.question, args.count, file_type)?;
        let mut stdout = std::io::stdout().lock();
        for fragment in streaming.tokens {
            write!(stdout, "{}", fragment?)?;
            stdout.flush()?;
        }
        writeln!(stdout)?;
        drop(stdout);
        print_sources(&streaming.sources, streaming.confidence);
        return Ok(());
    }

    let answer = engine.ask(&args.question, args.count, file_type)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        println!("{}", answer.answer);
        print_sources(&answer.sources, answer.confidence);
    }
    Ok(())
}

fn print_sources(sources: &[search::SearchResult], confidence: f32) {
    if sources.is_empty() {
        return;
    }
    println!("\nSources (confidence {confidence:.2}):");
    for source in sources {
        let path = source
            .metadata
            .get("path")
            .map(String::as_str)
            .unwrap_or("?");
        println!("  [{}] {path} ({:.3})", source.rank, source.score);
    }
}
