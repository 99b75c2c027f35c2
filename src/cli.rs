use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    about = "Hybrid retrieval and question answering over your documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of docrag.json
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index a file or directory (incremental)
    Index(IndexArgs),
    /// Hybrid vector + keyword search
    Search(SearchArgs),
    /// Answer a question from the indexed documents
    Ask(AskArgs),
    /// List indexed documents whose name or title matches
    Find(FindArgs),
    /// Remove a document from the index
    Remove(RemoveArgs),
    /// Show index statistics
    Stats(StatsArgs),
    /// Repair disagreement between the vector index and metadata store
    Reconcile(StatsArgs),
    /// Delete every indexed document
    Clear(ClearArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// File or directory to index
    pub path: PathBuf,

    /// Number of parallel workers (defaults to the configured value)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Also remove documents under PATH whose files were deleted
    #[arg(long)]
    pub prune: bool,

    /// Do not show a progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Output the summary as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results
    #[arg(short = 'n', long, default_value_t = 10)]
    pub count: usize,

    /// Only return chunks from files of this type (e.g. md, txt)
    #[arg(short = 't', long = "type")]
    pub file_type: Option<String>,

    /// Minimum combined score (defaults to the configured value)
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question to answer
    pub question: String,

    /// Number of source chunks to retrieve
    #[arg(short = 'n', long, default_value_t = 5)]
    pub count: usize,

    /// Only use chunks from files of this type
    #[arg(short = 't', long = "type")]
    pub file_type: Option<String>,

    /// Print the answer as it is generated
    #[arg(long, conflicts_with = "json")]
    pub stream: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Find --

#[derive(Debug, Parser)]
pub struct FindArgs {
    /// Case-insensitive text to look for in file names and titles
    pub query: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Remove --

#[derive(Debug, Parser)]
pub struct RemoveArgs {
    /// Path of the document to remove
    pub path: PathBuf,
}

// -- Stats / Reconcile --

#[derive(Debug, Parser)]
pub struct StatsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Clear --

#[derive(Debug, Parser)]
pub struct ClearArgs {
    /// Confirm deleting everything
    #[arg(long)]
    pub yes: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docrag",
            &mut std::io::stdout(),
        );
    }
}
