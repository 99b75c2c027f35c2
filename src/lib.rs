//! docrag - hybrid retrieval and question answering over local documents.
//!
//! docrag indexes directories of text and markdown files into two
//! in-memory indexes kept in lockstep: an exact cosine-similarity vector
//! index (persisted as a snapshot) and a BM25 keyword index. Document and
//! chunk metadata live in a [redb](https://github.com/cberner/redb)
//! database. Searches fuse both rankings by weighted sum, and questions
//! are answered by a language model from the top retrieved chunks.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use docrag::{Config, DataDir, Engine};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = Config::load(&data_dir).unwrap();
//! let engine = Engine::open(&data_dir, config).unwrap();
//!
//! let stats = engine.index(Path::new("./notes")).unwrap();
//! println!("indexed {} file(s)", stats.indexed);
//!
//! for r in engine.search("borrow checker", 5, Some("md")).unwrap() {
//!     println!("{:.3} {}", r.score, r.snippet);
//! }
//!
//! let answer = engine.ask("How do lifetimes work?", 5, None).unwrap();
//! println!("{} (confidence {:.2})", answer.answer, answer.confidence);
//! ```

pub mod catalog;
pub mod chunking;
pub mod config;
pub mod data_dir;
pub mod doc_id;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod indexer;
pub mod keyword_index;
pub mod llm;
pub mod metadata_store;
pub mod parser;
pub mod search;
pub mod text_util;
pub mod vector_index;
pub mod walker;

pub use catalog::Catalog;
pub use config::Config;
pub use data_dir::DataDir;
pub use doc_id::{ChunkId, DocumentId};
pub use engine::{Answer, Engine, EngineStats};
pub use error::{Error, Result};
pub use indexer::{CancellationToken, FileOutcome, IndexStats, SkipReason};
pub use metadata_store::MetadataStore;
pub use search::{ScoreNormalization, SearchOptions, SearchResult};
pub use vector_index::{MetadataFilter, VectorIndex};
