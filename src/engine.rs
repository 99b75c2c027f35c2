//! The query facade tying the stores, providers and indexer together.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use serde::Serialize;

use crate::{
    catalog::{Catalog, ReconcileReport},
    config::Config,
    data_dir::DataDir,
    embedding::{Embedder, EmbeddingProvider},
    error::{Error, Result},
    indexer::{
        FileFailure,
        FileOutcome,
        IndexOptions,
        IndexStats,
        Indexer,
        Progress,
    },
    llm::{ChatMessage, LanguageModel, LlmProvider, QUESTION_MARKER, TokenStream},
    metadata_store::DocumentRecord,
    search::{SearchOptions, SearchResult, hybrid_search},
    text_util::tokenize,
};

const SYSTEM_PROMPT: &str = "You answer questions using only the numbered \
    sources you are given. Cite sources by their number. If the sources do \
    not contain the answer, say that you do not know.";

/// Returned by [`Engine::ask`] when retrieval finds nothing.
pub const NO_SOURCES_ANSWER: &str =
    "I couldn't find any relevant information in the indexed documents.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SearchResult>,
    /// Mean combined score of the sources, in `[0, 1]`.
    pub confidence: f32,
}

pub struct StreamingAnswer {
    pub sources: Vec<SearchResult>,
    pub confidence: f32,
    pub tokens: TokenStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub total_documents: u64,
    pub total_chunks: u64,
    pub vector_count: usize,
    pub documents_by_type: BTreeMap<String, u64>,
    pub total_bytes: u64,
}

/// A retrieval-augmented question answering engine over one data
/// directory.
///
/// # Examples
///
/// ```
/// use docrag::{Config, DataDir, Engine};
///
/// # let tmp = tempfile::tempdir().unwrap();
/// # let docs = tempfile::tempdir().unwrap();
/// # std::fs::write(docs.path().join("rust.txt"), "Rust frees memory through ownership.").unwrap();
/// let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
/// let engine = Engine::open(&data_dir, Config::default()).unwrap();
///
/// engine.index(docs.path()).unwrap();
/// let results = engine.search("ownership", 5, None).unwrap();
/// assert_eq!(results.len(), 1);
/// ```
pub struct Engine {
    config: Config,
    catalog: Arc<Catalog>,
    embedder: Arc<EmbeddingProvider>,
    llm: LlmProvider,
    indexer: Indexer,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("catalog", &self.catalog)
            .field("embedder", &self.embedder)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the stores in `data_dir` and build the configured providers.
    ///
    /// Fails if the metadata store or vector snapshot cannot be opened, or
    /// if the embedder's dimension differs from the vector index's.
    pub fn open(data_dir: &DataDir, config: Config) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(Catalog::open(data_dir, &config)?);
        let embedder = Arc::new(EmbeddingProvider::from_config(&config.embedding));

        let index_dimension = catalog.read()?.vectors.dimension();
        if embedder.dimension() != index_dimension {
            return Err(Error::Config(format!(
                "embedder produces {}-dimensional vectors but the index \
                 stores {index_dimension}",
                embedder.dimension()
            )));
        }

        let indexer =
            Indexer::new(catalog.clone(), embedder.clone(), &config.indexer)?;
        let llm = LlmProvider::from_config(&config.llm);
        tracing::debug!(root = %data_dir.root().display(), "engine ready");

        Ok(Self {
            config,
            catalog,
            embedder,
            llm,
            indexer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        file_type: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        self.search_with(query, &SearchOptions::new(top_k).file_type(file_type))
    }

    pub fn search_with(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if tokenize(query).is_empty() || options.top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed(query)?;
        let indexes = self.catalog.read()?;
        let results = hybrid_search(
            &indexes,
            query,
            &query_vector,
            options,
            &self.config.search,
        )?;
        tracing::debug!(query, results = results.len(), "search");
        Ok(results)
    }

    /// Answer `question` from the top `top_k` retrieved chunks.
    pub fn ask(
        &self,
        question: &str,
        top_k: usize,
        file_type: Option<&str>,
    ) -> Result<Answer> {
        let sources = self.search(question, top_k, file_type)?;
        if sources.is_empty() {
            return Ok(Answer {
                answer: NO_SOURCES_ANSWER.to_string(),
                sources,
                confidence: 0.0,
            });
        }

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(question, &sources)),
        ];
        let answer = self.llm.chat(&messages)?;
        Ok(Answer {
            answer: answer.trim().to_string(),
            confidence: confidence(&sources),
            sources,
        })
    }

    /// Like [`Engine::ask`], but the answer arrives as a [`TokenStream`].
    pub fn ask_stream(
        &self,
        question: &str,
        top_k: usize,
        file_type: Option<&str>,
    ) -> Result<StreamingAnswer> {
        let sources = self.search(question, top_k, file_type)?;
        if sources.is_empty() {
            return Ok(StreamingAnswer {
                sources,
                confidence: 0.0,
                tokens: TokenStream::spawn(|sender| {
                    let _ = sender.send(Ok(NO_SOURCES_ANSWER.to_string()));
                }),
            });
        }

        let tokens = self.llm.stream(&build_prompt(question, &sources))?;
        Ok(StreamingAnswer {
            confidence: confidence(&sources),
            sources,
            tokens,
        })
    }

    /// Index a file or, recursively, a directory.
    pub fn index(&self, path: &Path) -> Result<IndexStats> {
        self.index_with(path, IndexOptions::default())
    }

    pub fn index_with(
        &self,
        path: &Path,
        options: IndexOptions<'_>,
    ) -> Result<IndexStats> {
        if path.is_dir() {
            return self.indexer.index_directory_with(path, options);
        }

        let started = std::time::Instant::now();
        let outcome = self.indexer.index_file(path)?;
        let mut stats = IndexStats {
            total_files: 1,
            ..IndexStats::default()
        };
        match &outcome {
            FileOutcome::Indexed { chunks } => {
                stats.indexed = 1;
                stats.chunks = *chunks;
            }
            FileOutcome::Skipped(_) => stats.skipped = 1,
            FileOutcome::Failed(e) => {
                stats.failed = 1;
                stats.failures.push(FileFailure {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
        if let Some(callback) = options.progress {
            callback(Progress {
                completed: 1,
                total: 1,
                path,
                outcome: &outcome,
            });
        }
        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }

    pub fn remove_document(&self, path: &Path) -> Result<bool> {
        self.indexer.remove_document(path)
    }

    pub fn prune(&self, root: &Path) -> Result<usize> {
        self.indexer.prune(root)
    }

    /// Indexed documents whose file name or title contains `query`,
    /// ignoring case.
    pub fn find_documents(&self, query: &str) -> Result<Vec<DocumentRecord>> {
        self.catalog.store().search_documents(query)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let counts = self.catalog.counts()?;
        let store = self.catalog.store();
        Ok(EngineStats {
            total_documents: counts.documents,
            total_chunks: counts.chunks,
            vector_count: counts.vectors,
            documents_by_type: store.counts_by_type()?,
            total_bytes: store.total_bytes()?,
        })
    }

    pub fn verify(&self) -> Result<()> {
        self.catalog.verify()
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.catalog.reconcile()?;
        self.catalog.save()?;
        Ok(report)
    }

    pub fn clear(&self) -> Result<()> {
        self.catalog.clear()?;
        tracing::info!("cleared all documents");
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.catalog.save()
    }
}

fn build_prompt(question: &str, sources: &[SearchResult]) -> String {
    let mut prompt = String::from("Context:\n");
    for (i, source) in sources.iter().enumerate() {
        let label = source
            .metadata
            .get("file_name")
            .or_else(|| source.metadata.get("path"))
            .map(String::as_str)
            .unwrap_or("source");
        prompt.push_str(&format!("[{}] {label}: {}\n", i + 1, source.text.trim()));
    }
    prompt.push_str(&format!("\n{QUESTION_MARKER} {question}"));
    prompt
}

fn confidence(sources: &[SearchResult]) -> f32 {
    if sources.is_empty() {
        return 0.0;
    }
    let mean =
        sources.iter().map(|s| s.score).sum::<f32>() / sources.len() as f32;
    mean.clamp(0.0, 1.0)
}
