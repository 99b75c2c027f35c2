//! Answer generation.
//!
//! [`LanguageModel`] turns role-tagged messages into text, either all at
//! once ([`LanguageModel::chat`]) or incrementally ([`LanguageModel::stream`]).
//! Streams are backed by a channel fed from a producer thread; dropping the
//! [`TokenStream`] closes the channel and the producer stops at its next send.

use std::{
    collections::HashSet,
    io::{BufRead, BufReader},
    sync::{OnceLock, mpsc},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    config::{LlmBackend, LlmConfig},
    error::{Error, Result},
    text_util::tokenize,
};

/// Marks the start of the question in prompts built by the engine.
pub const QUESTION_MARKER: &str = "Question:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Text fragments delivered in generation order.
///
/// Iteration ends when the producer finishes. A failed generation yields
/// one `Err` item and then ends.
pub struct TokenStream {
    receiver: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    /// Spawn `producer` on its own thread and stream what it sends.
    ///
    /// The producer should stop as soon as a send fails.
    pub fn spawn<F>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<String>>) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || producer(sender));
        Self { receiver }
    }

    /// Drain the stream into one string, stopping at the first error.
    pub fn collect_text(self) -> Result<String> {
        let mut text = String::new();
        for fragment in self {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

pub trait LanguageModel: Send + Sync {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    fn stream(&self, prompt: &str) -> Result<TokenStream>;
}

/// Offline model answering with the context sentences that best overlap
/// the question.
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveModel {
    max_sentences: usize,
}

impl Default for ExtractiveModel {
    fn default() -> Self {
        Self::new()
    }
}

pub const NO_ANSWER: &str =
    "I could not find an answer to that in the indexed documents.";

impl ExtractiveModel {
    pub fn new() -> Self {
        Self { max_sentences: 3 }
    }

    fn answer(&self, prompt: &str) -> String {
        let (context, question) = match prompt.rfind(QUESTION_MARKER) {
            Some(at) => {
                (&prompt[..at], &prompt[at + QUESTION_MARKER.len()..])
            }
            None => (prompt, prompt),
        };
        let wanted: HashSet<String> = tokenize(question).into_iter().collect();

        let mut scored: Vec<(usize, usize, &str)> = sentences(context)
            .into_iter()
            .enumerate()
            .filter_map(|(position, sentence)| {
                let overlap = tokenize(sentence)
                    .into_iter()
                    .collect::<HashSet<_>>()
                    .intersection(&wanted)
                    .count();
                (overlap > 0).then_some((overlap, position, sentence))
            })
            .collect();
        if scored.is_empty() {
            return NO_ANSWER.to_string();
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(self.max_sentences);
        scored.sort_by_key(|(_, position, _)| *position);
        scored
            .iter()
            .map(|(_, _, sentence)| *sentence)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Sentences of `text`, skipping source labels such as `[1] notes.md:`.
fn sentences(text: &str) -> Vec<&str> {
    let mut result = Vec::new();
    for line in text.lines() {
        let line = line
            .trim_start()
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
            .and_then(|(_, labelled)| labelled.split_once(':'))
            .map(|(_, body)| body)
            .unwrap_or(line);

        let mut start = 0;
        let bytes = line.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            let boundary = matches!(b, b'.' | b'!' | b'?')
                && bytes.get(i + 1).is_none_or(|n| n.is_ascii_whitespace());
            if boundary {
                push_sentence(&mut result, &line[start..=i]);
                start = i + 1;
            }
        }
        push_sentence(&mut result, &line[start..]);
    }
    result
}

fn push_sentence<'a>(out: &mut Vec<&'a str>, candidate: &'a str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() {
        out.push(trimmed);
    }
}

impl LanguageModel for ExtractiveModel {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| Error::Llm("no user message to answer".into()))?;
        Ok(self.answer(&prompt.content))
    }

    fn stream(&self, prompt: &str) -> Result<TokenStream> {
        let answer = self.answer(prompt);
        Ok(TokenStream::spawn(move |sender| {
            for (i, word) in answer.split(' ').enumerate() {
                let fragment = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {word}")
                };
                if sender.send(Ok(fragment)).is_err() {
                    break;
                }
            }
        }))
    }
}

#[derive(Debug, Serialize)]
struct Options {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: Options,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: Options,
}

/// One line of the newline-delimited `/api/generate` stream.
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

/// Chat model served by Ollama (`/api/chat`, streaming `/api/generate`).
#[derive(Debug)]
pub struct OllamaModel {
    url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl OllamaModel {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        tracing::debug!(url = %self.url, model = %self.model, "llm client ready");
        Ok(self.client.get_or_init(|| client))
    }

    fn check(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(Error::Llm(format!("server returned {status}: {body}")))
    }
}

impl LanguageModel for OllamaModel {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self
            .client()?
            .post(format!("{}/api/chat", self.url))
            .json(&ChatRequest {
                model: &self.model,
                messages,
                stream: false,
                options: Options {
                    temperature: self.temperature,
                },
            })
            .send()
            .map_err(|e| Error::Llm(format!("request failed: {e}")))?;

        let parsed: ChatResponse = Self::check(response)?.json()?;
        Ok(parsed.message.content)
    }

    fn stream(&self, prompt: &str) -> Result<TokenStream> {
        let response = self
            .client()?
            .post(format!("{}/api/generate", self.url))
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: true,
                options: Options {
                    temperature: self.temperature,
                },
            })
            .send()
            .map_err(|e| Error::Llm(format!("request failed: {e}")))?;
        let response = Self::check(response)?;

        Ok(TokenStream::spawn(move |sender| {
            for line in BufReader::new(response).lines() {
                let item = line.map_err(Error::from).and_then(|line| {
                    if line.trim().is_empty() {
                        return Ok(None);
                    }
                    let chunk: GenerateChunk = serde_json::from_str(&line)?;
                    if let Some(error) = chunk.error {
                        return Err(Error::Llm(error));
                    }
                    Ok(Some(chunk))
                });

                match item {
                    Ok(None) => continue,
                    Ok(Some(chunk)) => {
                        if !chunk.response.is_empty()
                            && sender.send(Ok(chunk.response)).is_err()
                        {
                            return;
                        }
                        if chunk.done {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = sender.send(Err(e));
                        return;
                    }
                }
            }
        }))
    }
}

/// The configured answer model.
#[derive(Debug)]
pub enum LlmProvider {
    Extractive(ExtractiveModel),
    Ollama(OllamaModel),
}

impl LlmProvider {
    pub fn from_config(config: &LlmConfig) -> Self {
        match config.provider {
            LlmBackend::Extractive => {
                LlmProvider::Extractive(ExtractiveModel::new())
            }
            LlmBackend::Ollama => LlmProvider::Ollama(OllamaModel::new(config)),
        }
    }
}

impl LanguageModel for LlmProvider {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        match self {
            LlmProvider::Extractive(m) => m.chat(messages),
            LlmProvider::Ollama(m) => m.chat(messages),
        }
    }

    fn stream(&self, prompt: &str) -> Result<TokenStream> {
        match self {
            LlmProvider::Extractive(m) => m.stream(prompt),
            LlmProvider::Ollama(m) => m.stream(prompt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = "Context:\n\
        [1] rust.md: Rust has no garbage collector. Memory is freed by ownership.\n\
        [2] soup.txt: Tomato soup needs basil.\n\n\
        Question: How is memory freed in Rust?";

    #[test]
    fn extractive_picks_overlapping_sentences() {
        let model = ExtractiveModel::new();
        let answer = model
            .chat(&[ChatMessage::system("answer"), ChatMessage::user(PROMPT)])
            .unwrap();
        assert!(answer.contains("Memory is freed by ownership."));
        assert!(!answer.contains("basil"));
        assert!(!answer.contains("rust.md"));
    }

    #[test]
    fn extractive_without_overlap_says_so() {
        let model = ExtractiveModel::new();
        let prompt = "Context:\n[1] a.txt: Cats sleep.\n\nQuestion: quantum?";
        assert_eq!(model.answer(prompt), NO_ANSWER);
    }

    #[test]
    fn chat_requires_user_message() {
        let model = ExtractiveModel::new();
        assert!(matches!(
            model.chat(&[ChatMessage::system("hi")]),
            Err(Error::Llm(_))
        ));
    }

    #[test]
    fn stream_reassembles_chat_answer() {
        let model = ExtractiveModel::new();
        let streamed = model.stream(PROMPT).unwrap().collect_text().unwrap();
        assert_eq!(streamed, model.answer(PROMPT));
    }

    #[test]
    fn stream_yields_fragments_in_order() {
        let stream = TokenStream::spawn(|sender| {
            for word in ["a", "b", "c"] {
                if sender.send(Ok(word.to_string())).is_err() {
                    break;
                }
            }
        });
        let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect();
        assert_eq!(fragments, vec!["a", "b", "c"]);
    }

    #[test]
    fn dropping_stream_stops_producer() {
        let (done_tx, done_rx) = mpsc::channel();
        let mut stream = TokenStream::spawn(move |sender| {
            let mut sent = 0usize;
            while sender.send(Ok("x".to_string())).is_ok() {
                sent += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = done_tx.send(sent);
        });

        assert!(stream.next().is_some());
        drop(stream);
        let sent = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(sent >= 1);
    }

    #[test]
    fn stream_error_is_delivered() {
        let stream = TokenStream::spawn(|sender| {
            let _ = sender.send(Ok("partial".to_string()));
            let _ = sender.send(Err(Error::Llm("boom".into())));
        });
        assert!(matches!(stream.collect_text(), Err(Error::Llm(_))));
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn provider_from_config() {
        let provider = LlmProvider::from_config(&LlmConfig::default());
        assert!(matches!(provider, LlmProvider::Extractive(_)));
    }
}
