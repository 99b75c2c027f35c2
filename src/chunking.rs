//! Chunking utilities for splitting long documents into retrieval units.
//!
//! Text is split into paragraphs at blank lines, and consecutive paragraphs
//! are packed greedily into chunks of at most `chunk_size` characters. A
//! paragraph that alone exceeds the budget is split into windows at word
//! boundaries, with adjacent windows overlapping by up to `overlap`
//! characters.

use crate::config::IndexerConfig;

/// Chunk size and overlap in characters.
///
/// # Examples
///
/// ```
/// use docrag::{chunking::ChunkingConfig, config::IndexerConfig};
///
/// let config = ChunkingConfig::from(&IndexerConfig::default());
/// assert_eq!(config.chunk_size, 1000);
/// assert_eq!(config.overlap, 100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl From<&IndexerConfig> for ChunkingConfig {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            overlap: config.chunk_overlap,
        }
    }
}

/// A chunk of text from a larger document.
///
/// `start` and `end` are character offsets into the text passed to
/// [`chunk_text`]; `text` is exactly that span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Zero-based chunk index within the chunked text.
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// Split text into chunks.
///
/// Whitespace-only input yields no chunks. Properly handles UTF-8 multi-byte
/// characters.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{chunk_text, ChunkingConfig};
///
/// let config = ChunkingConfig { chunk_size: 1000, overlap: 0 };
/// let chunks = chunk_text("Hello, world!", config);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].text, "Hello, world!");
///
/// let text = "first paragraph\n\nsecond paragraph";
/// let config = ChunkingConfig { chunk_size: 20, overlap: 0 };
/// assert_eq!(chunk_text(text, config).len(), 2);
/// ```
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<Chunk> {
    let chunk_size = config.chunk_size.max(1);
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (para_start, para_end) in paragraphs(text) {
        if let Some((start, _)) = current
            && text[start..para_end].chars().count() <= chunk_size
        {
            current = Some((start, para_end));
            continue;
        }

        if let Some(span) = current.take() {
            spans.push(span);
        }

        if text[para_start..para_end].chars().count() <= chunk_size {
            current = Some((para_start, para_end));
        } else {
            spans.extend(split_long(
                text,
                para_start,
                para_end,
                chunk_size,
                config.overlap,
            ));
        }
    }
    if let Some(span) = current {
        spans.push(span);
    }

    let mut counter = CharCounter::default();
    spans
        .into_iter()
        .enumerate()
        .map(|(index, (start_byte, end_byte))| {
            let slice = &text[start_byte..end_byte];
            let start = counter.advance_to(text, start_byte);
            Chunk {
                text: slice.to_string(),
                index,
                start,
                end: start + slice.chars().count(),
            }
        })
        .collect()
}

/// Byte spans of the trimmed, non-empty paragraphs of `text`.
fn paragraphs(text: &str) -> Vec<(usize, usize)> {
    let mut result = Vec::new();
    let mut open: Option<(usize, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        if line.trim().is_empty() {
            if let Some(span) = open.take() {
                result.push(span);
            }
            continue;
        }

        let leading = line.len() - line.trim_start().len();
        let content_end = line_start + line.trim_end().len();
        open = match open {
            Some((start, _)) => Some((start, content_end)),
            None => Some((line_start + leading, content_end)),
        };
    }
    if let Some(span) = open {
        result.push(span);
    }

    result
}

/// Split an oversized paragraph into overlapping windows, breaking at
/// whitespace where possible.
fn split_long(
    text: &str,
    para_start: usize,
    para_end: usize,
    chunk_size: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = text[para_start..para_end]
        .char_indices()
        .map(|(i, c)| (para_start + i, c))
        .collect();
    let n = chars.len();
    let byte_at = |i: usize| if i < n { chars[i].0 } else { para_end };

    let mut spans = Vec::new();
    let mut start = 0;
    while start < n {
        let mut end = (start + chunk_size).min(n);
        if end < n
            && let Some(ws) =
                (start + 1..=end).rev().find(|&i| chars[i].1.is_whitespace())
        {
            end = ws;
        }
        // Trailing whitespace stays out of the window.
        let mut trimmed_end = end;
        while trimmed_end > start && chars[trimmed_end - 1].1.is_whitespace() {
            trimmed_end -= 1;
        }
        spans.push((byte_at(start), byte_at(trimmed_end)));

        if end >= n {
            break;
        }

        let mut next = end.saturating_sub(overlap).max(start + 1);
        while next < end && !chars[next - 1].1.is_whitespace() {
            next += 1;
        }
        while next < n && chars[next].1.is_whitespace() {
            next += 1;
        }
        start = next;
    }

    spans
}

/// Converts ascending byte offsets to character offsets in one pass.
#[derive(Default)]
struct CharCounter {
    byte: usize,
    chars: usize,
}

impl CharCounter {
    fn advance_to(&mut self, text: &str, byte: usize) -> usize {
        if byte >= self.byte {
            self.chars += text[self.byte..byte].chars().count();
        } else {
            self.chars -= text[byte..self.byte].chars().count();
        }
        self.byte = byte;
        self.chars
    }
}
