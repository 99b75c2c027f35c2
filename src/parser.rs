//! Document parsers.
//!
//! Each parser turns a file into an ordered list of text chunks plus
//! document-level metadata. The set of parsers is closed: [`ParserKind`]
//! enumerates them and [`ParserRegistry`] picks one by file extension.

use std::{collections::BTreeMap, path::Path};

use crate::{
    chunking::{ChunkingConfig, chunk_text},
    error::{Error, Result},
};

/// One chunk produced by a parser.
///
/// `start`/`end` are character offsets into the file's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub page: Option<u32>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    /// Parser-supplied keys, copied onto every chunk's metadata.
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDocument {
    pub chunks: Vec<ParsedChunk>,
    pub metadata: DocumentMetadata,
}

pub trait DocumentParser {
    /// Lowercase extensions (without the dot) this parser accepts.
    fn extensions(&self) -> &'static [&'static str];

    fn parse(&self, path: &Path) -> Result<ParsedDocument>;

    fn can_parse(&self, path: &Path) -> bool {
        extension_of(path)
            .is_some_and(|ext| self.extensions().contains(&ext.as_str()))
    }
}

/// Lowercase extension of a path, used as the document type tag.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes).map_err(|_| Error::Parse {
        path: path.to_path_buf(),
        reason: "file is not valid UTF-8".to_string(),
    })
}

/// Plain text: the whole file is chunked by paragraphs.
#[derive(Debug, Clone, Copy)]
pub struct TextParser {
    chunking: ChunkingConfig,
}

impl TextParser {
    pub fn new(chunking: ChunkingConfig) -> Self {
        Self { chunking }
    }

    fn parse_str(&self, content: &str) -> ParsedDocument {
        let chunks = chunk_text(content, self.chunking)
            .into_iter()
            .map(|chunk| ParsedChunk {
                text: chunk.text,
                start: chunk.start,
                end: chunk.end,
                page: None,
                section: None,
            })
            .collect();
        ParsedDocument {
            chunks,
            metadata: DocumentMetadata::default(),
        }
    }
}

impl DocumentParser for TextParser {
    fn extensions(&self) -> &'static [&'static str] {
        &["txt", "text", "log", "csv", "rst"]
    }

    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        Ok(self.parse_str(&read_text(path)?))
    }
}

/// Markdown: optional front matter, then one or more chunks per heading
/// section. The section label is the heading text.
#[derive(Debug, Clone, Copy)]
pub struct MarkdownParser {
    chunking: ChunkingConfig,
}

impl MarkdownParser {
    pub fn new(chunking: ChunkingConfig) -> Self {
        Self { chunking }
    }

    fn parse_str(&self, content: &str, path: &Path) -> ParsedDocument {
        let (front_matter, body_offset) = split_front_matter(content);
        let body = &content[body_offset..];
        let mut base_chars = content[..body_offset].chars().count();
        let mut base_byte = 0;

        let mut chunks = Vec::new();
        for section in sections(body) {
            base_chars += body[base_byte..section.start].chars().count();
            base_byte = section.start;

            let section_text = &body[section.start..section.end];
            for chunk in chunk_text(section_text, self.chunking) {
                chunks.push(ParsedChunk {
                    text: chunk.text,
                    start: base_chars + chunk.start,
                    end: base_chars + chunk.end,
                    page: None,
                    section: section.heading.clone(),
                });
            }
        }

        let mut metadata = DocumentMetadata::default();
        for (key, value) in front_matter {
            match key.as_str() {
                "title" => metadata.title = Some(value),
                "author" => metadata.author = Some(value),
                _ => {
                    metadata.extra.insert(key, value);
                }
            }
        }
        if metadata.title.is_none() {
            metadata.title = Some(extract_title(body, path));
        }

        ParsedDocument { chunks, metadata }
    }
}

impl DocumentParser for MarkdownParser {
    fn extensions(&self) -> &'static [&'static str] {
        &["md", "markdown"]
    }

    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        Ok(self.parse_str(&read_text(path)?, path))
    }
}

/// Extract a title from markdown content.
///
/// Looks for the first level-one heading (line starting with `# `).
/// Falls back to the filename without extension.
fn extract_title(content: &str, file_path: &Path) -> String {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let title = heading.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }

    file_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}

/// Parse a leading `---` delimited block of `key: value` lines.
///
/// Returns the pairs and the byte offset where the body starts. Content
/// without a closed front matter block is returned untouched.
fn split_front_matter(content: &str) -> (Vec<(String, String)>, usize) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (Vec::new(), 0);
    };

    let mut pairs = Vec::new();
    let mut offset = 4;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim();
        if trimmed == "---" {
            return (pairs, offset);
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                pairs.push((key.trim().to_lowercase(), value.to_string()));
            }
        }
    }

    (Vec::new(), 0)
}

struct Section {
    heading: Option<String>,
    start: usize,
    end: usize,
}

/// Split markdown into heading sections (byte spans, covering the text).
///
/// Each section starts at its heading line; text before the first heading
/// forms an unlabelled section. Headings inside fenced code are ignored.
fn sections(body: &str) -> Vec<Section> {
    let mut result = vec![Section {
        heading: None,
        start: 0,
        end: body.len(),
    }];
    let mut in_fence = false;
    let mut offset = 0;

    for line in body.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(heading) = heading_text(trimmed) {
            if let Some(last) = result.last_mut() {
                last.end = line_start;
            }
            result.push(Section {
                heading: Some(heading),
                start: line_start,
                end: body.len(),
            });
        }
    }

    result.retain(|s| !body[s.start..s.end].trim().is_empty());
    result
}

fn heading_text(line: &str) -> Option<String> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// The built-in parsers.
#[derive(Debug, Clone, Copy)]
pub enum ParserKind {
    Text(TextParser),
    Markdown(MarkdownParser),
}

impl DocumentParser for ParserKind {
    fn extensions(&self) -> &'static [&'static str] {
        match self {
            ParserKind::Text(p) => p.extensions(),
            ParserKind::Markdown(p) => p.extensions(),
        }
    }

    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        match self {
            ParserKind::Text(p) => p.parse(path),
            ParserKind::Markdown(p) => p.parse(path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParserRegistry {
    parsers: Vec<ParserKind>,
}

impl ParserRegistry {
    pub fn new(chunking: ChunkingConfig) -> Self {
        Self {
            parsers: vec![
                ParserKind::Markdown(MarkdownParser::new(chunking)),
                ParserKind::Text(TextParser::new(chunking)),
            ],
        }
    }

    pub fn for_path(&self, path: &Path) -> Option<&ParserKind> {
        self.parsers.iter().find(|p| p.can_parse(path))
    }

    /// Parse a file with the first parser accepting its extension.
    pub fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let parser = self.for_path(path).ok_or_else(|| Error::Parse {
            path: path.to_path_buf(),
            reason: match extension_of(path) {
                Some(ext) => format!("unsupported file type: .{ext}"),
                None => "unsupported file type: no extension".to_string(),
            },
        })?;
        parser.parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(chunk_size: usize) -> ParserRegistry {
        ParserRegistry::new(ChunkingConfig {
            chunk_size,
            overlap: 0,
        })
    }

    #[test]
    fn extract_title_from_heading() {
        let content = "# My Document\n\nSome body text.";
        assert_eq!(extract_title(content, Path::new("file.md")), "My Document");
    }

    #[test]
    fn extract_title_skips_empty_heading() {
        let content = "# \n\nSome text with no real heading.";
        assert_eq!(extract_title(content, Path::new("notes.md")), "notes");
    }

    #[test]
    fn extract_title_fallback_to_filename() {
        let content = "No heading here, just plain text.";
        assert_eq!(
            extract_title(content, Path::new("my-notes.md")),
            "my-notes"
        );
    }

    #[test]
    fn text_file_paragraphs_become_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        let para = "lorem ipsum dolor sit amet consectetur adipiscing";
        std::fs::write(&path, format!("{para}\n\n{para}\n\n{para}\n"))
            .unwrap();

        let doc = registry(64).parse(&path).unwrap();
        assert_eq!(doc.chunks.len(), 3);
        assert!(doc.chunks.iter().all(|c| c.section.is_none()));
        assert_eq!(doc.metadata.title, None);
    }

    #[test]
    fn markdown_sections_are_labelled() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("guide.md");
        std::fs::write(
            &path,
            "# Install\n\nRun the installer.\n\n## Usage\n\nCall it.\n",
        )
        .unwrap();

        let doc = registry(1000).parse(&path).unwrap();
        assert_eq!(doc.chunks.len(), 2);
        assert_eq!(doc.chunks[0].section.as_deref(), Some("Install"));
        assert_eq!(doc.chunks[1].section.as_deref(), Some("Usage"));
        assert!(doc.chunks[1].text.starts_with("## Usage"));
        assert_eq!(doc.metadata.title.as_deref(), Some("Install"));
    }

    #[test]
    fn markdown_offsets_point_into_file() {
        let content = "intro line\n\n# A\n\nalpha\n\n# B\n\nbeta\n";
        let parser = MarkdownParser::new(ChunkingConfig {
            chunk_size: 1000,
            overlap: 0,
        });
        let doc = parser.parse_str(content, Path::new("x.md"));

        assert_eq!(doc.chunks.len(), 3);
        assert_eq!(doc.chunks[0].section, None);
        let chars: Vec<char> = content.chars().collect();
        for chunk in &doc.chunks {
            let span: String = chars[chunk.start..chunk.end].iter().collect();
            assert_eq!(span, chunk.text);
        }
    }

    #[test]
    fn front_matter_sets_metadata() {
        let content = "---\ntitle: \"Field Notes\"\nauthor: Ada\ntags: rust\n---\n# Ignored\n\nBody.\n";
        let parser = MarkdownParser::new(ChunkingConfig {
            chunk_size: 1000,
            overlap: 0,
        });
        let doc = parser.parse_str(content, Path::new("x.md"));

        assert_eq!(doc.metadata.title.as_deref(), Some("Field Notes"));
        assert_eq!(doc.metadata.author.as_deref(), Some("Ada"));
        assert_eq!(doc.metadata.extra.get("tags").map(String::as_str), Some("rust"));
        assert!(doc.chunks.iter().all(|c| !c.text.contains("author")));
    }

    #[test]
    fn headings_in_code_fences_are_ignored() {
        let content = "# Real\n\n```sh\n# not a heading\n```\n";
        assert_eq!(sections(content).len(), 1);
    }

    #[test]
    fn heading_detection() {
        assert_eq!(heading_text("## Usage ##"), Some("Usage".to_string()));
        assert_eq!(heading_text("#hashtag"), None);
        assert_eq!(heading_text("####### seven"), None);
    }

    #[test]
    fn unsupported_extension_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("report.pdf");
        std::fs::write(&path, "%PDF").unwrap();

        let err = registry(100).parse(&path).unwrap_err();
        match err {
            Error::Parse { reason, .. } => assert!(reason.contains(".pdf")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.txt");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            registry(100).parse(&path),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn extension_matching_ignores_case() {
        let registry = registry(100);
        assert!(matches!(
            registry.for_path(Path::new("README.MD")),
            Some(ParserKind::Markdown(_))
        ));
        assert!(registry.for_path(Path::new("Makefile")).is_none());
    }
}
