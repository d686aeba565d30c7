//! Turning file content into chunks and draft graph elements.
//!
//! The build pipeline only depends on the [`SourceParser`] trait. The
//! bundled [`LineChunker`] splits content on line boundaries and picks up
//! top-level definitions (code) or headings (documents) as draft entities,
//! which the LLM pass may enrich further.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::types::SourceKind;

/// Errors from parsing a single file. Always file-local.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("content looks binary (NUL byte at offset {0})")]
    Binary(usize),

    #[error("invalid content: {0}")]
    Invalid(String),
}

/// A contiguous run of lines sent to the LLM and the embedding index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Format: `chunk:{path}:{start_line}-{end_line}`
    pub id: String,
    pub content: String,
    /// 1-based, inclusive
    pub start_line: u32,
    pub end_line: u32,
}

impl Chunk {
    pub fn new(path: &str, content: String, start_line: u32, end_line: u32) -> Self {
        Self {
            id: format!("chunk:{}:{}-{}", path, start_line, end_line),
            content,
            start_line,
            end_line,
        }
    }
}

/// An entity proposed by the parser or the LLM, before it gets an id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftEntity {
    pub name: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

impl DraftEntity {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            description: description.into(),
        }
    }
}

/// A relation between two draft entities, by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRelation {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
}

impl DraftRelation {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            description: description.into(),
        }
    }
}

/// Output of parsing one file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub chunks: Vec<Chunk>,
    pub entities: Vec<DraftEntity>,
    pub relations: Vec<DraftRelation>,
}

/// Parser collaborator used by extraction workers.
pub trait SourceParser: Send + Sync {
    fn parse(&self, path: &str, content: &str, language: &str) -> Result<ParsedFile, ParseError>;
}

static DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:(?:pub(?:\([^)]*\))?|export|public|private|protected|internal|abstract|static|final|async|default)\s+)*(fn|def|class|struct|enum|trait|interface|function|type|func)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("definition regex is valid")
});

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#{1,6}\s+(.+?)\s*#*\s*$").expect("heading regex is valid"));

/// Line-bounded chunker with lightweight definition and heading detection.
#[derive(Clone, Debug)]
pub struct LineChunker {
    /// Soft upper bound on chunk size in bytes. A single longer line still
    /// forms one chunk.
    pub chunk_size: usize,
}

impl Default for LineChunker {
    fn default() -> Self {
        Self { chunk_size: 1200 }
    }
}

impl LineChunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Split `content` into chunks at line boundaries.
    pub fn chunk(&self, path: &str, content: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut buf = String::new();
        let mut start_line = 1u32;
        let mut line_no = 0u32;

        for line in content.split_inclusive('\n') {
            line_no += 1;
            if !buf.is_empty() && buf.len() + line.len() > self.chunk_size {
                push_chunk(&mut chunks, path, &mut buf, start_line, line_no - 1);
                start_line = line_no;
            }
            buf.push_str(line);
        }
        push_chunk(&mut chunks, path, &mut buf, start_line, line_no);

        chunks
    }
}

fn push_chunk(chunks: &mut Vec<Chunk>, path: &str, buf: &mut String, start: u32, end: u32) {
    if buf.trim().is_empty() {
        buf.clear();
        return;
    }
    chunks.push(Chunk::new(path, std::mem::take(buf), start, end));
}

fn definition_type(keyword: &str) -> &'static str {
    match keyword {
        "fn" | "def" | "function" | "func" => "function",
        "class" | "struct" => "class",
        "interface" | "trait" => "interface",
        _ => "type",
    }
}

/// Name used for the file-level entity of a code file.
pub fn module_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

impl SourceParser for LineChunker {
    fn parse(&self, path: &str, content: &str, language: &str) -> Result<ParsedFile, ParseError> {
        if language.is_empty() {
            return Err(ParseError::UnsupportedLanguage(language.to_string()));
        }
        if let Some(offset) = content.find('\0') {
            return Err(ParseError::Binary(offset));
        }

        let mut parsed = ParsedFile {
            chunks: self.chunk(path, content),
            ..Default::default()
        };

        match SourceKind::for_language(language) {
            SourceKind::Code => {
                let module = module_name(path);
                parsed.entities.push(DraftEntity::new(
                    &module,
                    "module",
                    format!("{} module at {}", language, path),
                ));

                for (idx, line) in content.lines().enumerate() {
                    let Some(caps) = DEFINITION.captures(line) else {
                        continue;
                    };
                    let name = &caps[2];
                    let kind = definition_type(&caps[1]);
                    parsed.entities.push(DraftEntity::new(
                        name,
                        kind,
                        format!("{} {} defined in {} line {}", kind, name, path, idx + 1),
                    ));
                    parsed
                        .relations
                        .push(DraftRelation::new(&module, name, "defines"));
                }
            }
            SourceKind::Document => {
                for line in content.lines() {
                    if let Some(caps) = HEADING.captures(line) {
                        let title = caps[1].trim();
                        if !title.is_empty() {
                            parsed.entities.push(DraftEntity::new(
                                title,
                                "concept",
                                format!("Section \"{}\" in {}", title, path),
                            ));
                        }
                    }
                }
            }
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_splits_on_line_boundaries() {
        let chunker = LineChunker::new(10);
        let chunks = chunker.chunk("a.txt", "aaaa\nbbbb\ncccc\n");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "aaaa\nbbbb\n");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 2));
        assert_eq!(chunks[1].content, "cccc\n");
        assert_eq!(chunks[1].id, "chunk:a.txt:3-3");
    }

    #[test]
    fn test_chunk_oversized_line_stays_whole() {
        let chunker = LineChunker::new(4);
        let chunks = chunker.chunk("a.txt", "abcdefgh\nxy");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "abcdefgh\n");
        assert_eq!(chunks[1].content, "xy");
    }

    #[test]
    fn test_chunk_empty_content() {
        let chunker = LineChunker::default();
        assert!(chunker.chunk("a.txt", "").is_empty());
        assert!(chunker.chunk("a.txt", "\n\n  \n").is_empty());
    }

    #[test]
    fn test_parse_code_definitions() {
        let source = "use std::io;\n\npub struct UserService {}\n\npub async fn load_user() {}\nclass Other:\n";
        let parsed = LineChunker::default()
            .parse("src/user_service.rs", source, "rust")
            .unwrap();

        let names: Vec<_> = parsed.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["user_service", "UserService", "load_user", "Other"]);
        assert_eq!(parsed.entities[1].entity_type, "class");
        assert_eq!(parsed.entities[2].entity_type, "function");
        assert_eq!(parsed.relations.len(), 3);
        assert_eq!(parsed.relations[0].source, "user_service");
        assert_eq!(parsed.chunks.len(), 1);
    }

    #[test]
    fn test_parse_document_headings() {
        let source = "# UserService\n\nHandles users.\n\n## Storage ##\n";
        let parsed = LineChunker::default()
            .parse("docs/design.md", source, "markdown")
            .unwrap();

        let names: Vec<_> = parsed.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["UserService", "Storage"]);
        assert!(parsed.relations.is_empty());
    }

    #[test]
    fn test_parse_rejects_binary() {
        let err = LineChunker::default()
            .parse("a.rs", "fn a() {}\0", "rust")
            .unwrap_err();
        assert_eq!(err, ParseError::Binary(9));
    }
}
