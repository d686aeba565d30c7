//! Shared data models for discovered files and incremental change sets.
//!
//! A file's identity is its path string exactly as discovered. Paths that
//! differ only in case or separator style are distinct files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Current on-disk manifest format.
pub const MANIFEST_VERSION: u32 = 1;

/// Coarse origin of a file. Entity provenance is classified by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Source code in a programming language
    Code,
    /// Prose: markdown, plain text, reStructuredText
    Document,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Code => "code",
            SourceKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "code" => Some(SourceKind::Code),
            "document" => Some(SourceKind::Document),
            _ => None,
        }
    }

    /// Classify a language tag.
    pub fn for_language(language: &str) -> Self {
        match language {
            "markdown" | "text" | "rst" | "asciidoc" => SourceKind::Document,
            _ => SourceKind::Code,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A discovered file with its content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path as discovered (root-joined, not normalized).
    pub path: String,

    /// `xxh3:` prefixed content hash.
    pub hash: String,

    /// Detected language tag.
    pub language: String,

    pub kind: SourceKind,

    /// Last-modified marker in milliseconds since the epoch, if known.
    /// Informational only; change detection relies on the hash.
    pub modified_ms: Option<u64>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, hash: impl Into<String>, language: impl Into<String>) -> Self {
        let language = language.into();
        Self {
            path: path.into(),
            hash: hash.into(),
            kind: SourceKind::for_language(&language),
            language,
            modified_ms: None,
        }
    }
}

/// Compute the content hash used throughout the manifest.
pub fn content_hash(content: &[u8]) -> String {
    format!("xxh3:{:016x}", xxh3_64(content))
}

/// Kind of change for a file that needs extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
        }
    }
}

/// Result of comparing the current file set against the manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<FileRecord>,
    pub modified: Vec<FileRecord>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ChangeSet {
    /// Files that need extraction, in emission order (added first).
    pub fn to_extract(&self) -> impl Iterator<Item = (&FileRecord, ChangeKind)> {
        self.added
            .iter()
            .map(|f| (f, ChangeKind::Added))
            .chain(self.modified.iter().map(|f| (f, ChangeKind::Modified)))
    }

    /// Whether the build has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// One ingested file in the manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub hash: String,

    /// Milliseconds since the epoch when the entry was committed.
    #[serde(default)]
    pub updated_ms: u64,
}

/// Persisted record of what has already been ingested.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(|e| e.hash.as_str())
    }

    pub fn insert(&mut self, path: impl Into<String>, hash: impl Into<String>, updated_ms: u64) {
        self.entries.insert(
            path.into(),
            ManifestEntry {
                hash: hash.into(),
                updated_ms,
            },
        );
    }

    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
