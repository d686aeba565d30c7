//! repograph core - synchronous building blocks for incremental graph builds.
//!
//! This crate provides:
//! - File discovery with gitignore support and content hashing (`scanner`)
//! - Manifest diffing into typed change sets (`differ`)
//! - Line-bounded chunking and draft entity detection (`parser`)
//! - Exclusion rules for merge candidates (`rules`)

pub mod differ;
pub mod parser;
pub mod rules;
pub mod scanner;
pub mod types;

pub use differ::diff;
pub use parser::{Chunk, DraftEntity, DraftRelation, LineChunker, ParseError, ParsedFile, SourceParser};
pub use rules::{normalize_name, ExclusionReason, ExclusionRules, RuleError};
pub use scanner::{discover, ScanOptions, ScanResult};
pub use types::{content_hash, ChangeKind, ChangeSet, FileRecord, Manifest, ManifestEntry, SourceKind};
