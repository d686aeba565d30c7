//! Storage layer for repograph.
//!
//! Provides:
//! - DuckDB-backed graph and vector store with per-file transactions
//! - Entity/relation models with explicit provenance
//! - JSON manifest of ingested files, journaled between builds
//! - Per-storage settings with the remembered source directories
//! - The storage directory lock

mod entities;
mod graphbase;
mod lock;
mod manifest;
mod mutation;
mod relations;
mod schema;
mod settings;

pub use entities::{embedding_text, join_descriptions, EntityContribution, EntityRecord, Origin};
pub use graphbase::{GraphBase, GraphStats, GraphStore, StoreError, DATABASE_FILENAME};
pub use lock::{LockError, LockMeta, StorageLock, LOCK_FILENAME};
pub use manifest::{JsonManifest, ManifestError, ManifestStore, JOURNAL_FILENAME, MANIFEST_FILENAME};
pub use mutation::{ChunkRecord, CommitToken, FileMutation, MergeOutcome, RetractSummary};
pub use relations::{RelationContribution, RelationRecord};
pub use schema::{entity_id, relation_id};
pub use settings::{normalize_source_dirs, SettingsError, StorageSettings, SETTINGS_FILENAME};
