//! Per-file unit of work applied by the graph store.

use repograph_core::{Chunk, SourceKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::entities::EntityContribution;
use super::relations::RelationContribution;

/// A text chunk with its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub file_path: String,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    pub embedding: Option<Vec<f32>>,
}

impl ChunkRecord {
    pub fn from_chunk(path: &str, chunk: Chunk, embedding: Option<Vec<f32>>) -> Self {
        Self {
            id: chunk.id,
            file_path: path.to_string(),
            content: chunk.content,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            embedding,
        }
    }
}

/// Everything one file contributes to the graph.
///
/// Applying a mutation replaces the file's previous contributions, so
/// applying the same mutation twice is the same as applying it once.
/// Every relation endpoint must also appear in `entities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMutation {
    pub path: String,
    pub hash: String,
    pub kind: SourceKind,
    pub entities: Vec<EntityContribution>,
    pub relations: Vec<RelationContribution>,
    pub chunks: Vec<ChunkRecord>,
}

impl FileMutation {
    pub fn new(path: impl Into<String>, hash: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
            kind,
            entities: Vec::new(),
            relations: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Relation endpoints that have no entity contribution.
    pub fn dangling_endpoints(&self) -> Vec<&str> {
        let names: HashSet<&str> = self.entities.iter().map(|e| e.name.as_str()).collect();
        let mut missing: Vec<&str> = self
            .relations
            .iter()
            .flat_map(|r| [r.source.as_str(), r.target.as_str()])
            .filter(|n| !names.contains(n))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }
}

/// Proof that a file's mutation committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitToken {
    /// Monotonic per store instance
    pub sequence: u64,
    pub path: String,
    /// Entity ids that did not exist before this commit
    pub created: Vec<String>,
    pub entity_count: usize,
    pub relation_count: usize,
}

/// Effect of retracting a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetractSummary {
    pub entities_removed: usize,
    pub relations_removed: usize,
}

/// Effect of consolidating two entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub relations_redirected: usize,
    pub self_loops_dropped: usize,
    pub relations_unified: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_endpoints() {
        let mut mutation = FileMutation::new("a.rs", "xxh3:1", SourceKind::Code);
        mutation.entities.push(EntityContribution::new("a", "module", ""));
        mutation.relations.push(RelationContribution::new("a", "Foo", "defines"));
        mutation.relations.push(RelationContribution::new("Foo", "Bar", "uses"));
        assert_eq!(mutation.dangling_endpoints(), vec!["Bar", "Foo"]);
    }
}
