//! Relation model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A directed relation between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRecord {
    /// Format: `rel:{source_id}->{target_id}`
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub description: String,
    pub provenance: BTreeSet<String>,
}

/// One file's contribution to a relation, with endpoints given by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationContribution {
    pub source: String,
    pub target: String,
    pub description: String,
}

impl RelationContribution {
    pub fn new(source: impl Into<String>, target: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            description: description.into(),
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}
