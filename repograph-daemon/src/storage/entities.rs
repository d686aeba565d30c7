//! Entity model.

use repograph_core::SourceKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::schema::entity_id;

/// Where an entity's contributions came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Code,
    Document,
    /// Both code and documents contributed; already consolidated.
    Mixed,
}

/// An entity in the merged graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Stable id (e.g., "ent:UserService")
    pub id: String,
    /// Canonical name
    pub name: String,
    pub entity_type: String,
    /// Deduplicated join of per-file descriptions, ordered by path
    pub description: String,
    /// Contributing file paths and their kind
    pub provenance: BTreeMap<String, SourceKind>,
    pub embedding: Option<Vec<f32>>,
}

impl EntityRecord {
    pub fn origin(&self) -> Option<Origin> {
        let kinds: BTreeSet<SourceKind> = self.provenance.values().copied().collect();
        match (
            kinds.contains(&SourceKind::Code),
            kinds.contains(&SourceKind::Document),
        ) {
            (true, true) => Some(Origin::Mixed),
            (true, false) => Some(Origin::Code),
            (false, true) => Some(Origin::Document),
            (false, false) => None,
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.provenance.keys().map(String::as_str)
    }

    /// Text embedded for similarity scoring.
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.name, &self.description)
    }
}

/// Text used to embed an entity: its name, then its description.
pub fn embedding_text(name: &str, description: &str) -> String {
    if description.is_empty() {
        name.to_string()
    } else {
        format!("{}\n{}", name, description)
    }
}

/// One file's contribution to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContribution {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    /// Vector for `name\ndescription`, if computed
    pub embedding: Option<Vec<f32>>,
}

impl EntityContribution {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            description: description.into(),
            embedding: None,
        }
    }

    pub fn id(&self) -> String {
        entity_id(&self.name)
    }
}

/// Join descriptions in order, dropping empties and repeats.
pub fn join_descriptions<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut seen = BTreeSet::new();
    let mut out: Vec<&str> = Vec::new();
    for part in parts {
        let part = part.trim();
        if !part.is_empty() && seen.insert(part) {
            out.push(part);
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provenance: &[(&str, SourceKind)]) -> EntityRecord {
        EntityRecord {
            id: "ent:X".into(),
            name: "X".into(),
            entity_type: "class".into(),
            description: String::new(),
            provenance: provenance
                .iter()
                .map(|(p, k)| (p.to_string(), *k))
                .collect(),
            embedding: None,
        }
    }

    #[test]
    fn test_origin() {
        assert_eq!(record(&[("a.rs", SourceKind::Code)]).origin(), Some(Origin::Code));
        assert_eq!(
            record(&[("a.md", SourceKind::Document)]).origin(),
            Some(Origin::Document)
        );
        assert_eq!(
            record(&[("a.rs", SourceKind::Code), ("a.md", SourceKind::Document)]).origin(),
            Some(Origin::Mixed)
        );
        assert_eq!(record(&[]).origin(), None);
    }

    #[test]
    fn test_join_descriptions() {
        assert_eq!(
            join_descriptions(["Handles users.", "", "Handles users.", " Stores sessions "]),
            "Handles users.\nStores sessions"
        );
    }

    #[test]
    fn test_embedding_text() {
        assert_eq!(embedding_text("UserService", ""), "UserService");
        assert_eq!(embedding_text("UserService", "Users"), "UserService\nUsers");
    }
}
