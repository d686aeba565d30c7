//! DuckDB schema for the knowledge graph.
//!
//! Entities and relations hold the merged view; the `*_sources` tables hold
//! one row per contributing file so a file's effects can be retracted
//! exactly. Embeddings are stored as JSON array strings.

/// SQL schema for creating the graph tables.
pub const SCHEMA_SQL: &str = r#"
-- Entities: merged view keyed by a stable id
CREATE TABLE IF NOT EXISTS entities (
    id VARCHAR PRIMARY KEY,
    name VARCHAR NOT NULL,
    entity_type VARCHAR NOT NULL,
    description VARCHAR NOT NULL DEFAULT '',
    embedding VARCHAR
);

-- Per-file contributions to an entity (provenance)
CREATE TABLE IF NOT EXISTS entity_sources (
    entity_id VARCHAR NOT NULL,
    file_path VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    entity_type VARCHAR NOT NULL,
    description VARCHAR NOT NULL DEFAULT ''
);

-- Relations between entities
CREATE TABLE IF NOT EXISTS relations (
    id VARCHAR PRIMARY KEY,
    source_id VARCHAR NOT NULL,
    target_id VARCHAR NOT NULL,
    description VARCHAR NOT NULL DEFAULT ''
);

-- Per-file contributions to a relation
CREATE TABLE IF NOT EXISTS relation_sources (
    relation_id VARCHAR NOT NULL,
    file_path VARCHAR NOT NULL,
    description VARCHAR NOT NULL DEFAULT ''
);

-- Ids superseded by a merge, resolved to their surviving entity
CREATE TABLE IF NOT EXISTS entity_aliases (
    alias_id VARCHAR PRIMARY KEY,
    canonical_id VARCHAR NOT NULL
);

-- Text chunks and their vectors
CREATE TABLE IF NOT EXISTS chunks (
    id VARCHAR NOT NULL,
    file_path VARCHAR NOT NULL,
    content VARCHAR NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    embedding VARCHAR
);

-- Metadata table: version, build info
CREATE TABLE IF NOT EXISTS metadata (
    key VARCHAR PRIMARY KEY,
    value VARCHAR
);

CREATE INDEX IF NOT EXISTS idx_entity_sources_entity ON entity_sources(entity_id);
CREATE INDEX IF NOT EXISTS idx_entity_sources_file ON entity_sources(file_path);
CREATE INDEX IF NOT EXISTS idx_relation_sources_relation ON relation_sources(relation_id);
CREATE INDEX IF NOT EXISTS idx_relation_sources_file ON relation_sources(file_path);
CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);
"#;

/// Schema version stored in `metadata`.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Stable entity id for an entity name. The name is used exactly.
pub fn entity_id(name: &str) -> String {
    format!("ent:{}", name)
}

/// Stable relation id for a pair of entity ids.
pub fn relation_id(source_id: &str, target_id: &str) -> String {
    format!("rel:{}->{}", source_id, target_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        assert_eq!(entity_id("UserService"), "ent:UserService");
        assert_ne!(entity_id("UserService"), entity_id("userservice"));
        assert_eq!(
            relation_id("ent:a", "ent:b"),
            "rel:ent:a->ent:b"
        );
    }
}
