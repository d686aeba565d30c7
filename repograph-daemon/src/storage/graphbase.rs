//! GraphBase - DuckDB-backed storage for the knowledge graph.
//!
//! Every mutation runs in one transaction: a file's previous contributions
//! are removed, the new ones inserted, orphans pruned and merged
//! descriptions refreshed before commit. Readers never see half a file.

use duckdb::{params, Connection};
use repograph_core::SourceKind;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use super::entities::{join_descriptions, EntityRecord};
use super::mutation::{ChunkRecord, CommitToken, FileMutation, MergeOutcome, RetractSummary};
use super::relations::RelationRecord;
use super::schema::{entity_id, relation_id, SCHEMA_SQL, SCHEMA_VERSION};

/// File name of the database inside the storage directory.
pub const DATABASE_FILENAME: &str = "graph.duckdb";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("invalid mutation for {path}: {message}")]
    InvalidMutation { path: String, message: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Graph statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
    pub chunk_count: usize,
    pub file_count: usize,
    pub embedded_entities: usize,
}

/// Graph and vector store used by the writer and the merge engine.
///
/// Only one actor mutates the store at a time: the writer during a build,
/// the merge engine afterwards.
pub trait GraphStore: Send + Sync {
    /// Replace `mutation.path`'s contributions atomically.
    fn apply_file(&self, mutation: &FileMutation) -> Result<CommitToken, StoreError>;

    /// Remove everything whose sole provenance was `path`.
    fn retract_file(&self, path: &str) -> Result<RetractSummary, StoreError>;

    /// All entities, ordered by id.
    fn entities(&self) -> Result<Vec<EntityRecord>, StoreError>;

    fn entity(&self, id: &str) -> Result<Option<EntityRecord>, StoreError>;

    /// Follow merge aliases to the surviving id.
    fn canonical_id(&self, id: &str) -> Result<String, StoreError>;

    /// All relations, ordered by id.
    fn relations(&self) -> Result<Vec<RelationRecord>, StoreError>;

    fn chunks_for(&self, path: &str) -> Result<Vec<ChunkRecord>, StoreError>;

    fn set_entity_embedding(&self, id: &str, embedding: &[f32]) -> Result<(), StoreError>;

    /// Fold `superseded` into `survivor` atomically.
    fn merge_entities(&self, survivor: &str, superseded: &str) -> Result<MergeOutcome, StoreError>;

    fn stats(&self) -> Result<GraphStats, StoreError>;
}

/// DuckDB implementation of [`GraphStore`].
pub struct GraphBase {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    sequence: AtomicU64,
}

impl GraphBase {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let base = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            sequence: AtomicU64::new(0),
        };
        base.init_schema()?;
        Ok(base)
    }

    /// Open `graph.duckdb` inside a storage directory.
    pub fn open_in_dir(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(storage_dir.as_ref().join(DATABASE_FILENAME))
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let base = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            sequence: AtomicU64::new(0),
        };
        base.init_schema()?;
        Ok(base)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire the connection lock. A poisoned mutex is recovered; the
    /// connection itself is still usable after a panicking holder.
    fn acquire_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering from poisoned database mutex");
                poisoned.into_inner()
            }
        }
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.acquire_conn();
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn query_strings(conn: &Connection, sql: &str, arg: &str) -> Result<Vec<String>, duckdb::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![arg], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn query_opt_string(conn: &Connection, sql: &str, arg: &str) -> Result<Option<String>, duckdb::Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![arg])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn entity_exists(conn: &Connection, id: &str) -> Result<bool, duckdb::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM entities WHERE id = ?",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn relation_exists(conn: &Connection, id: &str) -> Result<bool, duckdb::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM relations WHERE id = ?",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn resolve_alias(conn: &Connection, id: &str) -> Result<String, duckdb::Error> {
    Ok(query_opt_string(
        conn,
        "SELECT canonical_id FROM entity_aliases WHERE alias_id = ?",
        id,
    )?
    .unwrap_or_else(|| id.to_string()))
}

fn encode_embedding(embedding: Option<&Vec<f32>>) -> Result<Option<String>, serde_json::Error> {
    embedding.map(serde_json::to_string).transpose()
}

fn decode_embedding(raw: Option<String>) -> Option<Vec<f32>> {
    // Malformed vectors are treated as missing and recomputed on demand
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Ids touched by a file, before its rows are removed.
fn file_footprint(conn: &Connection, path: &str) -> Result<(BTreeSet<String>, BTreeSet<String>), duckdb::Error> {
    let entities = query_strings(
        conn,
        "SELECT DISTINCT entity_id FROM entity_sources WHERE file_path = ?",
        path,
    )?;
    let relations = query_strings(
        conn,
        "SELECT DISTINCT relation_id FROM relation_sources WHERE file_path = ?",
        path,
    )?;
    Ok((entities.into_iter().collect(), relations.into_iter().collect()))
}

fn remove_file_rows(conn: &Connection, path: &str) -> Result<(), duckdb::Error> {
    conn.execute("DELETE FROM entity_sources WHERE file_path = ?", params![path])?;
    conn.execute("DELETE FROM relation_sources WHERE file_path = ?", params![path])?;
    conn.execute("DELETE FROM chunks WHERE file_path = ?", params![path])?;
    Ok(())
}

/// Drop entities and relations nobody contributes to anymore.
fn prune_orphans(conn: &Connection) -> Result<RetractSummary, duckdb::Error> {
    let mut relations_removed = conn.execute(
        "DELETE FROM relations WHERE id NOT IN (SELECT relation_id FROM relation_sources)",
        [],
    )?;
    let entities_removed = conn.execute(
        "DELETE FROM entities WHERE id NOT IN (SELECT entity_id FROM entity_sources)",
        [],
    )?;
    conn.execute(
        "DELETE FROM relation_sources WHERE relation_id IN (
             SELECT id FROM relations
             WHERE source_id NOT IN (SELECT id FROM entities)
                OR target_id NOT IN (SELECT id FROM entities))",
        [],
    )?;
    relations_removed += conn.execute(
        "DELETE FROM relations
         WHERE source_id NOT IN (SELECT id FROM entities)
            OR target_id NOT IN (SELECT id FROM entities)",
        [],
    )?;
    conn.execute(
        "DELETE FROM entity_aliases WHERE canonical_id NOT IN (SELECT id FROM entities)",
        [],
    )?;
    Ok(RetractSummary {
        entities_removed,
        relations_removed,
    })
}

/// Recompute merged descriptions from the remaining contributions.
fn refresh_descriptions(
    conn: &Connection,
    entities: &BTreeSet<String>,
    relations: &BTreeSet<String>,
) -> Result<(), duckdb::Error> {
    for id in entities {
        let parts = query_strings(
            conn,
            "SELECT description FROM entity_sources WHERE entity_id = ? ORDER BY file_path, description",
            id,
        )?;
        if parts.is_empty() {
            continue;
        }
        let description = join_descriptions(parts.iter().map(String::as_str));
        conn.execute(
            "UPDATE entities SET description = ? WHERE id = ?",
            params![description, id],
        )?;
    }
    for id in relations {
        let parts = query_strings(
            conn,
            "SELECT description FROM relation_sources WHERE relation_id = ? ORDER BY file_path, description",
            id,
        )?;
        if parts.is_empty() {
            continue;
        }
        let description = join_descriptions(parts.iter().map(String::as_str));
        conn.execute(
            "UPDATE relations SET description = ? WHERE id = ?",
            params![description, id],
        )?;
    }
    Ok(())
}

impl GraphStore for GraphBase {
    fn apply_file(&self, mutation: &FileMutation) -> Result<CommitToken, StoreError> {
        let dangling = mutation.dangling_endpoints();
        if !dangling.is_empty() {
            return Err(StoreError::InvalidMutation {
                path: mutation.path.clone(),
                message: format!("relation endpoints without entities: {}", dangling.join(", ")),
            });
        }

        let path = mutation.path.as_str();
        let kind = mutation.kind.as_str();
        let mut conn = self.acquire_conn();
        let tx = conn.transaction()?;

        let (mut touched_entities, mut touched_relations) = file_footprint(&tx, path)?;
        remove_file_rows(&tx, path)?;

        let mut created = Vec::new();
        for entity in &mutation.entities {
            let id = resolve_alias(&tx, &entity_id(&entity.name))?;
            if !entity_exists(&tx, &id)? {
                tx.execute(
                    "INSERT INTO entities (id, name, entity_type, description, embedding)
                     VALUES (?, ?, ?, ?, NULL)",
                    params![id, entity.name, entity.entity_type, entity.description],
                )?;
                created.push(id.clone());
            }
            tx.execute(
                "INSERT INTO entity_sources (entity_id, file_path, kind, entity_type, description)
                 VALUES (?, ?, ?, ?, ?)",
                params![id, path, kind, entity.entity_type, entity.description],
            )?;
            if let Some(embedding) = encode_embedding(entity.embedding.as_ref())? {
                // Vectors of shared entities are only replaced when missing
                tx.execute(
                    "UPDATE entities SET embedding = ?
                     WHERE id = ?
                       AND (embedding IS NULL
                            OR NOT EXISTS (SELECT 1 FROM entity_sources
                                           WHERE entity_id = ? AND file_path <> ?))",
                    params![embedding, id, id, path],
                )?;
            }
            touched_entities.insert(id);
        }

        let mut relation_count = 0;
        for relation in &mutation.relations {
            let source = resolve_alias(&tx, &entity_id(&relation.source))?;
            let target = resolve_alias(&tx, &entity_id(&relation.target))?;
            if source == target {
                continue;
            }
            let id = relation_id(&source, &target);
            if !relation_exists(&tx, &id)? {
                tx.execute(
                    "INSERT INTO relations (id, source_id, target_id, description) VALUES (?, ?, ?, ?)",
                    params![id, source, target, relation.description],
                )?;
            }
            tx.execute(
                "INSERT INTO relation_sources (relation_id, file_path, description) VALUES (?, ?, ?)",
                params![id, path, relation.description],
            )?;
            touched_relations.insert(id);
            relation_count += 1;
        }

        for chunk in &mutation.chunks {
            tx.execute(
                "INSERT INTO chunks (id, file_path, content, start_line, end_line, embedding)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    chunk.id,
                    path,
                    chunk.content,
                    chunk.start_line,
                    chunk.end_line,
                    encode_embedding(chunk.embedding.as_ref())?,
                ],
            )?;
        }

        let pruned = prune_orphans(&tx)?;
        refresh_descriptions(&tx, &touched_entities, &touched_relations)?;
        tx.commit()?;

        let token = CommitToken {
            sequence: self.next_sequence(),
            path: mutation.path.clone(),
            created,
            entity_count: mutation.entities.len(),
            relation_count,
        };
        debug!(
            path = %token.path,
            sequence = token.sequence,
            created = token.created.len(),
            pruned_entities = pruned.entities_removed,
            "Applied file mutation"
        );
        Ok(token)
    }

    fn retract_file(&self, path: &str) -> Result<RetractSummary, StoreError> {
        let mut conn = self.acquire_conn();
        let tx = conn.transaction()?;

        let (entities, relations) = file_footprint(&tx, path)?;
        remove_file_rows(&tx, path)?;
        let summary = prune_orphans(&tx)?;
        refresh_descriptions(&tx, &entities, &relations)?;
        tx.commit()?;

        debug!(
            path,
            entities_removed = summary.entities_removed,
            relations_removed = summary.relations_removed,
            "Retracted file"
        );
        Ok(summary)
    }

    fn entities(&self) -> Result<Vec<EntityRecord>, StoreError> {
        let conn = self.acquire_conn();

        let mut provenance: BTreeMap<String, BTreeMap<String, SourceKind>> = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT entity_id, file_path, kind FROM entity_sources")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let entity: String = row.get(0)?;
                let path: String = row.get(1)?;
                let kind: String = row.get(2)?;
                provenance
                    .entry(entity)
                    .or_default()
                    .insert(path, SourceKind::parse(&kind).unwrap_or(SourceKind::Code));
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, entity_type, description, embedding FROM entities ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            entities.push(EntityRecord {
                provenance: provenance.remove(&id).unwrap_or_default(),
                id,
                name: row.get(1)?,
                entity_type: row.get(2)?,
                description: row.get(3)?,
                embedding: decode_embedding(row.get(4)?),
            });
        }
        Ok(entities)
    }

    fn entity(&self, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let conn = self.acquire_conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, entity_type, description, embedding FROM entities WHERE id = ?",
        )?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let mut record = EntityRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            entity_type: row.get(2)?,
            description: row.get(3)?,
            provenance: BTreeMap::new(),
            embedding: decode_embedding(row.get(4)?),
        };

        let mut stmt = conn.prepare("SELECT file_path, kind FROM entity_sources WHERE entity_id = ?")?;
        let mut rows = stmt.query(params![id])?;
        while let Some(row) = rows.next()? {
            let path: String = row.get(0)?;
            let kind: String = row.get(1)?;
            record
                .provenance
                .insert(path, SourceKind::parse(&kind).unwrap_or(SourceKind::Code));
        }
        Ok(Some(record))
    }

    fn canonical_id(&self, id: &str) -> Result<String, StoreError> {
        let conn = self.acquire_conn();
        Ok(resolve_alias(&conn, id)?)
    }

    fn relations(&self) -> Result<Vec<RelationRecord>, StoreError> {
        let conn = self.acquire_conn();

        let mut provenance: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT relation_id, file_path FROM relation_sources")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let relation: String = row.get(0)?;
                let path: String = row.get(1)?;
                provenance.entry(relation).or_default().insert(path);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, description FROM relations ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        let mut relations = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            relations.push(RelationRecord {
                provenance: provenance.remove(&id).unwrap_or_default(),
                id,
                source_id: row.get(1)?,
                target_id: row.get(2)?,
                description: row.get(3)?,
            });
        }
        Ok(relations)
    }

    fn chunks_for(&self, path: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        let conn = self.acquire_conn();
        let mut stmt = conn.prepare(
            "SELECT id, file_path, content, start_line, end_line, embedding
             FROM chunks WHERE file_path = ? ORDER BY start_line",
        )?;
        let mut rows = stmt.query(params![path])?;
        let mut chunks = Vec::new();
        while let Some(row) = rows.next()? {
            chunks.push(ChunkRecord {
                id: row.get(0)?,
                file_path: row.get(1)?,
                content: row.get(2)?,
                start_line: row.get(3)?,
                end_line: row.get(4)?,
                embedding: decode_embedding(row.get(5)?),
            });
        }
        Ok(chunks)
    }

    fn set_entity_embedding(&self, id: &str, embedding: &[f32]) -> Result<(), StoreError> {
        let conn = self.acquire_conn();
        let json = serde_json::to_string(embedding)?;
        let updated = conn.execute(
            "UPDATE entities SET embedding = ? WHERE id = ?",
            params![json, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn merge_entities(&self, survivor: &str, superseded: &str) -> Result<MergeOutcome, StoreError> {
        if survivor == superseded {
            return Err(StoreError::InvalidMutation {
                path: survivor.to_string(),
                message: "cannot merge an entity into itself".to_string(),
            });
        }

        let mut conn = self.acquire_conn();
        let tx = conn.transaction()?;
        for id in [survivor, superseded] {
            if !entity_exists(&tx, id)? {
                return Err(StoreError::NotFound(id.to_string()));
            }
        }

        // Copy then delete, so indexed id columns are never updated in place
        tx.execute(
            "INSERT INTO entity_sources
             SELECT CAST(? AS VARCHAR), file_path, kind, entity_type, description FROM entity_sources WHERE entity_id = ?",
            params![survivor, superseded],
        )?;
        tx.execute(
            "DELETE FROM entity_sources WHERE entity_id = ?",
            params![superseded],
        )?;

        let touching: Vec<(String, String, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, source_id, target_id, description FROM relations
                 WHERE source_id = ? OR target_id = ? ORDER BY id",
            )?;
            let rows = stmt.query_map(params![superseded, superseded], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut outcome = MergeOutcome::default();
        let mut touched_relations = BTreeSet::new();
        for (old_id, source, target, description) in touching {
            let source = if source == superseded { survivor.to_string() } else { source };
            let target = if target == superseded { survivor.to_string() } else { target };

            if source == target {
                tx.execute("DELETE FROM relation_sources WHERE relation_id = ?", params![old_id])?;
                tx.execute("DELETE FROM relations WHERE id = ?", params![old_id])?;
                outcome.self_loops_dropped += 1;
                continue;
            }

            let new_id = relation_id(&source, &target);
            if relation_exists(&tx, &new_id)? {
                outcome.relations_unified += 1;
            } else {
                tx.execute(
                    "INSERT INTO relations (id, source_id, target_id, description) VALUES (?, ?, ?, ?)",
                    params![new_id, source, target, description],
                )?;
            }
            tx.execute(
                "INSERT INTO relation_sources
                 SELECT CAST(? AS VARCHAR), file_path, description FROM relation_sources WHERE relation_id = ?",
                params![new_id, old_id],
            )?;
            tx.execute("DELETE FROM relation_sources WHERE relation_id = ?", params![old_id])?;
            tx.execute("DELETE FROM relations WHERE id = ?", params![old_id])?;
            outcome.relations_redirected += 1;
            touched_relations.insert(new_id);
        }

        tx.execute("DELETE FROM entities WHERE id = ?", params![superseded])?;
        tx.execute(
            "UPDATE entity_aliases SET canonical_id = ? WHERE canonical_id = ?",
            params![survivor, superseded],
        )?;
        tx.execute(
            "INSERT INTO entity_aliases (alias_id, canonical_id) VALUES (?, ?)",
            params![superseded, survivor],
        )?;

        let touched_entities = BTreeSet::from([survivor.to_string()]);
        refresh_descriptions(&tx, &touched_entities, &touched_relations)?;
        tx.commit()?;

        debug!(
            survivor,
            superseded,
            redirected = outcome.relations_redirected,
            self_loops = outcome.self_loops_dropped,
            "Merged entities"
        );
        Ok(outcome)
    }

    fn stats(&self) -> Result<GraphStats, StoreError> {
        let conn = self.acquire_conn();
        let count = |sql: &str| -> Result<usize, duckdb::Error> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as usize)
        };

        Ok(GraphStats {
            entity_count: count("SELECT COUNT(*) FROM entities")?,
            relation_count: count("SELECT COUNT(*) FROM relations")?,
            chunk_count: count("SELECT COUNT(*) FROM chunks")?,
            file_count: count(
                "SELECT COUNT(*) FROM (SELECT file_path FROM entity_sources
                                       UNION SELECT file_path FROM chunks)",
            )?,
            embedded_entities: count("SELECT COUNT(*) FROM entities WHERE embedding IS NOT NULL")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::EntityContribution;
    use crate::storage::relations::RelationContribution;
    use repograph_core::Chunk;

    fn code_file(path: &str, names: &[&str]) -> FileMutation {
        let mut m = FileMutation::new(path, "xxh3:1", SourceKind::Code);
        for name in names {
            let mut e = EntityContribution::new(*name, "class", format!("{} from {}", name, path));
            e.embedding = Some(vec![1.0, 0.0]);
            m.entities.push(e);
        }
        for pair in names.windows(2) {
            m.relations
                .push(RelationContribution::new(pair[0], pair[1], "uses"));
        }
        m.chunks.push(ChunkRecord::from_chunk(
            path,
            Chunk::new(path, "content".into(), 1, 1),
            Some(vec![0.5, 0.5]),
        ));
        m
    }

    fn doc_file(path: &str, names: &[&str]) -> FileMutation {
        let mut m = code_file(path, names);
        m.kind = SourceKind::Document;
        m
    }

    #[test]
    fn test_open_and_init() {
        let db = GraphBase::open_in_memory().unwrap();
        assert_eq!(db.stats().unwrap(), GraphStats::default());
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = GraphBase::open_in_dir(dir.path()).unwrap();
        db.apply_file(&code_file("a.rs", &["Alpha"])).unwrap();
        drop(db);

        let reopened = GraphBase::open_in_dir(dir.path()).unwrap();
        assert_eq!(reopened.stats().unwrap().entity_count, 1);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let db = GraphBase::open_in_memory().unwrap();
        let mutation = code_file("a.rs", &["Alpha", "Beta"]);

        let first = db.apply_file(&mutation).unwrap();
        let entities = db.entities().unwrap();
        let relations = db.relations().unwrap();

        let second = db.apply_file(&mutation).unwrap();
        assert_eq!(first.created, vec!["ent:Alpha", "ent:Beta"]);
        assert!(second.created.is_empty());
        assert!(second.sequence > first.sequence);
        assert_eq!(db.entities().unwrap(), entities);
        assert_eq!(db.relations().unwrap(), relations);
        assert_eq!(db.chunks_for("a.rs").unwrap().len(), 1);
    }

    #[test]
    fn test_apply_replaces_previous_contribution() {
        let db = GraphBase::open_in_memory().unwrap();
        db.apply_file(&code_file("a.rs", &["Alpha", "Beta"])).unwrap();
        db.apply_file(&code_file("a.rs", &["Alpha"])).unwrap();

        let ids: Vec<_> = db.entities().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ent:Alpha"]);
        assert!(db.relations().unwrap().is_empty());
    }

    #[test]
    fn test_shared_entity_provenance_and_description() {
        let db = GraphBase::open_in_memory().unwrap();
        db.apply_file(&code_file("b.rs", &["Alpha"])).unwrap();
        db.apply_file(&code_file("a.rs", &["Alpha"])).unwrap();

        let alpha = db.entity("ent:Alpha").unwrap().unwrap();
        assert_eq!(alpha.paths().collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
        assert_eq!(alpha.description, "Alpha from a.rs\nAlpha from b.rs");

        let summary = db.retract_file("b.rs").unwrap();
        assert_eq!(summary.entities_removed, 0);
        let alpha = db.entity("ent:Alpha").unwrap().unwrap();
        assert_eq!(alpha.description, "Alpha from a.rs");
    }

    #[test]
    fn test_retract_removes_sole_provenance() {
        let db = GraphBase::open_in_memory().unwrap();
        db.apply_file(&code_file("a.rs", &["Alpha", "Beta"])).unwrap();
        db.apply_file(&code_file("b.rs", &["Beta"])).unwrap();

        let summary = db.retract_file("a.rs").unwrap();
        assert_eq!(summary.entities_removed, 1);
        assert_eq!(summary.relations_removed, 1);

        let ids: Vec<_> = db.entities().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ent:Beta"]);
        assert!(db.chunks_for("a.rs").unwrap().is_empty());
    }

    #[test]
    fn test_dangling_relation_rejected() {
        let db = GraphBase::open_in_memory().unwrap();
        let mut m = code_file("a.rs", &["Alpha"]);
        m.relations.push(RelationContribution::new("Alpha", "Ghost", "uses"));

        let err = db.apply_file(&m).unwrap_err();
        assert!(matches!(err, StoreError::InvalidMutation { .. }));
        assert_eq!(db.stats().unwrap().entity_count, 0);
    }

    #[test]
    fn test_merge_redirects_relations_and_aliases() {
        let db = GraphBase::open_in_memory().unwrap();
        db.apply_file(&doc_file("docs/a.md", &["UserService", "Session"])).unwrap();
        db.apply_file(&code_file("src/user.rs", &["Repo", "userservice"])).unwrap();

        let outcome = db.merge_entities("ent:UserService", "ent:userservice").unwrap();
        assert_eq!(outcome.relations_redirected, 1);

        assert!(db.entity("ent:userservice").unwrap().is_none());
        let survivor = db.entity("ent:UserService").unwrap().unwrap();
        assert_eq!(
            survivor.paths().collect::<Vec<_>>(),
            vec!["docs/a.md", "src/user.rs"]
        );
        assert_eq!(db.canonical_id("ent:userservice").unwrap(), "ent:UserService");

        let relation_ids: Vec<_> = db.relations().unwrap().into_iter().map(|r| r.id).collect();
        assert!(relation_ids.contains(&"rel:ent:Repo->ent:UserService".to_string()));
        assert!(!relation_ids.iter().any(|id| id.contains("ent:userservice")));

        // Re-extracting the code file resolves through the alias
        let created = db
            .apply_file(&code_file("src/user.rs", &["Repo", "userservice"]))
            .unwrap()
            .created;
        assert!(created.is_empty());
        assert!(db.entity("ent:userservice").unwrap().is_none());
    }

    #[test]
    fn test_merge_drops_self_loops() {
        let db = GraphBase::open_in_memory().unwrap();
        db.apply_file(&code_file("a.rs", &["Left", "Right"])).unwrap();

        let outcome = db.merge_entities("ent:Left", "ent:Right").unwrap();
        assert_eq!(outcome.self_loops_dropped, 1);
        assert!(db.relations().unwrap().is_empty());
    }

    #[test]
    fn test_merge_rejects_unknown_and_identical() {
        let db = GraphBase::open_in_memory().unwrap();
        db.apply_file(&code_file("a.rs", &["Alpha"])).unwrap();
        assert!(matches!(
            db.merge_entities("ent:Alpha", "ent:Missing"),
            Err(StoreError::NotFound(_))
        ));
        assert!(db.merge_entities("ent:Alpha", "ent:Alpha").is_err());
    }

    #[test]
    fn test_set_entity_embedding() {
        let db = GraphBase::open_in_memory().unwrap();
        db.apply_file(&code_file("a.rs", &["Alpha"])).unwrap();
        db.set_entity_embedding("ent:Alpha", &[0.25, 0.75]).unwrap();
        assert_eq!(
            db.entity("ent:Alpha").unwrap().unwrap().embedding,
            Some(vec![0.25, 0.75])
        );
        assert!(db.set_entity_embedding("ent:Nope", &[1.0]).is_err());
        assert_eq!(db.stats().unwrap().embedded_entities, 1);
    }
}
