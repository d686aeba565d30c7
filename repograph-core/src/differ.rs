//! Manifest differ: classify the current file set against the last
//! ingested state.
//!
//! A file whose content hash matches its manifest entry is unchanged and is
//! never re-extracted, whatever its modification time says. Paths are
//! compared byte for byte.

use std::collections::HashSet;

use crate::types::{ChangeSet, FileRecord, Manifest};

/// Compute the change set for `current` relative to `manifest`.
///
/// `added` and `modified` keep the order of `current`; `deleted` and
/// `unchanged` are sorted. A path listed twice in `current` keeps its first
/// occurrence.
pub fn diff(current: &[FileRecord], manifest: &Manifest) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(current.len());

    for file in current {
        if !seen.insert(file.path.as_str()) {
            continue;
        }

        match manifest.hash_of(&file.path) {
            None => changes.added.push(file.clone()),
            Some(hash) if hash != file.hash => changes.modified.push(file.clone()),
            Some(_) => changes.unchanged.push(file.path.clone()),
        }
    }

    // BTreeMap keys are already sorted
    changes.deleted = manifest
        .entries
        .keys()
        .filter(|path| !seen.contains(path.as_str()))
        .cloned()
        .collect();
    changes.unchanged.sort();

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, hash: &str) -> FileRecord {
        FileRecord::new(path, hash, "rust")
    }

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::default();
        for (path, hash) in entries {
            m.insert(*path, *hash, 0);
        }
        m
    }

    #[test]
    fn test_empty_manifest_marks_everything_added() {
        let current = vec![record("b.rs", "xxh3:1"), record("a.rs", "xxh3:2")];
        let changes = diff(&current, &Manifest::default());

        let added: Vec<_> = changes.added.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(added, vec!["b.rs", "a.rs"]);
        assert!(changes.modified.is_empty());
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn test_no_content_change_extracts_nothing() {
        let current = vec![record("a.rs", "xxh3:1"), record("b.rs", "xxh3:2")];
        let mut with_mtime = current.clone();
        with_mtime[0].modified_ms = Some(999);

        let m = manifest(&[("a.rs", "xxh3:1"), ("b.rs", "xxh3:2")]);
        let changes = diff(&with_mtime, &m);

        assert!(changes.is_empty());
        assert_eq!(changes.unchanged, vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_mixed_changes() {
        let current = vec![
            record("new1.rs", "xxh3:a"),
            record("new2.rs", "xxh3:b"),
            record("same.rs", "xxh3:c"),
            record("edited.rs", "xxh3:d2"),
        ];
        let m = manifest(&[
            ("same.rs", "xxh3:c"),
            ("edited.rs", "xxh3:d1"),
            ("gone.rs", "xxh3:e"),
        ]);

        let changes = diff(&current, &m);
        assert_eq!(changes.added.len(), 2);
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.modified[0].path, "edited.rs");
        assert_eq!(changes.deleted, vec!["gone.rs"]);
        assert_eq!(changes.unchanged, vec!["same.rs"]);
    }

    #[test]
    fn test_paths_are_not_normalized() {
        let current = vec![record("Src/Lib.rs", "xxh3:1"), record("src\\lib.rs", "xxh3:1")];
        let m = manifest(&[("src/lib.rs", "xxh3:1")]);

        let changes = diff(&current, &m);
        assert_eq!(changes.added.len(), 2);
        assert_eq!(changes.deleted, vec!["src/lib.rs"]);
    }

    #[test]
    fn test_duplicate_paths_keep_first() {
        let current = vec![record("a.rs", "xxh3:1"), record("a.rs", "xxh3:2")];
        let changes = diff(&current, &Manifest::default());
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].hash, "xxh3:1");
    }
}
