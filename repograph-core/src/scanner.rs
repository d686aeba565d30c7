//! Parallel file discovery using the `ignore` crate.
//!
//! Walks one or more source roots with gitignore support, detects the
//! language of each file, and hashes content with xxHash3 so the differ can
//! compare against the manifest.
//!
//! # Features
//!
//! - Native `.gitignore` support at all levels
//! - Custom `.repographignore` file support
//! - Extra ignore globs and a maximum traversal depth
//! - Parallel hashing with rayon
//!
//! Nonexistent roots are skipped with a warning; unreadable files are
//! counted, never fatal.

use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::types::{content_hash, FileRecord, SourceKind};

/// Name of the per-directory ignore file, in addition to `.gitignore`.
pub const IGNORE_FILENAME: &str = ".repographignore";

/// Language detection from file extension.
pub fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    match ext.to_lowercase().as_str() {
        "py" | "pyw" | "pyi" => Some("python"),
        "js" | "mjs" | "cjs" => Some("javascript"),
        "jsx" => Some("jsx"),
        "ts" => Some("typescript"),
        "tsx" => Some("tsx"),
        "cs" => Some("csharp"),
        "go" => Some("go"),
        "rs" => Some("rust"),
        "java" => Some("java"),
        "kt" | "kts" => Some("kotlin"),
        "rb" => Some("ruby"),
        "php" => Some("php"),
        "swift" => Some("swift"),
        "c" | "h" => Some("c"),
        "cpp" | "hpp" | "cc" => Some("cpp"),
        "sql" => Some("sql"),
        "sh" | "bash" | "zsh" => Some("shell"),
        "md" | "markdown" => Some("markdown"),
        "txt" => Some("text"),
        "rst" => Some("rst"),
        "adoc" => Some("asciidoc"),
        _ => None,
    }
}

/// Options controlling a discovery pass.
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Maximum directory depth below each root (`None` = unlimited).
    pub max_depth: Option<usize>,

    /// Extra gitignore-style globs to exclude.
    pub ignore_patterns: Vec<String>,

    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,

    /// Files larger than this are skipped.
    pub max_file_size: Option<u64>,
}

/// Result of scanning the source roots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanResult {
    /// Discovered files, sorted by path.
    pub files: Vec<FileRecord>,

    /// Roots that did not exist and were skipped.
    pub missing_roots: Vec<String>,

    /// Files skipped for unsupported language or size.
    pub skipped_count: usize,

    /// Files that could not be read.
    pub error_count: usize,

    /// Time taken for the scan in milliseconds.
    pub duration_ms: f64,
}

impl ScanResult {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Discover and hash every supported file under `roots`.
pub fn discover(roots: &[PathBuf], options: &ScanOptions) -> ScanResult {
    let start = Instant::now();
    let mut missing_roots = Vec::new();
    let mut candidates: Vec<PathBuf> = Vec::new();
    let mut seen = HashSet::new();

    for root in roots {
        if !root.exists() {
            warn!(root = %root.display(), "Source root does not exist, skipping");
            missing_roots.push(root.to_string_lossy().to_string());
            continue;
        }

        for path in walk_root(root, options) {
            if seen.insert(path.clone()) {
                candidates.push(path);
            }
        }
    }

    let skipped = AtomicUsize::new(0);
    let errors = AtomicUsize::new(0);

    let mut files: Vec<FileRecord> = candidates
        .par_iter()
        .filter_map(|path| {
            let Some(language) = detect_language(path) else {
                skipped.fetch_add(1, Ordering::Relaxed);
                return None;
            };

            let metadata = match fs::metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to stat file");
                    errors.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };

            if options.max_file_size.is_some_and(|max| metadata.len() > max) {
                skipped.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            let content = match fs::read(path) {
                Ok(c) => c,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to read file");
                    errors.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };

            let modified_ms = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64);

            Some(FileRecord {
                path: path.to_string_lossy().to_string(),
                hash: content_hash(&content),
                language: language.to_string(),
                kind: SourceKind::for_language(language),
                modified_ms,
            })
        })
        .collect();

    files.sort_by(|a, b| a.path.cmp(&b.path));

    ScanResult {
        files,
        missing_roots,
        skipped_count: skipped.load(Ordering::Relaxed),
        error_count: errors.load(Ordering::Relaxed),
        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

fn walk_root(root: &Path, options: &ScanOptions) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .require_git(false)
        .follow_links(options.follow_symlinks)
        .max_depth(options.max_depth)
        .add_custom_ignore_filename(IGNORE_FILENAME);

    if !options.ignore_patterns.is_empty() {
        let mut overrides = ignore::overrides::OverrideBuilder::new(root);
        for pattern in &options.ignore_patterns {
            // `!` turns an override into an exclusion
            if let Err(e) = overrides.add(&format!("!{}", pattern)) {
                warn!(pattern = %pattern, error = %e, "Invalid ignore pattern");
            }
        }
        match overrides.build() {
            Ok(o) => {
                builder.overrides(o);
            }
            Err(e) => warn!(error = %e, "Failed to build ignore overrides"),
        }
    }

    builder
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.into_path())
        .collect()
}
