//! Manifest persistence: which files have been ingested, at which hash.
//!
//! The manifest lives in the storage directory as a snapshot plus a journal.
//! `manifest.json` holds the state as of the last finalize:
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": {
//!     "src/main.rs": { "hash": "xxh3:0123456789abcdef", "updated_ms": 1760000000000 }
//!   }
//! }
//! ```
//!
//! `manifest.journal` holds one JSON line per `record`/`remove` since then:
//!
//! ```text
//! {"op":"record","path":"src/main.rs","hash":"xxh3:0123456789abcdef","updated_ms":1760000000000}
//! {"op":"remove","path":"src/old.rs"}
//! ```
//!
//! Opening replays the journal over the snapshot. `finalize` writes a new
//! snapshot through a temporary file and a rename, then drops the journal.
//! A torn journal line only loses that entry, and a lost entry means the
//! file is extracted again.

use repograph_core::types::MANIFEST_VERSION;
use repograph_core::Manifest;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// File name of the manifest snapshot inside the storage directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// File name of the manifest journal inside the storage directory.
pub const JOURNAL_FILENAME: &str = "manifest.journal";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to access manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest finalize timed out after {0:?}")]
    FinalizeTimeout(std::time::Duration),
}

/// Persistence of the path → hash mapping.
pub trait ManifestStore: Send + Sync {
    /// Snapshot of the current manifest.
    fn load(&self) -> Result<Manifest, ManifestError>;

    /// Mark `path` as ingested at `hash`. Called only after the file's
    /// graph mutation committed.
    fn record(&self, path: &str, hash: &str) -> Result<(), ManifestError>;

    /// Forget `path` after its contributions were retracted.
    fn remove(&self, path: &str) -> Result<(), ManifestError>;

    /// Flush everything to durable storage at the end of a build.
    fn finalize(&self) -> Result<(), ManifestError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalEntry {
    Record {
        path: String,
        hash: String,
        updated_ms: u64,
    },
    Remove {
        path: String,
    },
}

impl JournalEntry {
    fn apply(self, manifest: &mut Manifest) {
        match self {
            JournalEntry::Record {
                path,
                hash,
                updated_ms,
            } => manifest.insert(path, hash, updated_ms),
            JournalEntry::Remove { path } => {
                manifest.remove(&path);
            }
        }
    }
}

struct State {
    manifest: Manifest,
    /// Open append handle, created on first write
    journal: Option<File>,
}

/// JSON snapshot plus append-only journal implementation of [`ManifestStore`].
pub struct JsonManifest {
    path: PathBuf,
    journal_path: PathBuf,
    state: Mutex<State>,
}

impl JsonManifest {
    /// Open the manifest inside `storage_dir`, creating an empty one if
    /// nothing exists yet.
    pub fn open_in_dir(storage_dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        Self::open(storage_dir.as_ref().join(MANIFEST_FILENAME))
    }

    /// Open the snapshot at `path`; the journal sits next to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let path = path.into();
        let journal_path = path.with_file_name(JOURNAL_FILENAME);

        let mut manifest = match read_snapshot(&path)? {
            Some(manifest) if manifest.version != MANIFEST_VERSION => {
                tracing::info!(
                    "Manifest version mismatch (found {}, expected {}), starting fresh",
                    manifest.version,
                    MANIFEST_VERSION
                );
                if journal_path.exists() {
                    fs::remove_file(&journal_path).map_err(|source| io_error(&journal_path, source))?;
                }
                Manifest::default()
            }
            Some(manifest) => manifest,
            None => {
                tracing::debug!("No manifest snapshot at {:?}", path);
                Manifest::default()
            }
        };

        let replayed = replay_journal(&journal_path, &mut manifest)?;
        tracing::debug!(
            entries = manifest.len(),
            replayed,
            "Loaded manifest"
        );

        Ok(Self {
            path,
            journal_path,
            state: Mutex::new(State {
                manifest,
                journal: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering from poisoned manifest mutex");
                poisoned.into_inner()
            }
        }
    }

    /// Append `entry` to the journal, then apply it in memory.
    fn append(&self, state: &mut State, entry: JournalEntry) -> Result<(), ManifestError> {
        let mut line = serde_json::to_vec(&entry).map_err(|source| ManifestError::Corrupt {
            path: self.journal_path.display().to_string(),
            source,
        })?;
        line.push(b'\n');

        if state.journal.is_none() {
            if let Some(parent) = self.journal_path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_error(&self.journal_path, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.journal_path)
                .map_err(|e| io_error(&self.journal_path, e))?;
            state.journal = Some(file);
        }
        if let Some(file) = state.journal.as_mut() {
            file.write_all(&line).map_err(|e| io_error(&self.journal_path, e))?;
        }

        entry.apply(&mut state.manifest);
        Ok(())
    }

    fn write_snapshot(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
        }
        let content = serde_json::to_vec_pretty(manifest).map_err(|source| ManifestError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
            file.write_all(&content).map_err(|e| io_error(&tmp, e))?;
            file.sync_all().map_err(|e| io_error(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))?;
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ManifestError {
    ManifestError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn read_snapshot(path: &Path) -> Result<Option<Manifest>, ManifestError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let manifest = serde_json::from_str(&content).map_err(|source| ManifestError::Corrupt {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Some(manifest))
}

/// Apply journal lines in order. Returns the number of entries applied.
fn replay_journal(path: &Path, manifest: &mut Manifest) -> Result<usize, ManifestError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(path, e)),
    };

    let mut applied = 0;
    let mut torn = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| io_error(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => {
                entry.apply(manifest);
                applied += 1;
            }
            Err(_) => torn += 1,
        }
    }
    if torn > 0 {
        tracing::warn!(torn, "Ignored unreadable manifest journal lines");
    }
    Ok(applied)
}

impl ManifestStore for JsonManifest {
    fn load(&self) -> Result<Manifest, ManifestError> {
        Ok(self.lock().manifest.clone())
    }

    fn record(&self, path: &str, hash: &str) -> Result<(), ManifestError> {
        let mut state = self.lock();
        self.append(
            &mut state,
            JournalEntry::Record {
                path: path.to_string(),
                hash: hash.to_string(),
                updated_ms: now_ms(),
            },
        )
    }

    fn remove(&self, path: &str) -> Result<(), ManifestError> {
        let mut state = self.lock();
        if !state.manifest.entries.contains_key(path) {
            return Ok(());
        }
        self.append(
            &mut state,
            JournalEntry::Remove {
                path: path.to_string(),
            },
        )
    }

    fn finalize(&self) -> Result<(), ManifestError> {
        let mut state = self.lock();
        self.write_snapshot(&state.manifest)?;

        // The snapshot now covers every journal entry.
        state.journal = None;
        match fs::remove_file(&self.journal_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&self.journal_path, e)),
        }
        tracing::debug!("Finalized manifest with {} entries", state.manifest.len());
        Ok(())
    }
}
