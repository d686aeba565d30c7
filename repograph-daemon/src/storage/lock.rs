//! Exclusive lock on a storage directory.
//!
//! Builds and merge passes mutate the same store; across processes they are
//! serialized by `storage.lock`, created with `create_new` and removed when
//! the guard is dropped.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the lock inside the storage directory.
pub const LOCK_FILENAME: &str = "storage.lock";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub started_at: String,
    pub command: String,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("storage is locked by {}: {}", .path.display(), describe_holder(.meta))]
    Held {
        path: PathBuf,
        meta: Option<LockMeta>,
    },

    #[error("lock file io error: {0}")]
    Io(#[from] io::Error),
}

fn describe_holder(meta: &Option<LockMeta>) -> String {
    match meta {
        Some(m) => format!("pid {} running {} since {}", m.pid, m.command, m.started_at),
        None => "unknown holder".to_string(),
    }
}

/// Guard holding `storage.lock`.
#[derive(Debug)]
pub struct StorageLock {
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl StorageLock {
    /// Take the lock for `storage_dir`, creating the directory if needed.
    pub fn acquire(storage_dir: &Path, command: &str) -> Result<Self, LockError> {
        fs::create_dir_all(storage_dir)?;
        let path = storage_dir.join(LOCK_FILENAME);

        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let meta = fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok());
                return Err(LockError::Held { path, meta });
            }
            Err(e) => return Err(e.into()),
        };

        let meta = LockMeta {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            command: command.to_string(),
        };
        let body = serde_json::to_vec(&meta).map_err(io::Error::other)?;
        if let Err(e) = file.write_all(&body) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        tracing::debug!(path = %path.display(), "Acquired storage lock");
        Ok(Self {
            path,
            meta,
            released: false,
        })
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        if !self.released {
            fs::remove_file(&self.path)?;
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = StorageLock::acquire(dir.path(), "build").unwrap();
        assert!(lock.path().exists());
        assert_eq!(lock.meta().pid, std::process::id());

        lock.release().unwrap();
        assert!(!dir.path().join(LOCK_FILENAME).exists());
    }

    #[test]
    fn test_second_acquire_is_rejected() {
        let dir = TempDir::new().unwrap();
        let _held = StorageLock::acquire(dir.path(), "build").unwrap();

        match StorageLock::acquire(dir.path(), "merge") {
            Err(LockError::Held { meta, .. }) => {
                assert_eq!(meta.unwrap().command, "build");
            }
            other => panic!("expected Held, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = StorageLock::acquire(dir.path(), "merge").unwrap();
        }
        assert!(StorageLock::acquire(dir.path(), "merge").is_ok());
    }

    #[test]
    fn test_creates_storage_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        let lock = StorageLock::acquire(&nested, "build").unwrap();
        assert!(lock.path().starts_with(&nested));
    }
}
