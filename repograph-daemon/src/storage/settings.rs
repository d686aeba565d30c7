//! Per-storage settings: a name, a description and the source directories
//! the graph was built from, so later builds can omit `--source-dir`.
//!
//! ```json
//! {
//!   "name": "billing",
//!   "description": "Billing service and its docs",
//!   "source_dir": ["services/billing", "docs/billing"],
//!   "storage_dir": "graphs/billing"
//! }
//! ```
//!
//! `source_dir` may also be a single comma separated string.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// File name of the settings inside the storage directory.
pub const SETTINGS_FILENAME: &str = "settings.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to access settings {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("settings {path} are corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceDirs {
    List(Vec<String>),
    Joined(String),
}

fn source_dirs_from_either<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let dirs = match SourceDirs::deserialize(deserializer)? {
        SourceDirs::List(dirs) => dirs,
        SourceDirs::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(normalize_source_dirs(&dirs))
}

/// Trim entries, drop empty ones and turn `\` into `/`.
pub fn normalize_source_dirs(dirs: &[String]) -> Vec<String> {
    dirs.iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .map(|d| d.replace('\\', "/"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(
        rename = "source_dir",
        default,
        deserialize_with = "source_dirs_from_either"
    )]
    pub source_dirs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<String>,
}

impl StorageSettings {
    /// Fresh settings for `storage_dir`, named after its last component.
    pub fn new(storage_dir: &Path, source_dirs: &[String]) -> Self {
        let name = storage_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "unnamed".to_string());
        Self {
            name,
            description: String::new(),
            source_dirs: normalize_source_dirs(source_dirs),
            storage_dir: Some(storage_dir.to_string_lossy().replace('\\', "/")),
        }
    }

    /// Read the settings in `storage_dir`. `None` when there are none yet.
    pub fn load(storage_dir: &Path) -> Result<Option<Self>, SettingsError> {
        let path = storage_dir.join(SETTINGS_FILENAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let settings = serde_json::from_str(&content).map_err(|source| SettingsError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(settings))
    }

    /// Write the settings into `storage_dir` through a temporary file.
    pub fn save(&self, storage_dir: &Path) -> Result<(), SettingsError> {
        let path = storage_dir.join(SETTINGS_FILENAME);
        let io_error = |source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(storage_dir).map_err(io_error)?;
        let content = serde_json::to_vec_pretty(self).map_err(|source| SettingsError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io_error)?;
            file.write_all(&content).map_err(io_error)?;
        }
        fs::rename(&tmp, &path).map_err(io_error)?;
        tracing::debug!("Saved storage settings to {:?}", path);
        Ok(())
    }

    /// Replace the source directories, keeping name and description.
    pub fn with_source_dirs(mut self, dirs: &[String]) -> Self {
        self.source_dirs = normalize_source_dirs(dirs);
        self
    }

    /// Required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.description.trim().is_empty() {
            missing.push("description");
        }
        if self.source_dirs.is_empty() {
            missing.push("source_dir");
        }
        missing
    }
}
