//! Build configuration loaded from `repograph.toml` in the storage directory.
//!
//! Configuration is optional. A missing file means defaults; a file that
//! cannot be parsed is logged and replaced by defaults unless loaded with
//! [`BuildConfig::load_strict`].
//!
//! # Example Configuration
//!
//! ```toml
//! [build]
//! parallelism = 8
//! chunk_size = 1200
//! max_depth = 12
//!
//! [scanner]
//! ignore = ["vendor/", "dist/"]
//! max_file_size_kb = 512
//!
//! [rate_limit]
//! min_interval_ms = 200
//! backoff_ms = 10000
//! max_attempts = 5
//!
//! [merge]
//! enabled = true
//! threshold = 0.95
//! exclude_patterns = ["*Handler"]
//! embed_batch_size = 64
//!
//! [llm]
//! enabled = true
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//!
//! [embedding]
//! model = "text-embedding-3-small"
//! dimension = 1536
//! custom_dimension = false
//! ```

use repograph_core::{ExclusionRules, RuleError, ScanOptions};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Name of the configuration file inside the storage directory.
pub const CONFIG_FILENAME: &str = "repograph.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error(transparent)]
    Rules(#[from] RuleError),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub build: BuildSection,
    pub scanner: ScannerSection,
    pub rate_limit: RateLimitSection,
    pub cancellation: CancellationSection,
    pub merge: MergeSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
}

/// Pipeline sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Number of extraction workers. Defaults to the CPU count.
    pub parallelism: usize,

    /// Task queue capacity. Defaults to twice the parallelism.
    pub queue_capacity: Option<usize>,

    /// Soft chunk size in bytes.
    pub chunk_size: usize,

    /// Maximum traversal depth below each source root.
    pub max_depth: Option<usize>,

    /// Interval between progress reports.
    pub progress_interval_secs: u64,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get().max(1),
            queue_capacity: None,
            chunk_size: 1200,
            max_depth: None,
            progress_interval_secs: 20,
        }
    }
}

/// File discovery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerSection {
    /// Extra gitignore-style patterns, on top of the built-in defaults.
    pub ignore: Vec<String>,

    pub follow_symlinks: bool,

    /// Files larger than this are skipped.
    pub max_file_size_kb: Option<u64>,
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            follow_symlinks: false,
            max_file_size_kb: Some(1024),
        }
    }
}

/// Collaborator throttling and retry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Minimum interval between external calls, across all workers.
    pub min_interval_ms: u64,

    /// Sleep after a rate-limit response before retrying the same task.
    pub backoff_ms: u64,

    /// Attempts per task before a transient error becomes a skip.
    pub max_attempts: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            backoff_ms: 10_000,
            max_attempts: 5,
        }
    }
}

/// Shutdown bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CancellationSection {
    pub worker_stop_timeout_ms: u64,
    pub writer_drain_timeout_ms: u64,
    pub finalize_timeout_ms: u64,
}

impl Default for CancellationSection {
    fn default() -> Self {
        Self {
            worker_stop_timeout_ms: 2_000,
            writer_drain_timeout_ms: 10_000,
            finalize_timeout_ms: 5_000,
        }
    }
}

/// Entity merge pass.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeSection {
    pub enabled: bool,

    /// Pairs scoring at or above this are merged.
    pub threshold: f32,

    pub min_name_len: usize,
    pub max_name_len: usize,

    /// Wildcard patterns (`*`, `?`) excluded from merging.
    pub exclude_patterns: Vec<String>,

    /// Generic terms added to the built-in list.
    pub generic_terms: Vec<String>,

    /// Texts per request when embedding candidates that have no vector.
    pub embed_batch_size: usize,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.95,
            min_name_len: 3,
            max_name_len: 64,
            exclude_patterns: Vec::new(),
            generic_terms: Vec::new(),
            embed_batch_size: 64,
        }
    }
}

/// OpenAI-compatible chat endpoint used for chunk extraction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// When false, only parser-detected entities are stored.
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
        }
    }
}

/// OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    /// Send `dimension` with each request, for models that can shorten vectors
    pub custom_dimension: bool,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            custom_dimension: false,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Patterns always excluded from discovery.
const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git/",
    "node_modules/",
    "__pycache__/",
    "*.pyc",
    ".venv/",
    "venv/",
    "target/",
    "dist/",
];

impl BuildConfig {
    /// Load `repograph.toml` from `storage_dir`, falling back to defaults
    /// when the file is missing or unreadable.
    pub fn load(storage_dir: &Path) -> Self {
        match Self::load_strict(storage_dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Load `repograph.toml`, returning an error for unreadable or invalid
    /// files. A missing file yields defaults.
    pub fn load_strict(storage_dir: &Path) -> Result<Self, ConfigError> {
        let path = storage_dir.join(CONFIG_FILENAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: CONFIG_FILENAME.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.parallelism == 0 {
            return Err(ConfigError::Invalid {
                field: "build.parallelism",
                message: "must be at least 1".to_string(),
            });
        }
        if self.build.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid {
                field: "build.queue_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        if self.build.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "build.chunk_size",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.merge.threshold) {
            return Err(ConfigError::Invalid {
                field: "merge.threshold",
                message: format!("{} is outside [0, 1]", self.merge.threshold),
            });
        }
        if self.merge.embed_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "merge.embed_batch_size",
                message: "must be at least 1".to_string(),
            });
        }
        if self.rate_limit.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        self.exclusion_rules()?;
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.build
            .queue_capacity
            .unwrap_or(self.build.parallelism * 2)
            .max(1)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.build.progress_interval_secs.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit.min_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit.backoff_ms)
    }

    pub fn worker_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.cancellation.worker_stop_timeout_ms)
    }

    pub fn writer_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.cancellation.writer_drain_timeout_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.cancellation.finalize_timeout_ms)
    }

    /// Scanner options, with default ignore patterns appended.
    pub fn scan_options(&self) -> ScanOptions {
        let mut ignore = self.scanner.ignore.clone();
        for default in DEFAULT_IGNORE_PATTERNS {
            if !ignore.iter().any(|p| p == default) {
                ignore.push(default.to_string());
            }
        }
        ScanOptions {
            max_depth: self.build.max_depth,
            ignore_patterns: ignore,
            follow_symlinks: self.scanner.follow_symlinks,
            max_file_size: self.scanner.max_file_size_kb.map(|kb| kb * 1024),
        }
    }

    /// Compile the merge exclusion rules.
    pub fn exclusion_rules(&self) -> Result<ExclusionRules, RuleError> {
        ExclusionRules::default()
            .with_length_bounds(self.merge.min_name_len, self.merge.max_name_len)?
            .with_generic_terms(&self.merge.generic_terms)
            .with_patterns(&self.merge.exclude_patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert!(config.build.parallelism >= 1);
        assert_eq!(config.queue_capacity(), config.build.parallelism * 2);
        assert_eq!(config.build.chunk_size, 1200);
        assert_eq!(config.progress_interval(), Duration::from_secs(20));
        assert_eq!(config.worker_stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.merge.threshold, 0.95);
        assert!(config.merge.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let config = BuildConfig::from_toml_str(
            r#"
[build]
parallelism = 3
max_depth = 4

[merge]
threshold = 0.9
exclude_patterns = ["*Handler"]

[embedding]
dimension = 512
custom_dimension = true
"#,
        )
        .unwrap();

        assert_eq!(config.build.parallelism, 3);
        assert_eq!(config.queue_capacity(), 6);
        assert_eq!(config.build.max_depth, Some(4));
        assert_eq!(config.merge.threshold, 0.9);
        assert_eq!(config.rate_limit.max_attempts, 5);
        assert!(config.exclusion_rules().unwrap().is_excluded("RequestHandler"));
        assert_eq!(config.scan_options().max_depth, Some(4));
        assert_eq!(config.embedding.dimension, 512);
        assert!(config.embedding.custom_dimension);
        assert!(!BuildConfig::default().embedding.custom_dimension);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            BuildConfig::from_toml_str("[build]\nparallelism = 0\n"),
            Err(ConfigError::Invalid {
                field: "build.parallelism",
                ..
            })
        ));
        assert!(matches!(
            BuildConfig::from_toml_str("[merge]\nthreshold = 1.5\n"),
            Err(ConfigError::Invalid {
                field: "merge.threshold",
                ..
            })
        ));
        assert!(matches!(
            BuildConfig::from_toml_str("[merge]\nmin_name_len = 10\nmax_name_len = 2\n"),
            Err(ConfigError::Rules(_))
        ));
        assert!(matches!(
            BuildConfig::from_toml_str("[merge]\nembed_batch_size = 0\n"),
            Err(ConfigError::Invalid {
                field: "merge.embed_batch_size",
                ..
            })
        ));
        assert!(matches!(
            BuildConfig::from_toml_str("[build\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILENAME), "not = [valid").unwrap();

        assert!(BuildConfig::load_strict(dir.path()).is_err());
        let config = BuildConfig::load(dir.path());
        assert_eq!(config.build.chunk_size, 1200);
    }

    #[test]
    fn test_scan_options_include_defaults() {
        let mut config = BuildConfig::default();
        config.scanner.ignore = vec!["vendor/".to_string(), "target/".to_string()];
        let options = config.scan_options();
        assert_eq!(options.ignore_patterns[0], "vendor/");
        assert_eq!(
            options.ignore_patterns.iter().filter(|p| *p == "target/").count(),
            1
        );
        assert_eq!(options.max_file_size, Some(1024 * 1024));
    }
}
