//! Error taxonomy for the build pipeline.
//!
//! Every extraction failure falls into one of three classes:
//! - file-local: logged, the file is skipped and retried on the next build
//! - transient: retried with backoff inside the worker, bounded attempts
//! - fatal: triggers cancellation of the whole build

use repograph_core::ParseError;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::embeddings::EmbeddingError;
use crate::llm::LlmError;
use crate::storage::ManifestError;

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    FileLocal,
    Transient,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::FileLocal => "file-local",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// A condition that invalidates the current build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FatalError {
    #[error("storage write failed for {path}: {message}")]
    Storage { path: String, message: String },

    #[error("manifest update failed for {path}: {message}")]
    Manifest { path: String, message: String },

    #[error("authentication failed for {path}: {message}")]
    Auth { path: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FatalError {
    /// File whose processing raised the error, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            FatalError::Storage { path, .. }
            | FatalError::Manifest { path, .. }
            | FatalError::Auth { path, .. } => Some(path),
            FatalError::Config(_) | FatalError::Internal(_) => None,
        }
    }
}

/// Failure extracting a single file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("failed to read file: {0}")]
    Io(String),

    #[error("file is not valid UTF-8")]
    Decode,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unrecoverable provider error: {0}")]
    Unrecoverable(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("cancelled")]
    Cancelled,
}

impl ExtractError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExtractError::RateLimited { .. } | ExtractError::Transient(_) => ErrorClass::Transient,
            ExtractError::Auth(_) => ErrorClass::Fatal,
            ExtractError::Io(_)
            | ExtractError::Decode
            | ExtractError::Parse(_)
            | ExtractError::Unrecoverable(_)
            | ExtractError::RetriesExhausted { .. }
            | ExtractError::Cancelled => ErrorClass::FileLocal,
        }
    }

    /// Errors that only exist because the build is shutting down.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExtractError::Cancelled)
    }

    /// Promote a fatal-class error to the cause surfaced by the build.
    pub fn into_fatal(self, path: &str) -> FatalError {
        match self {
            ExtractError::Auth(message) => FatalError::Auth {
                path: path.to_string(),
                message,
            },
            other => FatalError::Internal(format!("{}: {}", path, other)),
        }
    }
}

impl From<LlmError> for ExtractError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited { retry_after } => ExtractError::RateLimited { retry_after },
            LlmError::Auth(m) => ExtractError::Auth(m),
            LlmError::Transient(m) => ExtractError::Transient(m),
            LlmError::Unrecoverable(m) => ExtractError::Unrecoverable(m),
            LlmError::Cancelled => ExtractError::Cancelled,
        }
    }
}

impl From<EmbeddingError> for ExtractError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::RateLimited { retry_after } => ExtractError::RateLimited { retry_after },
            EmbeddingError::Auth(m) => ExtractError::Auth(m),
            EmbeddingError::Transient(m) => ExtractError::Transient(m),
            EmbeddingError::Cancelled => ExtractError::Cancelled,
            other @ (EmbeddingError::Unrecoverable(_) | EmbeddingError::DimensionMismatch { .. }) => {
                ExtractError::Unrecoverable(other.to_string())
            }
        }
    }
}

/// Error returned by a build.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The build was cancelled by a fatal error. Files in `unresolved` keep
    /// their previous manifest entries and are safe to retry.
    #[error("build aborted: {cause} ({} file(s) unresolved)", .unresolved.len())]
    Aborted {
        cause: FatalError,
        unresolved: Vec<String>,
        committed: Vec<String>,
        /// Shutdown hit a timeout and tasks were aborted.
        forced: bool,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BuildError {
    /// The fatal cause, if the build was aborted.
    pub fn cause(&self) -> Option<&FatalError> {
        match self {
            BuildError::Aborted { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_error_classes() {
        assert_eq!(ExtractError::Decode.class(), ErrorClass::FileLocal);
        assert_eq!(
            ExtractError::Parse(ParseError::Binary(0)).class(),
            ErrorClass::FileLocal
        );
        assert_eq!(
            ExtractError::RateLimited { retry_after: None }.class(),
            ErrorClass::Transient
        );
        assert_eq!(ExtractError::Transient("reset".into()).class(), ErrorClass::Transient);
        assert_eq!(ExtractError::Auth("401".into()).class(), ErrorClass::Fatal);
        assert_eq!(
            ExtractError::RetriesExhausted {
                attempts: 5,
                last: "503".into()
            }
            .class(),
            ErrorClass::FileLocal
        );
    }

    #[test]
    fn test_provider_error_conversion() {
        let e: ExtractError = LlmError::Auth("bad key".into()).into();
        assert_eq!(e, ExtractError::Auth("bad key".into()));

        let e: ExtractError = EmbeddingError::DimensionMismatch {
            expected: 3,
            actual: 2,
        }
        .into();
        assert_eq!(e.class(), ErrorClass::FileLocal);

        let e: ExtractError = EmbeddingError::Cancelled.into();
        assert!(e.is_cancellation());
    }

    #[test]
    fn test_auth_promotes_to_fatal_with_path() {
        let fatal = ExtractError::Auth("401".into()).into_fatal("src/a.rs");
        assert_eq!(fatal.path(), Some("src/a.rs"));
        assert!(fatal.to_string().contains("src/a.rs"));
    }

    #[test]
    fn test_aborted_message_counts_unresolved() {
        let err = BuildError::Aborted {
            cause: FatalError::Storage {
                path: "c.rs".into(),
                message: "disk full".into(),
            },
            unresolved: vec!["c.rs".into(), "d.rs".into()],
            committed: vec!["a.rs".into()],
            forced: false,
        };
        assert_eq!(
            err.to_string(),
            "build aborted: storage write failed for c.rs: disk full (2 file(s) unresolved)"
        );
        assert!(err.cause().is_some());
    }
}
