//! LLM client trait for chunk-level entity extraction.

use futures::future::BoxFuture;
use repograph_core::{DraftEntity, DraftRelation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors from an extraction call, classified for the retry state machine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("LLM provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("LLM provider rejected credentials: {0}")]
    Auth(String),

    #[error("transient LLM failure: {0}")]
    Transient(String),

    #[error("LLM extraction failed: {0}")]
    Unrecoverable(String),

    #[error("LLM call cancelled")]
    Cancelled,
}

/// One chunk to extract from.
#[derive(Debug, Clone)]
pub struct ExtractionRequest<'a> {
    pub path: &'a str,
    pub language: &'a str,
    pub content: &'a str,
}

/// Entities and relations the model found in a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<DraftEntity>,
    #[serde(default)]
    pub relations: Vec<DraftRelation>,
}

/// Extracts or enriches entities from a chunk of content.
pub trait LlmClient: Send + Sync {
    fn extract<'a>(
        &'a self,
        request: ExtractionRequest<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Extraction, LlmError>>;

    fn model_name(&self) -> &str;
}
