//! Embedding client trait used by extraction workers and the merge engine.
//!
//! Implementations receive the build's cancellation token and must return
//! promptly with [`EmbeddingError::Cancelled`] once it fires.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Error type for embedding operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
    /// Provider asked us to slow down
    #[error("embedding provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials rejected
    #[error("embedding provider rejected credentials: {0}")]
    Auth(String),

    /// Network hiccup or provider-side 5xx
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// The request or the response can never succeed as-is
    #[error("embedding failed: {0}")]
    Unrecoverable(String),

    /// Returned vectors do not match the configured model dimension
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding cancelled")]
    Cancelled,
}

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Converts text into fixed-dimension vectors.
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts. The output has one vector per input, in order.
    fn embed<'a>(
        &'a self,
        texts: &'a [String],
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, EmbeddingResult<Vec<Vec<f32>>>>;

    /// Dimension of the returned vectors.
    fn dimension(&self) -> usize;

    /// Model name/identifier.
    fn model_name(&self) -> &str;
}

/// Check that a batch response matches the request and the model dimension.
pub fn validate_batch(
    inputs: usize,
    vectors: &[Vec<f32>],
    dimension: usize,
) -> EmbeddingResult<()> {
    if vectors.len() != inputs {
        return Err(EmbeddingError::Unrecoverable(format!(
            "expected {} vectors, got {}",
            inputs,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_batch() {
        let vectors = vec![vec![0.0; 3], vec![1.0; 3]];
        assert!(validate_batch(2, &vectors, 3).is_ok());
        assert!(matches!(
            validate_batch(3, &vectors, 3),
            Err(EmbeddingError::Unrecoverable(_))
        ));
        assert_eq!(
            validate_batch(2, &vectors, 4),
            Err(EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        );
    }
}
