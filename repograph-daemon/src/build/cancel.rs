//! Build-wide cancellation with a single surfaced cause.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::FatalError;

/// Shared abort signal for one build.
///
/// `trigger` is idempotent: the first cause is kept and reported, later
/// ones (usually side effects of the shutdown itself) are dropped.
#[derive(Clone, Debug, Default)]
pub struct CancellationController {
    token: CancellationToken,
    cause: Arc<OnceLock<FatalError>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to workers, the writer and collaborator calls.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Signal a fatal condition. Returns true if this call set the cause.
    pub fn trigger(&self, cause: FatalError) -> bool {
        let first = match self.cause.set(cause) {
            Ok(()) => {
                if let Some(cause) = self.cause.get() {
                    error!(cause = %cause, "Fatal error, cancelling build");
                }
                true
            }
            Err(later) => {
                debug!(cause = %later, "Ignoring secondary cancellation cause");
                false
            }
        };
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The first fatal cause, if any.
    pub fn cause(&self) -> Option<&FatalError> {
        self.cause.get()
    }

    /// Resolves once cancellation was triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
