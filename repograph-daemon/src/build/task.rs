//! Extraction tasks and their retry state machine.
//!
//! ```text
//! Pending -> InFlight(1) -> Succeeded
//!                        -> Backoff(1, d) -> InFlight(2) -> ...
//!                        -> Failed(class)
//! ```
//!
//! Rate-limit and transient errors go to `Backoff` until the attempt budget
//! is spent; everything else fails the task with its error class.

use repograph_core::{ChangeKind, FileRecord, SourceKind};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorClass, ExtractError};
use crate::storage::FileMutation;

/// One file to extract, consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionTask {
    pub path: String,
    /// Hash seen at discovery time
    pub hash: String,
    pub language: String,
    pub kind: SourceKind,
    pub change: ChangeKind,
    /// Emission order, starting at 1
    pub sequence: u64,
}

impl ExtractionTask {
    pub fn new(file: &FileRecord, change: ChangeKind, sequence: u64) -> Self {
        Self {
            path: file.path.clone(),
            hash: file.hash.clone(),
            language: file.language.clone(),
            kind: file.kind,
            change,
            sequence,
        }
    }
}

/// Outcome of a task, handed to the writer.
#[derive(Debug)]
pub struct ExtractionResult {
    pub task: ExtractionTask,
    pub outcome: Result<FileMutation, ExtractError>,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Per-task lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    InFlight { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Failed(ErrorClass),
    Succeeded,
}

/// Bounds for the retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Sleep after a rate-limit response
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay before retrying after `error` on attempt `attempt`.
    fn delay_for(&self, error: &ExtractError, attempt: u32) -> Duration {
        match error {
            ExtractError::RateLimited { retry_after } => {
                retry_after.map_or(self.backoff, |hint| hint.max(self.backoff))
            }
            _ => self.backoff.saturating_mul(attempt),
        }
    }
}

impl TaskState {
    /// Begin the first or next attempt.
    pub fn start(&self) -> TaskState {
        match self {
            TaskState::Pending => TaskState::InFlight { attempt: 1 },
            TaskState::Backoff { attempt, .. } => TaskState::InFlight { attempt: attempt + 1 },
            other => other.clone(),
        }
    }

    /// Transition after the current attempt failed with `error`.
    ///
    /// Returns the new state and, if the budget was exhausted, the error the
    /// task finally fails with.
    pub fn on_error(&self, error: &ExtractError, policy: &RetryPolicy) -> (TaskState, Option<ExtractError>) {
        let TaskState::InFlight { attempt } = *self else {
            return (self.clone(), None);
        };

        match error.class() {
            ErrorClass::Transient if attempt < policy.max_attempts => (
                TaskState::Backoff {
                    attempt,
                    delay: policy.delay_for(error, attempt),
                },
                None,
            ),
            ErrorClass::Transient => (
                TaskState::Failed(ErrorClass::FileLocal),
                Some(ExtractError::RetriesExhausted {
                    attempts: attempt,
                    last: error.to_string(),
                }),
            ),
            class => (TaskState::Failed(class), None),
        }
    }

    pub fn on_success(&self) -> TaskState {
        TaskState::Succeeded
    }

    pub fn attempt(&self) -> u32 {
        match self {
            TaskState::InFlight { attempt } | TaskState::Backoff { attempt, .. } => *attempt,
            _ => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Failed(_) | TaskState::Succeeded)
    }
}

/// Terminal outcome of [`drive`].
#[derive(Debug)]
pub(crate) struct Driven<T> {
    pub outcome: Result<T, ExtractError>,
    pub attempts: u32,
    pub state: TaskState,
}

/// Run `attempt` until the task reaches `Succeeded` or `Failed`, sleeping
/// through backoffs. Cancellation during a backoff fails the task.
pub(crate) async fn drive<T, F, Fut>(
    path: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Driven<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExtractError>>,
{
    let mut state = TaskState::Pending;
    let mut outcome = Err(ExtractError::Cancelled);
    let mut attempts = 0;

    while !state.is_terminal() {
        state = state.start();
        attempts = state.attempt();

        let error = match attempt().await {
            Ok(value) => {
                outcome = Ok(value);
                state = state.on_success();
                continue;
            }
            Err(e) => e,
        };

        let (next, exhausted) = state.on_error(&error, policy);
        if let TaskState::Backoff { delay, .. } = next {
            warn!(
                path = %path,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after {}",
                error
            );
            let cancelled = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                outcome = Err(ExtractError::Cancelled);
                state = TaskState::Failed(ExtractError::Cancelled.class());
                continue;
            }
        } else {
            outcome = Err(exhausted.unwrap_or(error));
        }
        state = next;
    }

    Driven {
        outcome,
        attempts,
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(10))
    }

    #[test]
    fn test_happy_path() {
        let state = TaskState::Pending.start();
        assert_eq!(state, TaskState::InFlight { attempt: 1 });
        assert_eq!(state.on_success(), TaskState::Succeeded);
        assert!(TaskState::Succeeded.is_terminal());
    }

    #[test]
    fn test_rate_limit_backs_off_then_retries() {
        let state = TaskState::Pending.start();
        let (state, exhausted) = state.on_error(
            &ExtractError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
            &policy(),
        );
        assert!(exhausted.is_none());
        assert_eq!(
            state,
            TaskState::Backoff {
                attempt: 1,
                delay: Duration::from_secs(30)
            }
        );
        assert_eq!(state.start(), TaskState::InFlight { attempt: 2 });
    }

    #[test]
    fn test_rate_limit_hint_below_backoff_uses_backoff() {
        let (state, _) = TaskState::Pending.start().on_error(
            &ExtractError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            },
            &policy(),
        );
        assert_eq!(
            state,
            TaskState::Backoff {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn test_transient_backoff_grows_and_exhausts() {
        let p = policy();
        let err = ExtractError::Transient("503".into());

        let (state, _) = TaskState::Pending.start().on_error(&err, &p);
        assert_eq!(state.attempt(), 1);
        let (state, _) = state.start().on_error(&err, &p);
        assert_eq!(
            state,
            TaskState::Backoff {
                attempt: 2,
                delay: Duration::from_secs(20)
            }
        );
        let (state, exhausted) = state.start().on_error(&err, &p);
        assert_eq!(state, TaskState::Failed(ErrorClass::FileLocal));
        assert!(matches!(
            exhausted,
            Some(ExtractError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_non_transient_fails_immediately() {
        let p = policy();
        let (state, _) = TaskState::Pending.start().on_error(&ExtractError::Decode, &p);
        assert_eq!(state, TaskState::Failed(ErrorClass::FileLocal));

        let (state, _) = TaskState::Pending
            .start()
            .on_error(&ExtractError::Auth("401".into()), &p);
        assert_eq!(state, TaskState::Failed(ErrorClass::Fatal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_reaches_succeeded_after_retry() {
        let calls = &AtomicU32::new(0);
        let driven = drive("a.rs", &policy(), &CancellationToken::new(), || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ExtractError::RateLimited { retry_after: None }),
                _ => Ok("done"),
            }
        })
        .await;

        assert_eq!(driven.state, TaskState::Succeeded);
        assert_eq!(driven.attempts, 2);
        assert_eq!(driven.outcome.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_fails_terminally_when_exhausted() {
        let driven: Driven<()> = drive("a.rs", &policy(), &CancellationToken::new(), || async {
            Err(ExtractError::Transient("503".into()))
        })
        .await;

        assert_eq!(driven.state, TaskState::Failed(ErrorClass::FileLocal));
        assert_eq!(driven.attempts, 3);
        assert!(matches!(
            driven.outcome,
            Err(ExtractError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_stops_on_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let driven: Driven<()> = drive("a.rs", &policy(), &cancel, || {
            cancel.cancel();
            async { Err(ExtractError::Transient("503".into())) }
        })
        .await;

        assert!(driven.state.is_terminal());
        assert_eq!(driven.attempts, 1);
        assert!(matches!(driven.outcome, Err(ExtractError::Cancelled)));
    }
}
