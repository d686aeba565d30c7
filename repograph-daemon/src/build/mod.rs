//! Incremental build pipeline.
//!
//! Orchestrates:
//! 1. Discovering files and diffing them against the manifest
//! 2. Extracting added and modified files on a bounded worker pool
//! 3. Committing results one file at a time through the storage writer
//! 4. Consolidating new code entities with documented ones
//!
//! A fatal error anywhere cancels the build through the shared
//! [`CancellationController`]; every wait during shutdown is bounded.

mod cancel;
mod pipeline;
mod queue;
mod rate_limit;
mod task;
mod worker;
mod writer;

pub use cancel::CancellationController;
pub use pipeline::{BuildPipeline, BuildReport, BuildStatus};
pub use queue::{QueueClosed, TaskQueue, TaskSender};
pub use rate_limit::RateLimiter;
pub use task::{ExtractionResult, ExtractionTask, RetryPolicy, TaskState};
pub use worker::Collaborators;
pub use writer::{BuildLedger, SkippedFile, WriterInput};
