//! Build pipeline implementation.

use repograph_core::{diff, discover, ChangeSet, FileRecord};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::cancel::CancellationController;
use super::queue::TaskQueue;
use super::rate_limit::RateLimiter;
use super::task::{ExtractionTask, RetryPolicy};
use super::worker::{Collaborators, Worker, WorkerContext};
use super::writer::{lock_ledger, BuildLedger, SharedLedger, SkippedFile, StorageWriter, WriterInput};
use crate::config::BuildConfig;
use crate::error::{BuildError, FatalError};
use crate::merge::{MergeEngine, MergeError, MergeReport};
use crate::storage::{GraphStore, ManifestError, ManifestStore};

/// How a build that did not abort ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Completed,
    /// Some files failed with file-local errors and will be retried next time
    CompletedWithSkips,
}

/// Result of a build operation.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub status: BuildStatus,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub committed: Vec<String>,
    pub skipped: Vec<SkippedFile>,
    pub removed: Vec<String>,
    pub entities_written: usize,
    pub relations_written: usize,
    /// Present when the merge pass ran
    pub merge: Option<MergeReport>,
    /// Set when the merge pass failed; the ingested files stay committed
    pub merge_error: Option<String>,
    pub duration: Duration,
}

/// Incremental build: diff, extract in parallel, commit sequentially, merge.
pub struct BuildPipeline {
    config: BuildConfig,
    store: Arc<dyn GraphStore>,
    manifest: Arc<dyn ManifestStore>,
    collaborators: Collaborators,
}

/// Outcome of stopping the pool and the writer.
struct Shutdown {
    ledger: BuildLedger,
    forced: bool,
}

impl BuildPipeline {
    pub fn new(
        config: BuildConfig,
        store: Arc<dyn GraphStore>,
        manifest: Arc<dyn ManifestStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            store,
            manifest,
            collaborators,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Discover files under `roots` and build them.
    pub async fn build_from_roots(&self, roots: &[PathBuf]) -> Result<BuildReport, BuildError> {
        let options = self.config.scan_options();
        let roots = roots.to_vec();
        let scan = tokio::task::spawn_blocking(move || discover(&roots, &options))
            .await
            .map_err(|e| BuildError::Aborted {
                cause: FatalError::Internal(format!("discovery task failed: {}", e)),
                unresolved: Vec::new(),
                committed: Vec::new(),
                forced: false,
            })?;

        info!(
            files = scan.files.len(),
            skipped = scan.skipped_count,
            errors = scan.error_count,
            missing_roots = scan.missing_roots.len(),
            duration_ms = scan.duration_ms,
            "Discovered files"
        );

        self.build(scan.files).await
    }

    /// Build from an already discovered file list.
    pub async fn build(&self, files: Vec<FileRecord>) -> Result<BuildReport, BuildError> {
        let start = Instant::now();

        let manifest = self.manifest.load()?;
        let changes = diff(&files, &manifest);
        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            unchanged = changes.unchanged.len(),
            "Computed change set"
        );

        let controller = CancellationController::new();
        let shutdown = if changes.is_empty() {
            Shutdown {
                ledger: BuildLedger::default(),
                forced: false,
            }
        } else {
            self.ingest(&changes, &controller).await
        };
        if controller.cause().is_none() {
            if let Err(cause) = ensure_resolved(&changes, &shutdown.ledger) {
                controller.trigger(cause);
            }
        }

        let finalized = self.finalize().await;

        if let Some(cause) = controller.cause().cloned() {
            if let Err(e) = finalized {
                warn!("Manifest finalize failed during abort: {}", e);
            }
            let unresolved = unresolved_paths(&changes, &shutdown.ledger);
            warn!(
                cause = %cause,
                unresolved = unresolved.len(),
                committed = shutdown.ledger.committed.len(),
                forced = shutdown.forced,
                "Build aborted"
            );
            return Err(BuildError::Aborted {
                cause,
                unresolved,
                committed: shutdown.ledger.committed,
                forced: shutdown.forced,
            });
        }
        finalized?;

        let ledger = shutdown.ledger;
        let (merge, merge_error) = match self.merge_pass(&ledger.new_code_entities, &controller).await {
            Ok(merge) => (merge, None),
            Err(e) => {
                warn!(error = %e, "Merge pass failed, keeping ingested files");
                (None, Some(e.to_string()))
            }
        };

        let status = if ledger.skipped.is_empty() {
            BuildStatus::Completed
        } else {
            BuildStatus::CompletedWithSkips
        };
        let report = BuildReport {
            status,
            added: changes.added.len(),
            modified: changes.modified.len(),
            deleted: changes.deleted.len(),
            unchanged: changes.unchanged.len(),
            committed: ledger.committed,
            skipped: ledger.skipped,
            removed: ledger.removed,
            entities_written: ledger.entities_written,
            relations_written: ledger.relations_written,
            merge,
            merge_error,
            duration: start.elapsed(),
        };

        info!(
            committed = report.committed.len(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Build complete"
        );
        Ok(report)
    }

    /// Run the worker pool and the writer over `changes`.
    async fn ingest(&self, changes: &ChangeSet, controller: &CancellationController) -> Shutdown {
        let cancel = controller.token().clone();
        let capacity = self.config.queue_capacity();
        let parallelism = self.config.build.parallelism.max(1);

        let (task_tx, queue) = TaskQueue::bounded(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        let ledger: SharedLedger = Arc::new(Mutex::new(BuildLedger::default()));
        let writer = StorageWriter {
            store: self.store.clone(),
            manifest: self.manifest.clone(),
            controller: controller.clone(),
            ledger: ledger.clone(),
            progress_interval: self.config.progress_interval(),
            total: changes.pending_count(),
        };
        let mut writer_handle = tokio::spawn(writer.run(result_rx));

        let context = Arc::new(WorkerContext {
            collaborators: self.collaborators.clone(),
            limiter: RateLimiter::new(self.config.min_interval()),
            policy: RetryPolicy::new(self.config.rate_limit.max_attempts, self.config.backoff()),
        });
        let mut workers = JoinSet::new();
        for id in 0..parallelism {
            workers.spawn(
                Worker {
                    id,
                    queue: queue.clone(),
                    results: result_tx.clone(),
                    context: context.clone(),
                    controller: controller.clone(),
                }
                .run(),
            );
        }
        debug!(parallelism, capacity, "Worker pool started");

        for path in &changes.deleted {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = result_tx.send(WriterInput::Delete(path.clone())) => sent.is_ok(),
            };
            if !sent {
                break;
            }
        }
        drop(result_tx);

        let mut sequence = 0u64;
        for (file, change) in changes.to_extract() {
            sequence += 1;
            if task_tx
                .push(ExtractionTask::new(file, change, sequence), &cancel)
                .await
                .is_err()
            {
                break;
            }
        }
        drop(task_tx);

        let mut forced = false;

        let stopped = tokio::select! {
            _ = join_workers(&mut workers, controller) => true,
            _ = controller.cancelled() => false,
        };
        if !stopped {
            let discarded = queue.drain().await;
            if !discarded.is_empty() {
                debug!(discarded = discarded.len(), "Discarded pending tasks");
            }
            let grace = self.config.worker_stop_timeout();
            if tokio::time::timeout(grace, join_workers(&mut workers, controller))
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = grace.as_millis() as u64,
                    "Workers did not stop in time, aborting them"
                );
                workers.abort_all();
                forced = true;
            }
        }

        let drained = if controller.is_cancelled() {
            self.await_writer(&mut writer_handle, controller).await
        } else {
            tokio::select! {
                res = &mut writer_handle => {
                    check_writer_join(controller, res);
                    true
                }
                _ = controller.cancelled() => self.await_writer(&mut writer_handle, controller).await,
            }
        };
        if !drained {
            warn!("Writer did not drain in time, aborting it");
            writer_handle.abort();
            forced = true;
        }

        let ledger = lock_ledger(&ledger).clone();
        Shutdown { ledger, forced }
    }

    /// Wait for the writer with the drain timeout. Returns false on timeout.
    async fn await_writer(
        &self,
        handle: &mut tokio::task::JoinHandle<()>,
        controller: &CancellationController,
    ) -> bool {
        match tokio::time::timeout(self.config.writer_drain_timeout(), handle).await {
            Ok(res) => {
                check_writer_join(controller, res);
                true
            }
            Err(_) => false,
        }
    }

    /// Flush the manifest, bounded by the finalize timeout.
    async fn finalize(&self) -> Result<(), ManifestError> {
        let limit = self.config.finalize_timeout();
        let manifest = self.manifest.clone();
        match tokio::time::timeout(limit, tokio::task::spawn_blocking(move || manifest.finalize())).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ManifestError::Io {
                path: "manifest".to_string(),
                source: std::io::Error::other(e.to_string()),
            }),
            Err(_) => Err(ManifestError::FinalizeTimeout(limit)),
        }
    }

    async fn merge_pass(
        &self,
        new_code_entities: &BTreeSet<String>,
        controller: &CancellationController,
    ) -> Result<Option<MergeReport>, MergeError> {
        if !self.config.merge.enabled {
            return Ok(None);
        }
        if new_code_entities.is_empty() {
            debug!("No new code entities, skipping merge pass");
            return Ok(None);
        }

        let mut engine = MergeEngine::from_config(&self.config)?;
        if let Some(embeddings) = &self.collaborators.embeddings {
            engine = engine.with_embeddings(embeddings.clone());
        }
        let report = engine
            .run(self.store.clone(), Some(new_code_entities), controller.token())
            .await?;
        Ok(Some(report))
    }
}

async fn join_workers(workers: &mut JoinSet<()>, controller: &CancellationController) {
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                controller.trigger(FatalError::Internal(format!("worker panicked: {}", e)));
            }
        }
    }
}

/// A writer that panicked or was cancelled leaves its inbox unprocessed.
fn check_writer_join(controller: &CancellationController, res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        controller.trigger(FatalError::Internal(format!("writer task failed: {}", e)));
    }
}

/// Every planned path must be committed, skipped or removed before the
/// build can complete.
fn ensure_resolved(changes: &ChangeSet, ledger: &BuildLedger) -> Result<(), FatalError> {
    let unresolved = unresolved_paths(changes, ledger);
    if unresolved.is_empty() {
        return Ok(());
    }
    Err(FatalError::Internal(format!(
        "{} file(s) left unresolved, first: {}",
        unresolved.len(),
        unresolved[0]
    )))
}

/// Planned paths that were neither committed, skipped nor removed.
fn unresolved_paths(changes: &ChangeSet, ledger: &BuildLedger) -> Vec<String> {
    let resolved: BTreeSet<&str> = ledger
        .committed
        .iter()
        .chain(ledger.removed.iter())
        .map(String::as_str)
        .chain(ledger.skipped.iter().map(|s| s.path.as_str()))
        .collect();

    let mut unresolved: Vec<String> = changes
        .to_extract()
        .map(|(file, _)| file.path.as_str())
        .chain(changes.deleted.iter().map(String::as_str))
        .filter(|path| !resolved.contains(path))
        .map(str::to_string)
        .collect();
    unresolved.sort();
    unresolved.dedup();
    unresolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use repograph_core::Manifest;

    #[test]
    fn test_unresolved_paths_excludes_resolved() {
        let mut manifest = Manifest::default();
        manifest.insert("gone.rs", "xxh3:0", 0);
        manifest.insert("kept.rs", "xxh3:1", 0);
        let files = vec![
            FileRecord::new("a.rs", "xxh3:a", "rust"),
            FileRecord::new("b.rs", "xxh3:b", "rust"),
            FileRecord::new("c.rs", "xxh3:c", "rust"),
            FileRecord::new("kept.rs", "xxh3:1", "rust"),
        ];
        let changes = diff(&files, &manifest);

        let ledger = BuildLedger {
            committed: vec!["a.rs".into()],
            skipped: vec![SkippedFile {
                path: "b.rs".into(),
                class: ErrorClass::FileLocal,
                reason: "not valid UTF-8".into(),
            }],
            ..Default::default()
        };
        assert_eq!(unresolved_paths(&changes, &ledger), vec!["c.rs", "gone.rs"]);
    }

    #[test]
    fn test_unresolved_files_block_completion() {
        let files = vec![
            FileRecord::new("a.rs", "xxh3:a", "rust"),
            FileRecord::new("b.rs", "xxh3:b", "rust"),
        ];
        let changes = diff(&files, &Manifest::default());

        let partial = BuildLedger {
            committed: vec!["a.rs".into()],
            ..Default::default()
        };
        match ensure_resolved(&changes, &partial) {
            Err(FatalError::Internal(message)) => assert!(message.contains("b.rs")),
            other => panic!("expected an internal error, got {:?}", other),
        }

        let complete = BuildLedger {
            committed: vec!["a.rs".into(), "b.rs".into()],
            ..Default::default()
        };
        assert!(ensure_resolved(&changes, &complete).is_ok());
    }

    #[tokio::test]
    async fn test_failed_writer_triggers_cancellation() {
        let controller = CancellationController::new();
        let handle = tokio::spawn(async { panic!("writer blew up") });
        check_writer_join(&controller, handle.await);

        assert!(controller.is_cancelled());
        assert!(matches!(controller.cause(), Some(FatalError::Internal(m)) if m.contains("writer task failed")));
    }

    #[tokio::test]
    async fn test_clean_writer_exit_is_not_fatal() {
        let controller = CancellationController::new();
        let handle = tokio::spawn(async {});
        check_writer_join(&controller, handle.await);
        assert!(!controller.is_cancelled());
    }
}
