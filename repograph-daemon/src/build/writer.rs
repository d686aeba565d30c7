//! Storage writer: the only component that mutates the graph during a build.
//!
//! Results are committed in arrival order. A file's manifest entry is
//! recorded only after its mutation committed, so the manifest never claims
//! a file the store does not hold.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::cancel::CancellationController;
use super::task::ExtractionResult;
use crate::error::{ErrorClass, FatalError};
use crate::storage::{GraphStore, ManifestStore};
use repograph_core::SourceKind;

/// Work item for the writer.
#[derive(Debug)]
pub enum WriterInput {
    /// File vanished from the sources
    Delete(String),
    Extracted(ExtractionResult),
}

impl WriterInput {
    pub fn path(&self) -> &str {
        match self {
            WriterInput::Delete(path) => path,
            WriterInput::Extracted(result) => &result.task.path,
        }
    }
}

/// A file whose extraction failed without stopping the build.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
    pub path: String,
    pub class: ErrorClass,
    pub reason: String,
}

/// What the writer did, per file.
#[derive(Debug, Clone, Default)]
pub struct BuildLedger {
    /// Mutations committed and recorded in the manifest
    pub committed: Vec<String>,
    pub skipped: Vec<SkippedFile>,
    /// Deleted files retracted from the store and manifest
    pub removed: Vec<String>,
    /// Results received but not applied because the build was cancelled
    pub unresolved: Vec<String>,
    /// Entity ids first created by code files in this build
    pub new_code_entities: BTreeSet<String>,
    pub entities_written: usize,
    pub relations_written: usize,
}

impl BuildLedger {
    pub fn processed(&self) -> usize {
        self.committed.len() + self.skipped.len() + self.removed.len()
    }
}

/// Ledger shared with the orchestrator, which still needs it if the writer
/// is aborted.
pub(crate) type SharedLedger = Arc<Mutex<BuildLedger>>;

pub(crate) fn lock_ledger(ledger: &SharedLedger) -> MutexGuard<'_, BuildLedger> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct StorageWriter {
    pub store: Arc<dyn GraphStore>,
    pub manifest: Arc<dyn ManifestStore>,
    pub controller: CancellationController,
    pub ledger: SharedLedger,
    pub progress_interval: Duration,
    /// Files expected in this build, for progress reporting
    pub total: usize,
}

impl StorageWriter {
    pub async fn run(self, mut inputs: mpsc::Receiver<WriterInput>) {
        let cancel = self.controller.token().clone();
        let mut ticker = interval_at(Instant::now() + self.progress_interval, self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The ticker is polled before the inbox so a backlog cannot starve it.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.report_progress(),
                input = inputs.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => break,
                },
            }
        }

        if cancel.is_cancelled() {
            inputs.close();
            let mut drained = 0usize;
            while let Some(input) = inputs.recv().await {
                lock_ledger(&self.ledger).unresolved.push(input.path().to_string());
                drained += 1;
            }
            if drained > 0 {
                debug!(drained, "Discarded results after cancellation");
            }
        }

        self.report_progress();
    }

    fn report_progress(&self) {
        let ledger = lock_ledger(&self.ledger);
        info!(
            processed = ledger.processed(),
            total = self.total,
            committed = ledger.committed.len(),
            skipped = ledger.skipped.len(),
            removed = ledger.removed.len(),
            "Build progress"
        );
    }

    async fn handle(&self, input: WriterInput) {
        match input {
            WriterInput::Delete(path) => self.remove(path).await,
            WriterInput::Extracted(result) => self.commit(result).await,
        }
    }

    fn unresolved(&self, path: String) {
        lock_ledger(&self.ledger).unresolved.push(path);
    }

    async fn remove(&self, path: String) {
        if self.controller.is_cancelled() {
            return self.unresolved(path);
        }

        let store = self.store.clone();
        let target = path.clone();
        let retracted = match tokio::task::spawn_blocking(move || store.retract_file(&target)).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                self.controller.trigger(FatalError::Storage {
                    path: path.clone(),
                    message: e.to_string(),
                });
                return self.unresolved(path);
            }
            Err(e) => {
                self.controller
                    .trigger(FatalError::Internal(format!("retract task failed: {}", e)));
                return self.unresolved(path);
            }
        };

        if let Err(fatal) = self.update_manifest(&path, None).await {
            self.controller.trigger(fatal);
            return self.unresolved(path);
        }

        debug!(
            path = %path,
            entities = retracted.entities_removed,
            relations = retracted.relations_removed,
            "Retracted deleted file"
        );
        lock_ledger(&self.ledger).removed.push(path);
    }

    async fn commit(&self, result: ExtractionResult) {
        let path = result.task.path;
        let mutation = match result.outcome {
            Ok(mutation) => mutation,
            Err(e) if e.is_cancellation() => return self.unresolved(path),
            Err(e) if e.class() == ErrorClass::Fatal => {
                self.controller.trigger(e.into_fatal(&path));
                return self.unresolved(path);
            }
            Err(e) => {
                warn!(path = %path, attempts = result.attempts, "Skipping file: {}", e);
                lock_ledger(&self.ledger).skipped.push(SkippedFile {
                    path,
                    class: e.class(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        if self.controller.is_cancelled() {
            return self.unresolved(path);
        }

        let store = self.store.clone();
        let kind = mutation.kind;
        let hash = mutation.hash.clone();
        let token = match tokio::task::spawn_blocking(move || store.apply_file(&mutation)).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                self.controller.trigger(FatalError::Storage {
                    path: path.clone(),
                    message: e.to_string(),
                });
                return self.unresolved(path);
            }
            Err(e) => {
                self.controller
                    .trigger(FatalError::Internal(format!("commit task failed: {}", e)));
                return self.unresolved(path);
            }
        };

        // The commit is durable; record it even if cancellation arrived meanwhile.
        if let Err(fatal) = self.update_manifest(&path, Some(hash)).await {
            self.controller.trigger(fatal);
            return self.unresolved(path);
        }

        debug!(
            path = %path,
            sequence = token.sequence,
            entities = token.entity_count,
            relations = token.relation_count,
            "Committed file"
        );

        let mut ledger = lock_ledger(&self.ledger);
        ledger.entities_written += token.entity_count;
        ledger.relations_written += token.relation_count;
        if kind == SourceKind::Code {
            ledger.new_code_entities.extend(token.created);
        }
        ledger.committed.push(path);
    }

    /// Record (`Some(hash)`) or remove (`None`) a manifest entry.
    async fn update_manifest(&self, path: &str, hash: Option<String>) -> Result<(), FatalError> {
        let manifest = self.manifest.clone();
        let target = path.to_string();
        let outcome = tokio::task::spawn_blocking(move || match hash {
            Some(hash) => manifest.record(&target, &hash),
            None => manifest.remove(&target),
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FatalError::Manifest {
                path: path.to_string(),
                message: e.to_string(),
            }),
            Err(e) => Err(FatalError::Internal(format!("manifest task failed: {}", e))),
        }
    }
}
