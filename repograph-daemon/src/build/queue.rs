//! Bounded task queue between the producer and the worker pool.
//!
//! Dropping the [`TaskSender`] marks end of input. Consumers never block
//! past cancellation: `next` returns `None` as soon as the token fires.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::task::ExtractionTask;

/// Producer side. Blocks when the queue is full.
pub struct TaskSender {
    tx: mpsc::Sender<ExtractionTask>,
}

/// Push failed because the build is shutting down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task queue closed")]
pub struct QueueClosed(pub ExtractionTask);

impl TaskSender {
    /// Enqueue a task, waiting for space. Fails fast on cancellation.
    pub async fn push(&self, task: ExtractionTask, cancel: &CancellationToken) -> Result<(), QueueClosed> {
        if cancel.is_cancelled() {
            return Err(QueueClosed(task));
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueClosed(task)),
            permit = self.tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(task);
                Ok(())
            }
            Err(_) => Err(QueueClosed(task)),
        }
    }
}

/// Consumer side, shared by all workers.
#[derive(Clone)]
pub struct TaskQueue {
    rx: Arc<Mutex<mpsc::Receiver<ExtractionTask>>>,
}

impl TaskQueue {
    pub fn bounded(capacity: usize) -> (TaskSender, TaskQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            TaskSender { tx },
            TaskQueue {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Next task, or `None` on end of input or cancellation.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<ExtractionTask> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            task = async { self.rx.lock().await.recv().await } => task,
        }
    }

    /// Close the queue and discard everything still pending.
    pub async fn drain(&self) -> Vec<ExtractionTask> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = Vec::new();
        while let Ok(task) = rx.try_recv() {
            discarded.push(task);
        }
        discarded
    }
}
