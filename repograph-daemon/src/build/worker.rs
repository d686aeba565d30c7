//! Extraction workers.
//!
//! Each worker takes tasks from the shared queue, turns the file into a
//! [`FileMutation`] and hands the result to the writer. Transient failures
//! are retried here; only terminal outcomes leave the worker.

use repograph_core::{content_hash, DraftEntity, DraftRelation, SourceParser};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cancel::CancellationController;
use super::queue::TaskQueue;
use super::rate_limit::RateLimiter;
use super::task::{drive, ExtractionResult, ExtractionTask, RetryPolicy};
use super::writer::WriterInput;
use crate::embeddings::{validate_batch, EmbeddingClient};
use crate::error::{ErrorClass, ExtractError};
use crate::llm::{ExtractionRequest, LlmClient};
use crate::storage::{
    embedding_text, join_descriptions, ChunkRecord, EntityContribution, FileMutation,
    RelationContribution,
};

/// Entity type given to relation endpoints nobody described.
const UNKNOWN_ENTITY_TYPE: &str = "unknown";

/// External collaborators used during extraction.
#[derive(Clone)]
pub struct Collaborators {
    pub parser: Arc<dyn SourceParser>,
    /// Chunk-level extraction. Skipped when `None`.
    pub llm: Option<Arc<dyn LlmClient>>,
    /// Chunk and entity vectors. Skipped when `None`.
    pub embeddings: Option<Arc<dyn EmbeddingClient>>,
}

impl Collaborators {
    pub fn new(parser: Arc<dyn SourceParser>) -> Self {
        Self {
            parser,
            llm: None,
            embeddings: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embeddings(mut self, embeddings: Arc<dyn EmbeddingClient>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }
}

/// State shared by every worker of one build.
pub(crate) struct WorkerContext {
    pub collaborators: Collaborators,
    pub limiter: RateLimiter,
    pub policy: RetryPolicy,
}

pub(crate) struct Worker {
    pub id: usize,
    pub queue: TaskQueue,
    pub results: mpsc::Sender<WriterInput>,
    pub context: Arc<WorkerContext>,
    pub controller: CancellationController,
}

/// Race `fut` against cancellation.
async fn until_cancelled<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, ExtractError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ExtractError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExtractError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}

impl Worker {
    pub async fn run(self) {
        let cancel = self.controller.token().clone();
        debug!(worker = self.id, "Worker started");

        while let Some(task) = self.queue.next(&cancel).await {
            let result = self.process(task, &cancel).await;

            if let Err(e) = &result.outcome {
                if e.is_cancellation() {
                    break;
                }
                if e.class() == ErrorClass::Fatal {
                    let cause = e.clone().into_fatal(&result.task.path);
                    self.controller.trigger(cause);
                    break;
                }
            }

            let send = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                send = self.results.send(WriterInput::Extracted(result)) => send,
            };
            if send.is_err() {
                break;
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }

    /// Run one task through the retry state machine.
    async fn process(&self, task: ExtractionTask, cancel: &CancellationToken) -> ExtractionResult {
        let current = &task;
        let driven = drive(&task.path, &self.context.policy, cancel, || self.extract(current, cancel)).await;
        debug!(path = %task.path, state = ?driven.state, attempts = driven.attempts, "Task finished");
        ExtractionResult {
            task,
            outcome: driven.outcome,
            attempts: driven.attempts,
        }
    }

    /// One attempt: read, parse, call collaborators, assemble.
    async fn extract(
        &self,
        task: &ExtractionTask,
        cancel: &CancellationToken,
    ) -> Result<FileMutation, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let bytes = tokio::fs::read(&task.path)
            .await
            .map_err(|e| ExtractError::Io(e.to_string()))?;
        let hash = content_hash(&bytes);
        let content = String::from_utf8(bytes).map_err(|_| ExtractError::Decode)?;

        let collaborators = &self.context.collaborators;
        let parsed = collaborators
            .parser
            .parse(&task.path, &content, &task.language)?;

        let mut entities = parsed.entities;
        let mut relations = parsed.relations;

        if let Some(llm) = &collaborators.llm {
            for chunk in &parsed.chunks {
                if !self.context.limiter.acquire(cancel).await {
                    return Err(ExtractError::Cancelled);
                }
                let request = ExtractionRequest {
                    path: &task.path,
                    language: &task.language,
                    content: &chunk.content,
                };
                let extraction = until_cancelled(cancel, llm.extract(request, cancel)).await?;
                entities.extend(extraction.entities);
                relations.extend(extraction.relations);
            }
        }

        let mut mutation = FileMutation::new(&task.path, hash, task.kind);
        mutation.entities = merge_entities(entities, &relations);
        mutation.relations = merge_relations(relations);

        let mut chunk_vectors = Vec::new();
        if let Some(embeddings) = &collaborators.embeddings {
            let mut texts: Vec<String> = parsed.chunks.iter().map(|c| c.content.clone()).collect();
            texts.extend(
                mutation
                    .entities
                    .iter()
                    .map(|e| embedding_text(&e.name, &e.description)),
            );

            if !texts.is_empty() {
                if !self.context.limiter.acquire(cancel).await {
                    return Err(ExtractError::Cancelled);
                }
                let mut vectors = until_cancelled(cancel, embeddings.embed(&texts, cancel)).await?;
                validate_batch(texts.len(), &vectors, embeddings.dimension())?;

                let entity_vectors = vectors.split_off(parsed.chunks.len());
                for (entity, vector) in mutation.entities.iter_mut().zip(entity_vectors) {
                    entity.embedding = Some(vector);
                }
                chunk_vectors = vectors;
            }
        }

        let mut chunk_vectors = chunk_vectors.into_iter();
        mutation.chunks = parsed
            .chunks
            .into_iter()
            .map(|chunk| ChunkRecord::from_chunk(&task.path, chunk, chunk_vectors.next()))
            .collect();

        debug!(
            path = %task.path,
            entities = mutation.entities.len(),
            relations = mutation.relations.len(),
            chunks = mutation.chunks.len(),
            "Extracted file"
        );
        Ok(mutation)
    }
}

/// Collapse drafts sharing a name and add missing relation endpoints.
///
/// The first draft's type wins; descriptions are joined in order.
fn merge_entities(drafts: Vec<DraftEntity>, relations: &[DraftRelation]) -> Vec<EntityContribution> {
    let mut order: Vec<String> = Vec::new();
    let mut by_name: BTreeMap<String, (String, Vec<String>)> = BTreeMap::new();

    for draft in drafts {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        match by_name.get_mut(&name) {
            Some((_, descriptions)) => descriptions.push(draft.description),
            None => {
                order.push(name.clone());
                by_name.insert(name, (draft.entity_type, vec![draft.description]));
            }
        }
    }

    for relation in relations {
        for endpoint in [relation.source.trim(), relation.target.trim()] {
            if !endpoint.is_empty() && !by_name.contains_key(endpoint) {
                order.push(endpoint.to_string());
                by_name.insert(
                    endpoint.to_string(),
                    (UNKNOWN_ENTITY_TYPE.to_string(), Vec::new()),
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let (entity_type, descriptions) = by_name.remove(&name)?;
            let description = join_descriptions(descriptions.iter().map(String::as_str));
            Some(EntityContribution::new(name, entity_type, description))
        })
        .collect()
}

/// Collapse relations sharing endpoints and drop self-loops.
fn merge_relations(drafts: Vec<DraftRelation>) -> Vec<RelationContribution> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut by_pair: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();

    for draft in drafts {
        let key = (draft.source.trim().to_string(), draft.target.trim().to_string());
        if key.0.is_empty() || key.1.is_empty() || key.0 == key.1 {
            continue;
        }
        by_pair
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(draft.description);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let descriptions = by_pair.remove(&key)?;
            let description = join_descriptions(descriptions.iter().map(String::as_str));
            Some(RelationContribution::new(key.0, key.1, description))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_entities_dedupes_and_fills_endpoints() {
        let drafts = vec![
            DraftEntity::new("UserService", "class", "Handles users."),
            DraftEntity::new("UserService", "function", "Handles users."),
            DraftEntity::new(" UserService ", "class", "Stores sessions."),
            DraftEntity::new("", "class", "ignored"),
        ];
        let relations = vec![DraftRelation::new("UserService", "Database", "reads from")];

        let merged = merge_entities(drafts, &relations);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "UserService");
        assert_eq!(merged[0].entity_type, "class");
        assert_eq!(merged[0].description, "Handles users.\nStores sessions.");
        assert_eq!(merged[1].name, "Database");
        assert_eq!(merged[1].entity_type, UNKNOWN_ENTITY_TYPE);
    }

    #[test]
    fn test_merge_relations_drops_self_loops_and_joins() {
        let merged = merge_relations(vec![
            DraftRelation::new("a", "b", "calls"),
            DraftRelation::new("a", "a", "recurses"),
            DraftRelation::new("a", "b", "imports"),
            DraftRelation::new("b", "a", "calls"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].description, "calls\nimports");
        assert_eq!((merged[1].source.as_str(), merged[1].target.as_str()), ("b", "a"));
    }
}
