//! Document/code entity merge pass.

use repograph_core::{normalize_name, ExclusionRules, RuleError};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::similarity::{Cosine, Similarity};
use crate::build::{RateLimiter, RetryPolicy, TaskState};
use crate::config::{BuildConfig, RateLimitSection};
use crate::error::ExtractError;
use crate::embeddings::{validate_batch, EmbeddingClient, EmbeddingError};
use crate::storage::{EntityRecord, GraphStore, MergeOutcome, Origin, StoreError};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Rules(#[from] RuleError),

    #[error("merge cancelled after {merged} merge(s)")]
    Cancelled { merged: usize },

    #[error("merge task failed: {0}")]
    Internal(String),
}

/// A scored document/code pair at or above the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidatePair {
    pub document_id: String,
    pub code_id: String,
    pub score: f32,
}

/// A consolidation that was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPair {
    /// Surviving document entity
    pub survivor: String,
    /// Code entity folded into the survivor
    pub superseded: String,
    pub score: f32,
    pub outcome: MergeOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub document_candidates: usize,
    pub code_candidates: usize,
    /// Candidates dropped by the exclusion rules
    pub excluded: usize,
    /// Candidates without a usable vector
    pub unembedded: usize,
    /// Vectors computed and persisted during this pass
    pub embedded: usize,
    /// Pairs at or above the threshold, before greedy selection
    pub pairs_above_threshold: usize,
    pub merged: Vec<MergedPair>,
}

/// Texts per embedding request when backfilling candidate vectors.
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 64;

/// Why a backfill request gave up.
enum EmbedFailure {
    /// The texts stay unembedded; the pass continues.
    Skip(String),
    /// The pass cannot continue.
    Abort(MergeError),
}

/// Consolidates document entities with the code entities they describe.
pub struct MergeEngine {
    rules: ExclusionRules,
    threshold: f32,
    similarity: Box<dyn Similarity>,
    embeddings: Option<Arc<dyn EmbeddingClient>>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    batch_size: usize,
}

impl MergeEngine {
    pub fn new(rules: ExclusionRules, threshold: f32) -> Self {
        let defaults = RateLimitSection::default();
        Self {
            rules,
            threshold,
            similarity: Box::new(Cosine),
            embeddings: None,
            retry: RetryPolicy::new(defaults.max_attempts, Duration::from_millis(defaults.backoff_ms)),
            limiter: RateLimiter::new(Duration::from_millis(defaults.min_interval_ms)),
            batch_size: DEFAULT_EMBED_BATCH_SIZE,
        }
    }

    pub fn from_config(config: &BuildConfig) -> Result<Self, RuleError> {
        Ok(Self::new(config.exclusion_rules()?, config.merge.threshold)
            .with_retry(
                RetryPolicy::new(config.rate_limit.max_attempts, config.backoff()),
                config.min_interval(),
            )
            .with_batch_size(config.merge.embed_batch_size))
    }

    /// Retry bounds and minimum call spacing for embedding backfill.
    pub fn with_retry(mut self, retry: RetryPolicy, min_interval: Duration) -> Self {
        self.retry = retry;
        self.limiter = RateLimiter::new(min_interval);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Client used to embed candidates that have no stored vector.
    pub fn with_embeddings(mut self, embeddings: Arc<dyn EmbeddingClient>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn with_similarity(mut self, similarity: impl Similarity + 'static) -> Self {
        self.similarity = Box::new(similarity);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Run one merge pass.
    ///
    /// With `scope`, only the listed code entities are candidates.
    pub async fn run(
        &self,
        store: Arc<dyn GraphStore>,
        scope: Option<&BTreeSet<String>>,
        cancel: &CancellationToken,
    ) -> Result<MergeReport, MergeError> {
        let mut report = MergeReport::default();

        let all = blocking(store.clone(), |s| s.entities()).await?;
        let mut documents = Vec::new();
        let mut code = Vec::new();
        for entity in all {
            match entity.origin() {
                Some(Origin::Document) => documents.push(entity),
                Some(Origin::Code) if scope.map_or(true, |s| s.contains(&entity.id)) => code.push(entity),
                _ => {}
            }
        }
        report.document_candidates = documents.len();
        report.code_candidates = code.len();

        if documents.is_empty() || code.is_empty() {
            debug!(
                documents = documents.len(),
                code = code.len(),
                "Nothing to merge"
            );
            return Ok(report);
        }

        let before = documents.len() + code.len();
        documents.retain(|e| !self.is_excluded(e));
        code.retain(|e| !self.is_excluded(e));
        report.excluded = before - documents.len() - code.len();

        report.embedded = self
            .ensure_embeddings(&store, &mut documents, &mut code, cancel)
            .await?;
        let before = documents.len() + code.len();
        documents.retain(|e| e.embedding.is_some());
        code.retain(|e| e.embedding.is_some());
        report.unembedded = before - documents.len() - code.len();

        let pairs = self.score_pairs(&documents, &code);
        report.pairs_above_threshold = pairs.len();

        for pair in select_disjoint(pairs) {
            if cancel.is_cancelled() {
                return Err(MergeError::Cancelled {
                    merged: report.merged.len(),
                });
            }
            let survivor = pair.document_id.clone();
            let superseded = pair.code_id.clone();
            let outcome = blocking(store.clone(), move |s| s.merge_entities(&survivor, &superseded)).await?;
            info!(
                survivor = %pair.document_id,
                superseded = %pair.code_id,
                score = pair.score,
                "Merged entities"
            );
            report.merged.push(MergedPair {
                survivor: pair.document_id,
                superseded: pair.code_id,
                score: pair.score,
                outcome,
            });
        }

        info!(
            documents = report.document_candidates,
            code = report.code_candidates,
            excluded = report.excluded,
            merged = report.merged.len(),
            similarity = self.similarity.name(),
            "Merge pass complete"
        );
        Ok(report)
    }

    fn is_excluded(&self, entity: &EntityRecord) -> bool {
        match self.rules.exclusion_reason(&entity.name) {
            Some(reason) => {
                debug!(
                    entity = %entity.id,
                    normalized = %normalize_name(&entity.name),
                    reason = reason.as_str(),
                    "Excluded from merge"
                );
                true
            }
            None => false,
        }
    }

    /// Embed candidates lacking a vector and persist the result.
    ///
    /// Requests go out in batches through the rate limiter, with transient
    /// failures retried. A batch the provider rejects is retried one text at
    /// a time; texts that still fail stay unembedded.
    async fn ensure_embeddings(
        &self,
        store: &Arc<dyn GraphStore>,
        documents: &mut [EntityRecord],
        code: &mut [EntityRecord],
        cancel: &CancellationToken,
    ) -> Result<usize, MergeError> {
        let Some(client) = &self.embeddings else {
            return Ok(0);
        };

        let mut missing: Vec<&mut EntityRecord> = documents
            .iter_mut()
            .chain(code.iter_mut())
            .filter(|e| e.embedding.is_none())
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let mut updates = Vec::new();
        for batch in missing.chunks_mut(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|e| e.embedding_text()).collect();
            let vectors: Vec<Option<Vec<f32>>> = match self.embed_with_retry(client.as_ref(), &texts, cancel).await {
                Ok(vectors) => vectors.into_iter().map(Some).collect(),
                Err(EmbedFailure::Abort(e)) => return Err(e),
                Err(EmbedFailure::Skip(reason)) if texts.len() > 1 => {
                    warn!(batch = texts.len(), "Embedding batch failed, retrying texts one by one: {}", reason);
                    let mut single = Vec::with_capacity(texts.len());
                    for text in &texts {
                        match self
                            .embed_with_retry(client.as_ref(), std::slice::from_ref(text), cancel)
                            .await
                        {
                            Ok(mut vectors) => single.push(vectors.pop()),
                            Err(EmbedFailure::Abort(e)) => return Err(e),
                            Err(EmbedFailure::Skip(reason)) => {
                                debug!("Leaving candidate unembedded: {}", reason);
                                single.push(None);
                            }
                        }
                    }
                    single
                }
                Err(EmbedFailure::Skip(reason)) => {
                    warn!("Leaving candidate unembedded: {}", reason);
                    vec![None]
                }
            };

            for (entity, vector) in batch.iter_mut().zip(vectors) {
                if let Some(vector) = vector {
                    updates.push((entity.id.clone(), vector.clone()));
                    entity.embedding = Some(vector);
                }
            }
        }

        let count = updates.len();
        if count > 0 {
            blocking(store.clone(), move |s| {
                for (id, vector) in &updates {
                    s.set_entity_embedding(id, vector)?;
                }
                Ok(())
            })
            .await?;
        }

        debug!(count, "Persisted merge candidate embeddings");
        Ok(count)
    }

    /// One embedding request, driven through the retry state machine.
    async fn embed_with_retry(
        &self,
        client: &dyn EmbeddingClient,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbedFailure> {
        let cancelled = || EmbedFailure::Abort(MergeError::Cancelled { merged: 0 });
        let mut state = TaskState::Pending;
        loop {
            state = state.start();
            if !self.limiter.acquire(cancel).await {
                return Err(cancelled());
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                res = client.embed(texts, cancel) => res,
            };
            let error = match result.and_then(|vectors| {
                validate_batch(texts.len(), &vectors, client.dimension())?;
                Ok(vectors)
            }) {
                Ok(vectors) => return Ok(vectors),
                Err(EmbeddingError::Cancelled) => return Err(cancelled()),
                Err(e @ EmbeddingError::Auth(_)) => return Err(EmbedFailure::Abort(e.into())),
                Err(e) => e,
            };

            let (next, exhausted) = state.on_error(&ExtractError::from(error.clone()), &self.retry);
            let TaskState::Backoff { attempt, delay } = next else {
                return Err(EmbedFailure::Skip(
                    exhausted.map_or_else(|| error.to_string(), |e| e.to_string()),
                ));
            };
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying embedding request after {}",
                error
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            state = next;
        }
    }

    fn score_pairs(&self, documents: &[EntityRecord], code: &[EntityRecord]) -> Vec<MergeCandidatePair> {
        let mut pairs = Vec::new();
        for doc in documents {
            let Some(doc_vec) = &doc.embedding else { continue };
            for entity in code {
                let Some(code_vec) = &entity.embedding else { continue };
                if doc_vec.len() != code_vec.len() {
                    continue;
                }
                let score = self.similarity.score(doc_vec, code_vec);
                if score >= self.threshold {
                    pairs.push(MergeCandidatePair {
                        document_id: doc.id.clone(),
                        code_id: entity.id.clone(),
                        score,
                    });
                }
            }
        }
        pairs
    }
}

/// Greedy one-to-one selection: best score first, ties by ids.
pub fn select_disjoint(mut pairs: Vec<MergeCandidatePair>) -> Vec<MergeCandidatePair> {
    pairs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.code_id.cmp(&b.code_id))
    });

    let mut used: HashSet<String> = HashSet::new();
    let mut selected = Vec::new();
    for pair in pairs {
        if used.contains(&pair.document_id) || used.contains(&pair.code_id) {
            continue;
        }
        used.insert(pair.document_id.clone());
        used.insert(pair.code_id.clone());
        selected.push(pair);
    }
    selected
}

/// Run a store call off the async runtime.
async fn blocking<T, F>(store: Arc<dyn GraphStore>, f: F) -> Result<T, MergeError>
where
    T: Send + 'static,
    F: FnOnce(&dyn GraphStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| MergeError::Internal(e.to_string()))?
        .map_err(MergeError::from)
}

/// Group a report's merges by survivor, for display.
pub fn merges_by_survivor(report: &MergeReport) -> BTreeMap<&str, Vec<&str>> {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for merged in &report.merged {
        grouped
            .entry(merged.survivor.as_str())
            .or_default()
            .push(merged.superseded.as_str());
    }
    grouped
}
