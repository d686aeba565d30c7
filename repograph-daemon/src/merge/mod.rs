//! Entity merge engine.
//!
//! After ingestion, entities that only documents mention are paired with
//! entities that only code defines. Pairs whose vectors score at or above the
//! threshold are consolidated: the document entity survives and the code
//! entity's id becomes an alias of it.

mod engine;
mod similarity;

pub use engine::{
    merges_by_survivor, select_disjoint, MergeCandidatePair, MergeEngine, MergeError, MergeReport,
    MergedPair,
};
pub use similarity::{cosine_similarity, Cosine, Similarity};
