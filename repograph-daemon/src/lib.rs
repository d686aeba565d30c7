//! repograph - incremental knowledge-graph builds over code and documents.
//!
//! This library provides:
//! - Build pipeline (diff, parallel extraction, sequential commits)
//! - Storage layer (DuckDB-based graph and vector store, JSON manifest)
//! - Entity merge engine for documented and implemented concepts
//! - Collaborator traits and OpenAI-compatible clients

pub mod build;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod merge;
pub mod providers;
pub mod storage;
