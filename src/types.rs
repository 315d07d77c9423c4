//! Shared types and the error taxonomy for the retrieval pipeline.
//!
//! Errors are scoped to the layer that produces them: [`ProviderError`] for
//! remote calls, [`StorageError`] for the chunk store, [`IndexError`] and
//! [`RetrievalError`] for the two orchestration entry points. Failures inside
//! quality-enhancement steps (query expansion, reranking) never surface here
//! at all; those components degrade internally and only log.

use thiserror::Error;

use crate::stores::ChunkRecord;

/// Fixed output dimensionality for every embedding in the system.
///
/// All stored vectors and every query vector must have exactly this length;
/// mixing dimensionalities silently invalidates similarity math, so both the
/// provider client and the store reject mismatches.
pub const EMBEDDING_DIMENSIONS: usize = 768;

/// A remote provider call failed.
///
/// Providers carry no retry logic; callers decide per unit of work whether a
/// failure is fatal (a retrieval query) or skippable (a single chunk).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success HTTP status.
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never produced a usable response (connect, TLS, timeout).
    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body did not match the expected schema.
    #[error("malformed provider response: {0}")]
    Schema(String),

    /// A provider endpoint URL could not be constructed from the config.
    #[error("invalid provider endpoint: {0}")]
    Endpoint(String),

    /// The embedding provider returned a vector of the wrong length.
    #[error("embedding dimensionality mismatch: expected {expected}, got {actual}")]
    Dimensions { expected: usize, actual: usize },
}

/// A chunk store operation failed.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying database reported an error.
    #[error("storage failure: {0}")]
    Backend(String),

    /// A chunk was submitted for persistence without an embedding.
    #[error("chunk {id} has no embedding")]
    MissingEmbedding { id: String },

    /// A chunk was submitted with empty content.
    #[error("chunk {id} has empty content")]
    EmptyContent { id: String },

    /// A vector of the wrong length reached the insert boundary.
    #[error("embedding dimensionality mismatch at insert: expected {expected}, got {actual}")]
    Dimensions { expected: usize, actual: usize },
}

/// An indexing run failed as a whole.
///
/// Per-chunk embedding failures are not represented here; the indexer skips
/// and logs those, reporting success for the chunks that made it through.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The indexer was configured with unusable chunking options.
    #[error("invalid chunking options: {0}")]
    InvalidOptions(#[from] crate::chunking::ChunkingError),
}

/// A retrieval attempt failed.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// No variant search produced a usable candidate. This is a domain
    /// outcome distinct from a provider outage: the caller should render a
    /// "couldn't find relevant material" message rather than an error.
    #[error("no relevant content found")]
    NoRelevantContent,

    /// Embedding the original query failed; there is no fallback for this
    /// single unit of work, so the attempt itself fails.
    #[error("failed to embed query: {0}")]
    QueryEmbedding(#[source] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One retrieved passage plus its provenance scores.
///
/// Transient: built per retrieval request, consumed by the downstream answer
/// generation step, never persisted.
#[derive(Clone, Debug)]
pub struct RetrievedChunk {
    pub chunk: ChunkRecord,
    /// Cosine similarity from the vector search that first surfaced this
    /// chunk. Expanded variants only broaden recall; they do not re-score.
    pub similarity: f32,
    /// Relevance score from the reranker, when reranking ran.
    pub rerank_score: Option<f32>,
}

/// Cosine similarity between two vectors of equal length.
///
/// Returns 0.0 for mismatched lengths or zero-magnitude inputs rather than
/// propagating an error; callers treat that as "not similar".
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![0.5, -0.25, 1.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
