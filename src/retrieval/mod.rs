//! Retrieval orchestration: query expansion, vector search, reranking, and
//! top-K selection.
//!
//! Each stage degrades independently. A failed expansion leaves the original
//! query as the only variant; a failed search for one variant contributes
//! zero candidates; a failed rerank keeps similarity order. Only two
//! failures reach the caller: the original query cannot be embedded at all,
//! or no variant produced a usable candidate — and the latter surfaces as
//! the domain outcome [`RetrievalError::NoRelevantContent`], never as a raw
//! provider error.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::expansion::QueryExpander;
use crate::providers::EmbeddingProvider;
use crate::rerank::Reranker;
use crate::stores::{ChunkStore, SimilarityQuery, SourceCategory};
use crate::types::{RetrievalError, RetrievedChunk};

#[derive(Clone, Copy, Debug)]
pub struct RetrieveOptions {
    /// How many passages the caller receives.
    pub top_k: usize,
    /// Similarity floor forwarded to the vector search.
    pub min_similarity: Option<f32>,
    /// Restrict retrieval to one origin kind.
    pub category: Option<SourceCategory>,
    /// Candidates requested per query variant, deliberately above `top_k`
    /// to give reranking and de-duplication something to work with.
    pub candidates_per_variant: usize,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: None,
            category: None,
            candidates_per_variant: 15,
        }
    }
}

pub struct Retriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    expander: QueryExpander,
    reranker: Reranker,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        expander: QueryExpander,
        reranker: Reranker,
    ) -> Self {
        Self {
            store,
            embedder,
            expander,
            reranker,
        }
    }

    /// Returns the `top_k` most relevant passages for `query`, each with the
    /// similarity score that surfaced it and, when reranking ran, its rerank
    /// score.
    pub async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let variants = self.expander.expand(query).await;
        debug!(query = %query, variants = variants.len(), "retrieval started");

        let mut merged: Vec<RetrievedChunk> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut any_search_succeeded = false;

        for (position, variant) in variants.iter().enumerate() {
            let embedding = match self.embedder.embed(variant).await {
                Ok(vector) => vector,
                Err(err) if position == 0 => {
                    // The original query has no fallback.
                    return Err(RetrievalError::QueryEmbedding(err));
                }
                Err(err) => {
                    warn!(variant = %variant, error = %err,
                          "variant embedding failed; variant skipped");
                    continue;
                }
            };

            let search = SimilarityQuery {
                embedding,
                limit: options.candidates_per_variant,
                min_similarity: options.min_similarity,
                category: options.category,
            };
            match self.store.search_similar(&search).await {
                Ok(rows) => {
                    any_search_succeeded = true;
                    for (record, similarity) in rows {
                        // First occurrence wins: expanded variants broaden
                        // recall, they do not re-score.
                        if seen.insert(record.id.clone()) {
                            merged.push(RetrievedChunk {
                                chunk: record,
                                similarity,
                                rerank_score: None,
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(variant = %variant, error = %err,
                          "vector search failed for variant");
                }
            }
        }

        if !any_search_succeeded || merged.is_empty() {
            return Err(RetrievalError::NoRelevantContent);
        }

        let mut ranked = self.reranker.rerank(query, merged).await;
        ranked.truncate(options.top_k);
        Ok(ranked)
    }
}
