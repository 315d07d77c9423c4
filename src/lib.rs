//! Knowledge retrieval pipeline for help-desk answer grounding.
//!
//! ```text
//! Content item / QA pair ──► indexing::Indexer ─┬─► chunking::chunk
//!                                               ├─► providers (captions, embeddings)
//!                                               └─► stores::ChunkStore (delete-then-insert)
//!
//! User question ──► retrieval::Retriever ─┬─► expansion::QueryExpander
//!                                         ├─► stores::ChunkStore::search_similar
//!                                         ├─► rerank::Reranker
//!                                         └─► ranked passages + provenance
//! ```
//!
//! Every remote call is an awaited, timeout-bounded network request; the
//! non-essential stages (expansion, reranking) degrade silently to simpler
//! behavior instead of failing a request, and indexing isolates failures to
//! the single chunk they affect.

pub mod chunking;
pub mod expansion;
pub mod indexing;
pub mod providers;
pub mod ratelimit;
pub mod rerank;
pub mod retrieval;
pub mod stores;
pub mod types;

pub use chunking::{ChunkOptions, chunk};
pub use expansion::{ExpanderOptions, QueryExpander};
pub use indexing::{ContentItem, Indexer, QaAnswer, QaQuestion};
pub use providers::{
    EmbeddingProvider, GenerationRequest, ProviderConfig, TextGenerator, VisionCaptioner,
};
pub use ratelimit::FixedWindowLimiter;
pub use rerank::{RerankOptions, Reranker};
pub use retrieval::{RetrieveOptions, Retriever};
pub use stores::{ChunkRecord, ChunkStore, SimilarityQuery, SourceCategory, SqliteChunkStore};
pub use types::{
    EMBEDDING_DIMENSIONS, IndexError, ProviderError, RetrievalError, RetrievedChunk, StorageError,
};
