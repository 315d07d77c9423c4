//! Chunk model and storage backends for vector search.
//!
//! [`ChunkStore`] is the persistence seam of the pipeline: the indexer
//! writes through it with parent-scoped delete-then-insert semantics, and
//! the retriever reads through its similarity search. The only shipped
//! backend is [`sqlite::SqliteChunkStore`] (SQLite with `sqlite-vec`);
//! anything satisfying the trait can stand in for it.

pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::StorageError;

pub use sqlite::SqliteChunkStore;

/// Origin kind of a chunk, used both for retrieval filtering and priority
/// weighting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    /// Curated long-form document text.
    Document,
    /// The question half of an approved Q&A pair.
    QaQuestion,
    /// The answer half of an approved Q&A pair.
    QaAnswer,
    /// A standalone image caption standing in for non-text content.
    ImageCaption,
}

impl SourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceCategory::Document => "document",
            SourceCategory::QaQuestion => "qa_question",
            SourceCategory::QaAnswer => "qa_answer",
            SourceCategory::ImageCaption => "image_caption",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "document" => Some(SourceCategory::Document),
            "qa_question" => Some(SourceCategory::QaQuestion),
            "qa_answer" => Some(SourceCategory::QaAnswer),
            "image_caption" => Some(SourceCategory::ImageCaption),
            _ => None,
        }
    }

    /// Tie-break/boost rank: curated sources outrank ad hoc Q&A-derived
    /// ones.
    pub fn priority(&self) -> i64 {
        match self {
            SourceCategory::Document => 100,
            SourceCategory::ImageCaption => 80,
            SourceCategory::QaAnswer => 60,
            SourceCategory::QaQuestion => 50,
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic retrievable unit: one chunk of text (or image caption) with
/// its embedding and provenance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    /// Human-readable origin name (document or question title).
    pub source_label: String,
    pub source_category: SourceCategory,
    /// 0-based position within the parent unit.
    pub sequence_index: usize,
    /// Total chunk count within the parent unit.
    pub sequence_total: usize,
    pub content: String,
    /// Present on the write path; not rehydrated on reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Which embedding function produced the vector. Vectors from different
    /// model ids must never be compared.
    pub embedding_model: String,
    pub priority: i64,
    /// Source image when the content is a caption.
    pub image_ref: Option<String>,
    /// Originating content item or QA pair; the unit of re-indexing.
    pub parent_ref: Option<String>,
    /// Open provenance bag (parent Q&A ids, generation model, ...).
    pub metadata: serde_json::Value,
}

impl ChunkRecord {
    /// Builds a record with a fresh id and the category's default priority.
    pub fn new(
        id: impl Into<String>,
        source_label: impl Into<String>,
        source_category: SourceCategory,
        sequence_index: usize,
        sequence_total: usize,
        content: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_label: source_label.into(),
            source_category,
            sequence_index,
            sequence_total,
            content: content.into(),
            embedding: None,
            embedding_model: embedding_model.into(),
            priority: source_category.priority(),
            image_ref: None,
            parent_ref: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// Same as [`ChunkRecord::new`] with a generated UUID id.
    pub fn with_generated_id(
        source_label: impl Into<String>,
        source_category: SourceCategory,
        sequence_index: usize,
        sequence_total: usize,
        content: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            source_label,
            source_category,
            sequence_index,
            sequence_total,
            content,
            embedding_model,
        )
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_parent_ref(mut self, parent_ref: impl Into<String>) -> Self {
        self.parent_ref = Some(parent_ref.into());
        self
    }

    #[must_use]
    pub fn with_image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A similarity search against the chunk store.
#[derive(Clone, Debug)]
pub struct SimilarityQuery {
    pub embedding: Vec<f32>,
    pub limit: usize,
    /// Rows under this similarity are filtered out when set.
    pub min_similarity: Option<f32>,
    /// Restricts the search to one origin kind when set.
    pub category: Option<SourceCategory>,
}

/// Unified interface over chunk persistence backends.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Inserts chunk records. Every record must carry a non-empty content
    /// and an embedding of the configured dimensionality; violations fail
    /// the whole batch before anything is written.
    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<usize, StorageError>;

    /// Atomically deletes every chunk matching `(parent_ref, categories)`
    /// and inserts `chunks` in its place. Readers never observe a partial
    /// mix of stale and fresh rows.
    async fn replace_chunks(
        &self,
        parent_ref: &str,
        categories: &[SourceCategory],
        chunks: Vec<ChunkRecord>,
    ) -> Result<usize, StorageError>;

    /// Deletes chunks by parent and category; returns how many went away.
    async fn delete_chunks_by_parent(
        &self,
        parent_ref: &str,
        categories: &[SourceCategory],
    ) -> Result<usize, StorageError>;

    /// All chunks for a parent, ordered by category then sequence index.
    async fn get_chunks_by_parent(&self, parent_ref: &str)
    -> Result<Vec<ChunkRecord>, StorageError>;

    async fn get_chunk_by_id(&self, id: &str) -> Result<Option<ChunkRecord>, StorageError>;

    /// Rows ordered by similarity descending, bounded by `query.limit`.
    async fn search_similar(
        &self,
        query: &SimilarityQuery,
    ) -> Result<Vec<(ChunkRecord, f32)>, StorageError>;

    async fn count(&self) -> Result<usize, StorageError>;
}
