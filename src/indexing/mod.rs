//! Indexing: turning content items and approved Q&A pairs into persisted,
//! searchable chunks.
//!
//! Re-indexing is idempotent by construction: every write replaces the full
//! chunk set for its `(parent, categories)` scope inside one store
//! transaction, and concurrent runs for the same parent are serialized by an
//! in-process advisory lock. Embedding failures are isolated per chunk; a
//! bad chunk is skipped and logged while the rest of the run proceeds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chunking::{ChunkOptions, chunk};
use crate::providers::{EmbeddingProvider, VisionCaptioner};
use crate::stores::{ChunkRecord, ChunkStore, SourceCategory};
use crate::types::IndexError;

/// A published long-form content item to index.
#[derive(Clone, Debug)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    pub body: String,
    /// Image URLs referenced by the content, in display order.
    pub images: Vec<String>,
}

/// The question half of an approved Q&A pair.
#[derive(Clone, Debug)]
pub struct QaQuestion {
    pub id: String,
    pub title: String,
    pub body: String,
    pub image_url: Option<String>,
}

/// The answer half of an approved Q&A pair.
#[derive(Clone, Debug)]
pub struct QaAnswer {
    pub id: String,
    pub body: String,
    pub image_url: Option<String>,
}

const CONTENT_CAPTION_HINT: &str =
    "Describe this image so the description can stand in for it in a knowledge article.";
const QA_CAPTION_HINT: &str =
    "Describe this image attached to a help-desk question or answer in one short paragraph.";

/// Serializes re-index runs per parent id.
///
/// Entries live for the process lifetime; the registry is bounded by the
/// number of distinct parents this process indexes.
#[derive(Clone, Default)]
struct ParentLocks {
    inner: Arc<parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ParentLocks {
    fn for_parent(&self, parent: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut registry = self.inner.lock();
        registry
            .entry(parent.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

pub struct Indexer {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    captioner: Arc<dyn VisionCaptioner>,
    options: ChunkOptions,
    locks: ParentLocks,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        captioner: Arc<dyn VisionCaptioner>,
    ) -> Result<Self, IndexError> {
        Self::with_options(store, embedder, captioner, ChunkOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        captioner: Arc<dyn VisionCaptioner>,
        options: ChunkOptions,
    ) -> Result<Self, IndexError> {
        options.validate()?;
        Ok(Self {
            store,
            embedder,
            captioner,
            options,
            locks: ParentLocks::default(),
        })
    }

    /// Indexes a content item, replacing any chunks from a previous run.
    ///
    /// Image captions are folded inline into the narrative before chunking
    /// and additionally stored as standalone caption chunks carrying their
    /// `image_ref`. Returns the number of chunks persisted.
    pub async fn index_content(&self, item: &ContentItem) -> Result<usize, IndexError> {
        let lock = self.locks.for_parent(&item.id);
        let _guard = lock.lock().await;

        let mut captions: Vec<(String, String)> = Vec::new();
        for image_url in &item.images {
            match self
                .captioner
                .caption(image_url, Some(CONTENT_CAPTION_HINT))
                .await
            {
                Ok(text) => captions.push((image_url.clone(), text)),
                Err(err) => {
                    warn!(parent = %item.id, image = %image_url, error = %err,
                          "image caption failed; image skipped");
                }
            }
        }

        let mut stream = String::new();
        stream.push_str(item.title.trim());
        stream.push_str("\n\n");
        stream.push_str(item.body.trim());
        for (_, caption) in &captions {
            stream.push_str(&format!("\n\n[Image: {caption}]"));
        }

        let pieces = chunk(&stream, &self.options);
        let total = pieces.len();
        let mut records = Vec::with_capacity(total + captions.len());
        let metadata = serde_json::json!({ "content_id": item.id });

        for (index, piece) in pieces.into_iter().enumerate() {
            match self.embedder.embed(&piece).await {
                Ok(vector) => records.push(
                    ChunkRecord::with_generated_id(
                        &item.title,
                        SourceCategory::Document,
                        index,
                        total,
                        piece,
                        self.embedder.model_id(),
                    )
                    .with_parent_ref(&item.id)
                    .with_metadata(metadata.clone())
                    .with_embedding(vector),
                ),
                Err(err) => {
                    warn!(parent = %item.id, chunk = index, error = %err,
                          "chunk embedding failed; chunk skipped");
                }
            }
        }

        for (image_index, (image_url, caption)) in captions.into_iter().enumerate() {
            match self.embedder.embed(&caption).await {
                Ok(vector) => records.push(
                    ChunkRecord::with_generated_id(
                        &item.title,
                        SourceCategory::ImageCaption,
                        image_index,
                        1,
                        caption,
                        self.embedder.model_id(),
                    )
                    .with_parent_ref(&item.id)
                    .with_image_ref(image_url)
                    .with_metadata(metadata.clone())
                    .with_embedding(vector),
                ),
                Err(err) => {
                    warn!(parent = %item.id, image = %image_url, error = %err,
                          "caption embedding failed; caption chunk skipped");
                }
            }
        }

        let inserted = self
            .store
            .replace_chunks(
                &item.id,
                &[SourceCategory::Document, SourceCategory::ImageCaption],
                records,
            )
            .await?;
        info!(parent = %item.id, chunks = inserted, "content indexed");
        Ok(inserted)
    }

    /// Indexes both halves of an approved Q&A pair.
    ///
    /// Never propagates an error: this is invoked fire-and-forget from an
    /// approval workflow that must not be blocked or failed by indexing
    /// trouble. Failures are logged instead.
    pub async fn index_qa_pair(&self, question: &QaQuestion, answer: &QaAnswer) {
        if let Err(err) = self.try_index_qa_pair(question, answer).await {
            error!(question = %question.id, answer = %answer.id, error = %err,
                   "qa pair indexing failed");
        }
    }

    /// Spawns [`Indexer::index_qa_pair`] onto the runtime so the approval
    /// workflow can continue immediately. Failures surface through the logs.
    pub fn spawn_qa_index(
        self: &Arc<Self>,
        question: QaQuestion,
        answer: QaAnswer,
    ) -> JoinHandle<()> {
        let indexer = Arc::clone(self);
        tokio::spawn(async move { indexer.index_qa_pair(&question, &answer).await })
    }

    async fn try_index_qa_pair(
        &self,
        question: &QaQuestion,
        answer: &QaAnswer,
    ) -> Result<(), IndexError> {
        let lock = self.locks.for_parent(&question.id);
        let _guard = lock.lock().await;

        let question_stream = self
            .qa_stream(
                &question.id,
                Some(question.title.as_str()),
                &question.body,
                question.image_url.as_deref(),
            )
            .await;
        let answer_stream = self
            .qa_stream(&question.id, None, &answer.body, answer.image_url.as_deref())
            .await;

        let metadata = serde_json::json!({
            "question_id": question.id,
            "answer_id": answer.id,
        });

        let mut records = Vec::new();
        self.collect_half(
            &mut records,
            &question_stream,
            SourceCategory::QaQuestion,
            question,
            &metadata,
        )
        .await;
        self.collect_half(
            &mut records,
            &answer_stream,
            SourceCategory::QaAnswer,
            question,
            &metadata,
        )
        .await;

        let inserted = self
            .store
            .replace_chunks(
                &question.id,
                &[SourceCategory::QaQuestion, SourceCategory::QaAnswer],
                records,
            )
            .await?;
        info!(question = %question.id, answer = %answer.id, chunks = inserted,
              "qa pair indexed");
        Ok(())
    }

    /// Builds the text stream for one QA half: title (question side only),
    /// body, and at most one image caption appended as a bracketed
    /// annotation.
    async fn qa_stream(
        &self,
        parent_id: &str,
        title: Option<&str>,
        body: &str,
        image_url: Option<&str>,
    ) -> String {
        let mut stream = String::new();
        if let Some(title) = title {
            stream.push_str(title.trim());
            stream.push_str("\n\n");
        }
        stream.push_str(body.trim());
        if let Some(image_url) = image_url {
            match self.captioner.caption(image_url, Some(QA_CAPTION_HINT)).await {
                Ok(caption) => stream.push_str(&format!("\n\n[Image: {caption}]")),
                Err(err) => {
                    warn!(parent = %parent_id, image = %image_url, error = %err,
                          "qa image caption failed; annotation skipped");
                }
            }
        }
        stream
    }

    async fn collect_half(
        &self,
        records: &mut Vec<ChunkRecord>,
        stream: &str,
        category: SourceCategory,
        question: &QaQuestion,
        metadata: &serde_json::Value,
    ) {
        let pieces = chunk(stream, &self.options);
        let total = pieces.len();
        for (index, piece) in pieces.into_iter().enumerate() {
            match self.embedder.embed(&piece).await {
                Ok(vector) => records.push(
                    ChunkRecord::with_generated_id(
                        &question.title,
                        category,
                        index,
                        total,
                        piece,
                        self.embedder.model_id(),
                    )
                    .with_parent_ref(&question.id)
                    .with_metadata(metadata.clone())
                    .with_embedding(vector),
                ),
                Err(err) => {
                    warn!(question = %question.id, category = %category, chunk = index,
                          error = %err, "qa chunk embedding failed; chunk skipped");
                }
            }
        }
    }
}
