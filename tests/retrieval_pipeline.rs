//! End-to-end pipeline tests over an in-memory vector store and
//! deterministic provider doubles.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use answersmith::providers::{MockCaptioner, MockEmbeddingProvider, MockGenerator};
use answersmith::stores::{ChunkRecord, ChunkStore, SimilarityQuery, SourceCategory};
use answersmith::types::{RetrievalError, StorageError};
use answersmith::{
    ContentItem, EmbeddingProvider, Indexer, QaAnswer, QaQuestion, QueryExpander, Reranker,
    RetrieveOptions, Retriever, SqliteChunkStore,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Store wrapper that counts similarity searches.
struct CountingStore {
    inner: Arc<SqliteChunkStore>,
    searches: AtomicUsize,
}

impl CountingStore {
    fn new(inner: Arc<SqliteChunkStore>) -> Self {
        Self {
            inner,
            searches: AtomicUsize::new(0),
        }
    }

    fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkStore for CountingStore {
    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<usize, StorageError> {
        self.inner.insert_chunks(chunks).await
    }

    async fn replace_chunks(
        &self,
        parent_ref: &str,
        categories: &[SourceCategory],
        chunks: Vec<ChunkRecord>,
    ) -> Result<usize, StorageError> {
        self.inner.replace_chunks(parent_ref, categories, chunks).await
    }

    async fn delete_chunks_by_parent(
        &self,
        parent_ref: &str,
        categories: &[SourceCategory],
    ) -> Result<usize, StorageError> {
        self.inner.delete_chunks_by_parent(parent_ref, categories).await
    }

    async fn get_chunks_by_parent(
        &self,
        parent_ref: &str,
    ) -> Result<Vec<ChunkRecord>, StorageError> {
        self.inner.get_chunks_by_parent(parent_ref).await
    }

    async fn get_chunk_by_id(&self, id: &str) -> Result<Option<ChunkRecord>, StorageError> {
        self.inner.get_chunk_by_id(id).await
    }

    async fn search_similar(
        &self,
        query: &SimilarityQuery,
    ) -> Result<Vec<(ChunkRecord, f32)>, StorageError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search_similar(query).await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        self.inner.count().await
    }
}

/// Store whose similarity search always fails.
struct FailingSearchStore;

#[async_trait]
impl ChunkStore for FailingSearchStore {
    async fn insert_chunks(&self, _chunks: Vec<ChunkRecord>) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn replace_chunks(
        &self,
        _parent_ref: &str,
        _categories: &[SourceCategory],
        _chunks: Vec<ChunkRecord>,
    ) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn delete_chunks_by_parent(
        &self,
        _parent_ref: &str,
        _categories: &[SourceCategory],
    ) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn get_chunks_by_parent(
        &self,
        _parent_ref: &str,
    ) -> Result<Vec<ChunkRecord>, StorageError> {
        Ok(Vec::new())
    }

    async fn get_chunk_by_id(&self, _id: &str) -> Result<Option<ChunkRecord>, StorageError> {
        Ok(None)
    }

    async fn search_similar(
        &self,
        _query: &SimilarityQuery,
    ) -> Result<Vec<(ChunkRecord, f32)>, StorageError> {
        Err(StorageError::Backend("vector index offline".to_string()))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}

fn unit_record(id: &str, content: &str, embedder_dims: usize, axis: usize) -> ChunkRecord {
    let mut vector = vec![0.0f32; embedder_dims];
    vector[axis % embedder_dims] = 1.0;
    ChunkRecord::new(
        id,
        "Seeded doc",
        SourceCategory::Document,
        0,
        1,
        content,
        "mock-embedding",
    )
    .with_parent_ref("seed")
    .with_embedding(vector)
}

async fn seeded_store(embedder: &MockEmbeddingProvider, texts: &[&str]) -> Arc<SqliteChunkStore> {
    let store = Arc::new(SqliteChunkStore::open_in_memory().await.unwrap());
    let mut records = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        let vector = embedder.embed(text).await.unwrap();
        records.push(
            ChunkRecord::new(
                format!("seed-{i}"),
                "Seeded doc",
                SourceCategory::Document,
                i,
                texts.len(),
                *text,
                "mock-embedding",
            )
            .with_parent_ref("seed")
            .with_embedding(vector),
        );
    }
    store.insert_chunks(records).await.unwrap();
    store
}

fn retriever_over(
    store: Arc<dyn ChunkStore>,
    embedder: Arc<MockEmbeddingProvider>,
    expander_generator: Arc<MockGenerator>,
    rerank_generator: Arc<MockGenerator>,
) -> Retriever {
    let expander = QueryExpander::new(expander_generator, embedder.clone());
    let reranker = Reranker::new(rerank_generator);
    Retriever::new(store, embedder, expander, reranker)
}

#[tokio::test]
async fn short_query_searches_exactly_one_variant() {
    init_tracing();
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let inner = seeded_store(&embedder, &["환불은 14일 이내에 가능합니다."]).await;
    let counting = Arc::new(CountingStore::new(inner));
    let expander_generator = Arc::new(MockGenerator::failing());

    let retriever = retriever_over(
        counting.clone(),
        embedder,
        expander_generator.clone(),
        Arc::new(MockGenerator::failing()),
    );

    // Nine meaningful characters: below the expansion threshold.
    let result = retriever
        .retrieve("환불 정책이 뭔가요", &RetrieveOptions::default())
        .await
        .unwrap();

    assert!(!result.is_empty());
    assert_eq!(counting.search_count(), 1, "no expansion may be attempted");
    assert!(
        expander_generator.calls().is_empty(),
        "the rewriter must never be called for short queries"
    );
}

#[tokio::test]
async fn failed_search_on_every_variant_reports_no_relevant_content() {
    init_tracing();
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let retriever = retriever_over(
        Arc::new(FailingSearchStore),
        embedder,
        Arc::new(MockGenerator::failing()),
        Arc::new(MockGenerator::failing()),
    );

    let err = retriever
        .retrieve("how do I request a refund?", &RetrieveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::NoRelevantContent));
}

#[tokio::test]
async fn empty_store_reports_no_relevant_content() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let store = Arc::new(SqliteChunkStore::open_in_memory().await.unwrap());
    let retriever = retriever_over(
        store,
        embedder,
        Arc::new(MockGenerator::failing()),
        Arc::new(MockGenerator::failing()),
    );

    let err = retriever
        .retrieve("how do I request a refund?", &RetrieveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::NoRelevantContent));
}

#[tokio::test]
async fn original_query_embedding_failure_propagates() {
    let embedder = Arc::new(MockEmbeddingProvider::failing());
    let store = Arc::new(SqliteChunkStore::open_in_memory().await.unwrap());
    let retriever = retriever_over(
        store,
        embedder,
        Arc::new(MockGenerator::failing()),
        Arc::new(MockGenerator::failing()),
    );

    let err = retriever
        .retrieve("how do I request a refund?", &RetrieveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::QueryEmbedding(_)));
}

#[tokio::test]
async fn expanded_variants_are_deduplicated_first_wins() {
    // Constant embeddings: every variant search returns the same rows with
    // identical similarity, so dedup is fully exercised.
    let embedder = Arc::new(MockEmbeddingProvider::constant());
    let inner = seeded_store(
        &embedder,
        &[
            "Refunds are available within 14 days.",
            "Course access lasts one year.",
            "Invoices are sent monthly.",
        ],
    )
    .await;
    let counting = Arc::new(CountingStore::new(inner));
    let expander_generator = Arc::new(MockGenerator::always(
        "what is the refund window\nhow long do refunds take",
    ));

    let retriever = retriever_over(
        counting.clone(),
        embedder,
        expander_generator,
        Arc::new(MockGenerator::failing()),
    );

    let result = retriever
        .retrieve("how do I request a refund?", &RetrieveOptions::default())
        .await
        .unwrap();

    assert_eq!(counting.search_count(), 3, "original plus two alternates");
    assert_eq!(result.len(), 3, "duplicates across variants must collapse");
    let mut ids: Vec<&str> = result.iter().map(|r| r.chunk.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn rerank_scores_reorder_and_top_k_truncates() {
    let embedder = Arc::new(MockEmbeddingProvider::constant());
    let store = Arc::new(SqliteChunkStore::open_in_memory().await.unwrap());
    let base = embedder.embed("anything").await.unwrap();
    // Perturb each record a little more than the last so similarity to the
    // query strictly decreases with the index: search order is c0..c5.
    let records: Vec<ChunkRecord> = (0..6)
        .map(|i| {
            let mut vector = base.clone();
            vector[i] += 0.1 * (i as f32 + 1.0);
            ChunkRecord::new(
                format!("c{i}"),
                "Seeded doc",
                SourceCategory::Document,
                i,
                6,
                format!("passage {i}"),
                "mock-embedding",
            )
            .with_parent_ref("seed")
            .with_embedding(vector)
        })
        .collect();
    store.insert_chunks(records).await.unwrap();

    let rerank_generator = Arc::new(MockGenerator::always("[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]"));
    let retriever = retriever_over(
        store,
        embedder,
        Arc::new(MockGenerator::failing()),
        rerank_generator,
    );

    let result = retriever
        .retrieve("환불 정책이 뭔가요", &RetrieveOptions::default())
        .await
        .unwrap();

    assert_eq!(result.len(), 5, "top_k must truncate");
    let ids: Vec<&str> = result.iter().map(|r| r.chunk.id.as_str()).collect();
    assert_eq!(ids, vec!["c5", "c4", "c3", "c2", "c1"]);
    for item in &result {
        assert!(item.rerank_score.is_some(), "rerank score is provenance");
        assert!(item.similarity > 0.8, "all records stay close to the query");
    }
}

#[tokio::test]
async fn category_filter_limits_retrieval_to_one_origin() {
    let embedder = Arc::new(MockEmbeddingProvider::constant());
    let store = Arc::new(SqliteChunkStore::open_in_memory().await.unwrap());
    let vector = embedder.embed("anything").await.unwrap();
    store
        .insert_chunks(vec![
            ChunkRecord::new(
                "doc",
                "Handbook",
                SourceCategory::Document,
                0,
                1,
                "Documented refund policy.",
                "mock-embedding",
            )
            .with_parent_ref("p1")
            .with_embedding(vector.clone()),
            ChunkRecord::new(
                "ans",
                "How do refunds work?",
                SourceCategory::QaAnswer,
                0,
                1,
                "You get refunds within 14 days.",
                "mock-embedding",
            )
            .with_parent_ref("q1")
            .with_embedding(vector.clone()),
        ])
        .await
        .unwrap();

    let retriever = retriever_over(
        store,
        embedder,
        Arc::new(MockGenerator::failing()),
        Arc::new(MockGenerator::failing()),
    );

    let options = RetrieveOptions {
        category: Some(SourceCategory::QaAnswer),
        ..Default::default()
    };
    let result = retriever.retrieve("환불 정책이 뭔가요", &options).await.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].chunk.id, "ans");
}

#[tokio::test]
async fn indexed_content_is_retrievable_with_provenance() {
    let embedder = Arc::new(MockEmbeddingProvider::constant());
    let store = Arc::new(SqliteChunkStore::open_in_memory().await.unwrap());
    let indexer = Indexer::new(
        store.clone() as Arc<dyn ChunkStore>,
        embedder.clone(),
        Arc::new(MockCaptioner::new()),
    )
    .unwrap();

    let sentence = format!("{}.", "a".repeat(99));
    let item = ContentItem {
        id: "lecture-1".to_string(),
        title: "Lecture one".to_string(),
        body: vec![sentence; 20].join(" "),
        images: Vec::new(),
    };
    let indexed = indexer.index_content(&item).await.unwrap();
    assert!((3..=4).contains(&indexed));

    let retriever = retriever_over(
        store,
        embedder,
        Arc::new(MockGenerator::failing()),
        Arc::new(MockGenerator::failing()),
    );
    let result = retriever
        .retrieve("환불 정책이 뭔가요", &RetrieveOptions::default())
        .await
        .unwrap();

    assert!(!result.is_empty());
    for item in &result {
        assert_eq!(item.chunk.source_label, "Lecture one");
        assert_eq!(item.chunk.parent_ref.as_deref(), Some("lecture-1"));
        assert!(item.similarity > 0.0);
    }
}

#[tokio::test]
async fn reapproval_after_edit_replaces_qa_chunks_end_to_end() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let store = Arc::new(SqliteChunkStore::open_in_memory().await.unwrap());
    let indexer = Indexer::new(
        store.clone() as Arc<dyn ChunkStore>,
        embedder.clone(),
        Arc::new(MockCaptioner::new()),
    )
    .unwrap();

    let question = QaQuestion {
        id: "q-77".to_string(),
        title: "Can I change my enrollment?".to_string(),
        body: "I picked the wrong cohort and want to switch.".to_string(),
        image_url: None,
    };
    let answer_v1 = QaAnswer {
        id: "a-77".to_string(),
        body: "Yes, contact support before the first session.".to_string(),
        image_url: None,
    };
    indexer.index_qa_pair(&question, &answer_v1).await;
    let before = store.get_chunks_by_parent("q-77").await.unwrap();

    let answer_v2 = QaAnswer {
        id: "a-77".to_string(),
        body: "Yes, contact support before the second session.".to_string(),
        image_url: None,
    };
    indexer.index_qa_pair(&question, &answer_v2).await;
    let after = store.get_chunks_by_parent("q-77").await.unwrap();

    assert_eq!(before.len(), after.len(), "same boundaries, same row count");
    assert!(
        after
            .iter()
            .filter(|r| r.source_category == SourceCategory::QaAnswer)
            .all(|r| r.content.contains("second session")),
        "chunks must reflect the newest answer text"
    );
}

#[tokio::test]
async fn seeded_and_generated_records_share_one_dimensionality() {
    // A record built by hand must match the embedder the store was opened
    // for; anything else is rejected before persistence.
    let store = SqliteChunkStore::open_in_memory().await.unwrap();
    let bad = unit_record("bad", "content", 64, 0);
    assert!(matches!(
        store.insert_chunks(vec![bad]).await.unwrap_err(),
        StorageError::Dimensions { actual: 64, .. }
    ));
}
