//! SQLite chunk store backed by the `sqlite-vec` extension.
//!
//! Chunk rows live in a plain `chunks` table; their vectors live in a
//! `chunk_vectors` vec0 virtual table joined by rowid. Similarity search
//! runs `vec_distance_cosine` directly in SQL, and the parent-scoped
//! delete+insert used for re-indexing executes inside a single transaction
//! so readers never observe a partial mix of stale and fresh rows.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension, ffi};

use super::{ChunkRecord, ChunkStore, SimilarityQuery, SourceCategory};
use crate::types::{EMBEDDING_DIMENSIONS, StorageError};

#[derive(Clone)]
pub struct SqliteChunkStore {
    conn: Connection,
    dimensions: usize,
}

impl SqliteChunkStore {
    /// Opens (creating if needed) a chunk store at `path` with the
    /// system-wide embedding dimensionality.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_dimensions(path, EMBEDDING_DIMENSIONS).await
    }

    pub async fn open_with_dimensions(
        path: impl AsRef<Path>,
        dimensions: usize,
    ) -> Result<Self, StorageError> {
        register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Self::initialize(conn, dimensions).await
    }

    /// In-memory store, used by tests and throwaway pipelines.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        register_sqlite_vec()?;
        let conn = Connection::open_in_memory()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Self::initialize(conn, EMBEDDING_DIMENSIONS).await
    }

    async fn initialize(conn: Connection, dimensions: usize) -> Result<Self, StorageError> {
        conn.call(move |conn| {
            conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0))
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS chunks (
                     id TEXT PRIMARY KEY,
                     source_label TEXT NOT NULL,
                     source_category TEXT NOT NULL,
                     sequence_index INTEGER NOT NULL,
                     sequence_total INTEGER NOT NULL,
                     content TEXT NOT NULL,
                     embedding_model TEXT NOT NULL,
                     priority INTEGER NOT NULL,
                     image_ref TEXT,
                     parent_ref TEXT,
                     metadata TEXT NOT NULL DEFAULT '{{}}'
                 );
                 CREATE INDEX IF NOT EXISTS idx_chunks_parent
                     ON chunks(parent_ref, source_category);
                 CREATE VIRTUAL TABLE IF NOT EXISTS chunk_vectors
                     USING vec0(embedding float[{dimensions}]);"
            ))
            .map_err(tokio_rusqlite::Error::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|err| StorageError::Backend(err.to_string()))?;

        Ok(Self { conn, dimensions })
    }

    /// Underlying connection, for queries the trait does not cover.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn prepare_rows(&self, chunks: Vec<ChunkRecord>) -> Result<Vec<InsertRow>, StorageError> {
        let mut rows = Vec::with_capacity(chunks.len());
        for record in chunks {
            if record.content.trim().is_empty() {
                return Err(StorageError::EmptyContent { id: record.id });
            }
            let Some(embedding) = record.embedding.as_ref() else {
                return Err(StorageError::MissingEmbedding { id: record.id });
            };
            if embedding.len() != self.dimensions {
                return Err(StorageError::Dimensions {
                    expected: self.dimensions,
                    actual: embedding.len(),
                });
            }
            let embedding_json = serde_json::to_string(embedding)
                .map_err(|err| StorageError::Backend(err.to_string()))?;
            rows.push(InsertRow {
                id: record.id,
                source_label: record.source_label,
                source_category: record.source_category.as_str().to_string(),
                sequence_index: record.sequence_index as i64,
                sequence_total: record.sequence_total as i64,
                content: record.content,
                embedding_model: record.embedding_model,
                priority: record.priority,
                image_ref: record.image_ref,
                parent_ref: record.parent_ref,
                metadata: record.metadata.to_string(),
                embedding_json,
            });
        }
        Ok(rows)
    }
}

struct InsertRow {
    id: String,
    source_label: String,
    source_category: String,
    sequence_index: i64,
    sequence_total: i64,
    content: String,
    embedding_model: String,
    priority: i64,
    image_ref: Option<String>,
    parent_ref: Option<String>,
    metadata: String,
    embedding_json: String,
}

const INSERT_CHUNK_SQL: &str = "INSERT INTO chunks \
     (id, source_label, source_category, sequence_index, sequence_total, \
      content, embedding_model, priority, image_ref, parent_ref, metadata) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const INSERT_VECTOR_SQL: &str =
    "INSERT INTO chunk_vectors (rowid, embedding) VALUES (?1, vec_f32(?2))";

const SELECT_COLUMNS: &str = "id, source_label, source_category, sequence_index, \
     sequence_total, content, embedding_model, priority, image_ref, parent_ref, metadata";

fn quoted_category_list(categories: &[SourceCategory]) -> String {
    categories
        .iter()
        .map(|category| format!("'{}'", category.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn register_sqlite_vec() -> Result<(), StorageError> {
    use std::sync::Mutex;

    static INIT: Once = Once::new();
    static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

    INIT.call_once(|| {
        let result = unsafe {
            type SqliteExtensionInit = unsafe extern "C" fn(
                *mut ffi::sqlite3,
                *mut *const c_char,
                *const ffi::sqlite3_api_routines,
            ) -> i32;

            let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let init_fn: SqliteExtensionInit =
                transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
            let rc = ffi::sqlite3_auto_extension(Some(init_fn));
            if rc != 0 {
                Err(format!(
                    "failed to register sqlite-vec extension (code {rc})"
                ))
            } else {
                Ok(())
            }
        };
        *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
    });

    INIT_RESULT
        .lock()
        .expect("init result mutex poisoned")
        .clone()
        .expect("init was called but result not set")
        .map_err(StorageError::Backend)
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<usize, StorageError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let rows = self.prepare_rows(chunks)?;

        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                for row in &rows {
                    tx.execute(
                        INSERT_CHUNK_SQL,
                        (
                            &row.id,
                            &row.source_label,
                            &row.source_category,
                            row.sequence_index,
                            row.sequence_total,
                            &row.content,
                            &row.embedding_model,
                            row.priority,
                            &row.image_ref,
                            &row.parent_ref,
                            &row.metadata,
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let rowid = tx.last_insert_rowid();
                    tx.execute(INSERT_VECTOR_SQL, (rowid, &row.embedding_json))
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(rows.len())
            })
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn replace_chunks(
        &self,
        parent_ref: &str,
        categories: &[SourceCategory],
        chunks: Vec<ChunkRecord>,
    ) -> Result<usize, StorageError> {
        let rows = self.prepare_rows(chunks)?;
        let parent = parent_ref.to_string();
        let categories_sql = quoted_category_list(categories);
        if categories_sql.is_empty() {
            return Err(StorageError::Backend(
                "replace_chunks requires at least one category".to_string(),
            ));
        }

        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    &format!(
                        "DELETE FROM chunk_vectors WHERE rowid IN \
                         (SELECT rowid FROM chunks \
                          WHERE parent_ref = ?1 AND source_category IN ({categories_sql}))"
                    ),
                    [&parent],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    &format!(
                        "DELETE FROM chunks \
                         WHERE parent_ref = ?1 AND source_category IN ({categories_sql})"
                    ),
                    [&parent],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                for row in &rows {
                    tx.execute(
                        INSERT_CHUNK_SQL,
                        (
                            &row.id,
                            &row.source_label,
                            &row.source_category,
                            row.sequence_index,
                            row.sequence_total,
                            &row.content,
                            &row.embedding_model,
                            row.priority,
                            &row.image_ref,
                            &row.parent_ref,
                            &row.metadata,
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let rowid = tx.last_insert_rowid();
                    tx.execute(INSERT_VECTOR_SQL, (rowid, &row.embedding_json))
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(rows.len())
            })
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn delete_chunks_by_parent(
        &self,
        parent_ref: &str,
        categories: &[SourceCategory],
    ) -> Result<usize, StorageError> {
        let categories_sql = quoted_category_list(categories);
        if categories_sql.is_empty() {
            return Ok(0);
        }
        let parent = parent_ref.to_string();

        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    &format!(
                        "DELETE FROM chunk_vectors WHERE rowid IN \
                         (SELECT rowid FROM chunks \
                          WHERE parent_ref = ?1 AND source_category IN ({categories_sql}))"
                    ),
                    [&parent],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let deleted = tx
                    .execute(
                        &format!(
                            "DELETE FROM chunks \
                             WHERE parent_ref = ?1 AND source_category IN ({categories_sql})"
                        ),
                        [&parent],
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(deleted)
            })
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn get_chunks_by_parent(
        &self,
        parent_ref: &str,
    ) -> Result<Vec<ChunkRecord>, StorageError> {
        let parent = parent_ref.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM chunks \
                         WHERE parent_ref = ?1 \
                         ORDER BY source_category, sequence_index"
                    ))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&parent], |row| {
                        Ok(ChunkRecord {
                            id: row.get(0)?,
                            source_label: row.get(1)?,
                            source_category: SourceCategory::parse(&row.get::<_, String>(2)?)
                                .unwrap_or(SourceCategory::Document),
                            sequence_index: row.get::<_, i64>(3)? as usize,
                            sequence_total: row.get::<_, i64>(4)? as usize,
                            content: row.get(5)?,
                            embedding: None,
                            embedding_model: row.get(6)?,
                            priority: row.get(7)?,
                            image_ref: row.get(8)?,
                            parent_ref: row.get(9)?,
                            metadata: row
                                .get::<_, String>(10)
                                .map(|raw| serde_json::from_str(&raw).unwrap_or_default())
                                .unwrap_or_default(),
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let mut records = Vec::new();
                for row in rows {
                    records.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(records)
            })
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn get_chunk_by_id(&self, id: &str) -> Result<Option<ChunkRecord>, StorageError> {
        let id = id.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {SELECT_COLUMNS} FROM chunks WHERE id = ?1"))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let record = stmt
                    .query_row([&id], |row| {
                        Ok(ChunkRecord {
                            id: row.get(0)?,
                            source_label: row.get(1)?,
                            source_category: SourceCategory::parse(&row.get::<_, String>(2)?)
                                .unwrap_or(SourceCategory::Document),
                            sequence_index: row.get::<_, i64>(3)? as usize,
                            sequence_total: row.get::<_, i64>(4)? as usize,
                            content: row.get(5)?,
                            embedding: None,
                            embedding_model: row.get(6)?,
                            priority: row.get(7)?,
                            image_ref: row.get(8)?,
                            parent_ref: row.get(9)?,
                            metadata: row
                                .get::<_, String>(10)
                                .map(|raw| serde_json::from_str(&raw).unwrap_or_default())
                                .unwrap_or_default(),
                        })
                    })
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(record)
            })
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn search_similar(
        &self,
        query: &SimilarityQuery,
    ) -> Result<Vec<(ChunkRecord, f32)>, StorageError> {
        if query.embedding.len() != self.dimensions {
            return Err(StorageError::Dimensions {
                expected: self.dimensions,
                actual: query.embedding.len(),
            });
        }
        let embedding_json = serde_json::to_string(&query.embedding)
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let category = query.category.map(|c| c.as_str().to_string());
        let limit = query.limit as i64;
        let min_similarity = query.min_similarity;

        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT c.id, c.source_label, c.source_category, c.sequence_index, \
                                c.sequence_total, c.content, c.embedding_model, c.priority, \
                                c.image_ref, c.parent_ref, c.metadata, \
                                vec_distance_cosine(v.embedding, vec_f32(?1)) AS distance \
                         FROM chunks AS c \
                         JOIN chunk_vectors AS v ON v.rowid = c.rowid \
                         WHERE ?2 IS NULL OR c.source_category = ?2 \
                         ORDER BY distance ASC, c.priority DESC \
                         LIMIT ?3"
                    ))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map((&embedding_json, &category, limit), |row| {
                        let record = ChunkRecord {
                            id: row.get(0)?,
                            source_label: row.get(1)?,
                            source_category: SourceCategory::parse(&row.get::<_, String>(2)?)
                                .unwrap_or(SourceCategory::Document),
                            sequence_index: row.get::<_, i64>(3)? as usize,
                            sequence_total: row.get::<_, i64>(4)? as usize,
                            content: row.get(5)?,
                            embedding: None,
                            embedding_model: row.get(6)?,
                            priority: row.get(7)?,
                            image_ref: row.get(8)?,
                            parent_ref: row.get(9)?,
                            metadata: row
                                .get::<_, String>(10)
                                .map(|raw| serde_json::from_str(&raw).unwrap_or_default())
                                .unwrap_or_default(),
                        };
                        let distance: f32 = row.get(11)?;
                        Ok((record, 1.0 - distance))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let mut results = Vec::new();
                for row in rows {
                    let (record, similarity) = row.map_err(tokio_rusqlite::Error::Rusqlite)?;
                    if let Some(floor) = min_similarity {
                        if similarity < floor {
                            continue;
                        }
                    }
                    results.push((record, similarity));
                }
                Ok(results)
            })
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(count as usize)
            })
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }
}
