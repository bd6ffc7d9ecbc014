//! Vector index over SQLite.
//!
//! Chunks live in `chunks`, their vectors in `chunk_vectors`, and the
//! per-document bookkeeping (status, applied version) in `documents`. Every
//! mutation of one document happens in a single transaction, so a reader
//! sees either the old or the new chunk set, never a mix.
//!
//! Writes are versioned: a write carrying a version at or below the
//! document's `applied_version` is rejected with
//! [`PipelineError::IndexConsistency`]. Deletes leave a tombstone row that
//! keeps the version, so a slow upsert cannot resurrect a deleted file.
//!
//! Search is brute-force cosine similarity over vectors of one embedding
//! model, which is plenty for a single-site knowledge base.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{PipelineError, Result};
use crate::models::{Category, Chunk, Document, DocumentStatus};

/// Identity and file facts written to the `documents` row.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub id: String,
    pub path: PathBuf,
    pub file_name: String,
    pub category: Category,
    pub content_hash: String,
    pub modified_at: i64,
}

/// What an upsert changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub written: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// One retrieved chunk with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub category: Category,
    pub file_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
}

#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Chunk id → text hash for chunks of `document_id` that already have a
    /// vector from `model`. Those chunks need no re-embedding when unchanged.
    pub async fn existing_chunks(
        &self,
        document_id: &str,
        model: &str,
    ) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT c.id, c.hash FROM chunks c \
             JOIN chunk_vectors v ON v.chunk_id = c.id \
             WHERE c.document_id = ? AND v.model = ?",
        )
        .bind(document_id)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("hash")))
            .collect())
    }

    /// Replace the document's chunk set with `chunks`.
    ///
    /// `vectors` maps chunk id to a fresh vector. A chunk may be absent from
    /// it only if the stored chunk has the same hash and a vector from
    /// `model`; such chunks are left untouched.
    pub async fn upsert(
        &self,
        meta: &DocumentMeta,
        version: i64,
        model: &str,
        chunks: &[Chunk],
        vectors: &HashMap<String, Vec<f32>>,
    ) -> Result<UpsertStats> {
        let mut tx = self.pool.begin().await?;
        claim_version(&mut tx, meta, version).await?;

        let rows = sqlx::query(
            "SELECT c.id, c.hash, v.model FROM chunks c \
             LEFT JOIN chunk_vectors v ON v.chunk_id = c.id \
             WHERE c.document_id = ?",
        )
        .bind(&meta.id)
        .fetch_all(&mut *tx)
        .await?;
        let stored: HashMap<String, (String, Option<String>)> = rows
            .iter()
            .map(|r| {
                (
                    r.get::<String, _>("id"),
                    (r.get::<String, _>("hash"), r.get::<Option<String>, _>("model")),
                )
            })
            .collect();

        let mut stats = UpsertStats::default();

        // Orphans first: vectors reference chunks.
        let live: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        for orphan in stored.keys().filter(|id| !live.contains(id.as_str())) {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(orphan)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(orphan)
                .execute(&mut *tx)
                .await?;
            stats.removed += 1;
        }

        for chunk in chunks {
            let unchanged = stored.get(&chunk.id).is_some_and(|(hash, stored_model)| {
                *hash == chunk.hash && stored_model.as_deref() == Some(model)
            });
            let vector = vectors.get(&chunk.id);
            if unchanged && vector.is_none() {
                stats.unchanged += 1;
                continue;
            }
            let vector = vector.ok_or_else(|| {
                PipelineError::EmbeddingService(format!(
                    "no vector supplied for changed chunk {} of {}",
                    chunk.chunk_index, meta.id
                ))
            })?;

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, hash, char_len, span_start, span_end)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    hash = excluded.hash,
                    char_len = excluded.char_len,
                    span_start = excluded.span_start,
                    span_end = excluded.span_end
                "#,
            )
            .bind(&chunk.id)
            .bind(&meta.id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(chunk.char_len as i64)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, category, chunk_index, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    category = excluded.category,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&chunk.id)
            .bind(&meta.id)
            .bind(meta.category.as_str())
            .bind(chunk.chunk_index)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
            stats.written += 1;
        }

        finish_document(
            &mut tx,
            meta,
            version,
            DocumentStatus::Parsed,
            chunks.len() as i64,
            None,
        )
        .await?;
        tx.commit().await?;

        debug!(
            document = %meta.id,
            version,
            written = stats.written,
            unchanged = stats.unchanged,
            removed = stats.removed,
            "index upsert"
        );
        Ok(stats)
    }

    /// Remove every record of the document and leave a `deleted` tombstone.
    /// Returns how many chunks were removed; deleting an absent document
    /// removes nothing and succeeds.
    pub async fn delete(&self, meta: &DocumentMeta, version: i64) -> Result<usize> {
        self.clear(meta, version, DocumentStatus::Deleted, None)
            .await
    }

    /// Remove every record of an unparseable document and mark it `failed`.
    pub async fn mark_failed(&self, meta: &DocumentMeta, version: i64, error: &str) -> Result<usize> {
        self.clear(meta, version, DocumentStatus::Failed, Some(error))
            .await
    }

    async fn clear(
        &self,
        meta: &DocumentMeta,
        version: i64,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        claim_version(&mut tx, meta, version).await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(&meta.id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&meta.id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;

        finish_document(&mut tx, meta, version, status, 0, error).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Record an error on the document without touching its indexed records.
    pub async fn note_error(&self, document_id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create a `pending` row for a document the index has never seen.
    pub async fn ensure_document(&self, meta: &DocumentMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, path, file_name, category, status, applied_version)
            VALUES (?, ?, ?, ?, 'pending', 0)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&meta.id)
        .bind(meta.path.to_string_lossy().as_ref())
        .bind(&meta.file_name)
        .bind(meta.category.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Top `top_n` chunks by cosine similarity among live documents indexed
    /// with `model`, optionally restricted to one category.
    pub async fn search(
        &self,
        query: &[f32],
        model: &str,
        top_n: usize,
        category: Option<Category>,
    ) -> Result<Vec<SearchHit>> {
        let category = category.map(|c| c.as_str());
        let rows = sqlx::query(
            r#"
            SELECT v.chunk_id, v.document_id, v.category, v.chunk_index, v.embedding,
                   c.text, d.file_name
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            JOIN documents d ON d.id = v.document_id
            WHERE v.model = ?
              AND d.status = 'parsed'
              AND (? IS NULL OR v.category = ?)
            "#,
        )
        .bind(model)
        .bind(category)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query, &blob_to_vec(&blob));
                SearchHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    category: row
                        .get::<String, _>("category")
                        .parse()
                        .unwrap_or(Category::Internal),
                    file_name: row.get("file_name"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    score,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_n);
        Ok(hits)
    }

    pub async fn document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    pub async fn documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    /// Chunks of a document in order.
    pub async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, text, hash, char_len, span_start, span_end \
             FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Chunk {
                id: r.get("id"),
                document_id: r.get("document_id"),
                chunk_index: r.get("chunk_index"),
                text: r.get("text"),
                hash: r.get("hash"),
                char_len: r.get::<i64, _>("char_len") as usize,
                start: r.get::<i64, _>("span_start") as usize,
                end: r.get::<i64, _>("span_end") as usize,
            })
            .collect())
    }

    /// Number of stored vectors for a document.
    pub async fn vector_count(&self, document_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Takes the write lock, then rejects `version` if it is not newer than
/// the applied one.
async fn claim_version(
    tx: &mut Transaction<'_, Sqlite>,
    meta: &DocumentMeta,
    version: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, path, file_name, category, status, applied_version)
        VALUES (?, ?, ?, ?, 'pending', 0)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&meta.id)
    .bind(meta.path.to_string_lossy().as_ref())
    .bind(&meta.file_name)
    .bind(meta.category.as_str())
    .execute(&mut **tx)
    .await?;

    let applied: i64 = sqlx::query_scalar("SELECT applied_version FROM documents WHERE id = ?")
        .bind(&meta.id)
        .fetch_one(&mut **tx)
        .await?;
    if version <= applied {
        return Err(PipelineError::IndexConsistency {
            document_id: meta.id.clone(),
            attempted: version,
            applied,
        });
    }
    Ok(())
}

async fn finish_document(
    tx: &mut Transaction<'_, Sqlite>,
    meta: &DocumentMeta,
    version: i64,
    status: DocumentStatus,
    chunk_count: i64,
    error: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE documents SET
            path = ?,
            file_name = ?,
            category = ?,
            content_hash = CASE WHEN ? = '' THEN content_hash ELSE ? END,
            modified_at = CASE WHEN ? = 0 THEN modified_at ELSE ? END,
            status = ?,
            applied_version = ?,
            chunk_count = ?,
            last_indexed_at = ?,
            last_error = ?
        WHERE id = ? AND applied_version < ?
        "#,
    )
    .bind(meta.path.to_string_lossy().as_ref())
    .bind(&meta.file_name)
    .bind(meta.category.as_str())
    .bind(&meta.content_hash)
    .bind(&meta.content_hash)
    .bind(meta.modified_at)
    .bind(meta.modified_at)
    .bind(status.as_str())
    .bind(version)
    .bind(chunk_count)
    .bind(Utc::now().timestamp())
    .bind(error)
    .bind(&meta.id)
    .bind(version)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        let applied: i64 =
            sqlx::query_scalar("SELECT applied_version FROM documents WHERE id = ?")
                .bind(&meta.id)
                .fetch_one(&mut **tx)
                .await?;
        return Err(PipelineError::IndexConsistency {
            document_id: meta.id.clone(),
            attempted: version,
            applied,
        });
    }
    Ok(())
}

fn row_to_document(row: &SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        path: PathBuf::from(row.get::<String, _>("path")),
        file_name: row.get("file_name"),
        category: row
            .get::<String, _>("category")
            .parse()
            .unwrap_or(Category::Internal),
        content_hash: row.get("content_hash"),
        modified_at: row.get("modified_at"),
        status: row
            .get::<String, _>("status")
            .parse()
            .unwrap_or(DocumentStatus::Pending),
        applied_version: row.get("applied_version"),
        chunk_count: row.get("chunk_count"),
        last_indexed_at: row.get("last_indexed_at"),
        last_error: row.get("last_error"),
    }
}
