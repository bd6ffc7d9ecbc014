//! Ingestion status, extracted-content view, manual re-indexing and reset.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::normalize_text;
use crate::connector_fs::FileEntry;
use crate::context::AppContext;
use crate::models::{Category, Document, DocumentStatus, JobOp, NewJob};

/// Failures callers can act on. Carried inside `anyhow::Error` so the HTTP
/// layer can map them by downcasting.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document file not found on disk: {0}")]
    FileMissing(String),

    #[error("cannot extract {id}: {reason}")]
    Unreadable { id: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatusView {
    pub id: String,
    pub file_name: String,
    pub category: Category,
    pub status: DocumentStatus,
    pub last_indexed_at: Option<i64>,
    pub chunk_count: i64,
    pub last_error: Option<String>,
}

impl From<Document> for DocumentStatusView {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            file_name: doc.file_name,
            category: doc.category,
            status: doc.status,
            last_indexed_at: doc.last_indexed_at,
            chunk_count: doc.chunk_count,
            last_error: doc.last_error,
        }
    }
}

/// What to re-index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "target", content = "id", rename_all = "lowercase")]
pub enum Target {
    All,
    Document(String),
}

impl Target {
    /// `"all"` or a document id.
    pub fn parse(s: &str) -> Self {
        if s == "all" {
            Target::All
        } else {
            Target::Document(s.to_string())
        }
    }
}

pub async fn document_status(ctx: &AppContext, id: &str) -> Result<Option<DocumentStatusView>> {
    Ok(ctx.index.document(id).await?.map(DocumentStatusView::from))
}

/// Every known document, tombstones included, ordered by id.
pub async fn list_status(ctx: &AppContext) -> Result<Vec<DocumentStatusView>> {
    Ok(ctx
        .index
        .documents()
        .await?
        .into_iter()
        .map(DocumentStatusView::from)
        .collect())
}

/// Enqueue a fresh upsert for the target regardless of its recorded hash.
/// Returns the ids of the enqueued jobs.
pub async fn reindex(ctx: &AppContext, target: Target) -> Result<Vec<i64>> {
    let entries = match &target {
        Target::All => {
            let scanner = ctx.scanner.clone();
            tokio::task::spawn_blocking(move || scanner.scan()).await??
        }
        Target::Document(id) => vec![on_disk(ctx, id).await?.1],
    };

    let jobs = enqueue_upserts(ctx, entries).await?;
    tracing::info!(?target, jobs = jobs.len(), "reindex requested");
    Ok(jobs)
}

/// A known document together with its file, which must still be on disk.
async fn on_disk(ctx: &AppContext, id: &str) -> Result<(Document, FileEntry)> {
    let Some(doc) = ctx.index.document(id).await? else {
        return Err(StatusError::NotFound(id.to_string()).into());
    };
    match ctx.scanner.entry_for(&doc.path) {
        Some(entry) => Ok((doc, entry)),
        None => Err(StatusError::FileMissing(doc.path.display().to_string()).into()),
    }
}

async fn enqueue_upserts(ctx: &AppContext, entries: Vec<FileEntry>) -> Result<Vec<i64>> {
    let mut jobs = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = ctx
            .queue
            .enqueue(NewJob {
                document_id: entry.document_id,
                path: entry.path,
                category: entry.category,
                op: JobOp::Upsert,
            })
            .await?;
        jobs.push(id);
    }
    Ok(jobs)
}

// ============ Extracted content ============

/// The normalized text the indexer would chunk for a document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentContent {
    pub id: String,
    pub file_name: String,
    pub category: Category,
    pub content: String,
    /// 1-based page numbers whose text came from OCR.
    pub ocr_pages: Vec<usize>,
}

/// Extract a known document's current file the same way a worker does.
pub async fn document_content(ctx: &AppContext, id: &str) -> Result<DocumentContent> {
    let (doc, entry) = on_disk(ctx, id).await?;
    let unreadable = |reason: String| StatusError::Unreadable {
        id: doc.id.clone(),
        reason,
    };

    let limit = ctx.config.knowledge_base.max_file_bytes;
    if entry.size > limit {
        return Err(unreadable(format!("file is {} bytes, limit is {}", entry.size, limit)).into());
    }
    let bytes = match tokio::fs::read(&entry.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StatusError::FileMissing(entry.path.display().to_string()).into());
        }
        Err(e) => return Err(e.into()),
    };

    let extractors = ctx.extractors.clone();
    let path = entry.path.clone();
    let extraction = tokio::task::spawn_blocking(move || extractors.extract(&path, &bytes))
        .await?
        .map_err(|e| unreadable(e.to_string()))?;

    Ok(DocumentContent {
        id: doc.id,
        file_name: doc.file_name,
        category: doc.category,
        content: normalize_text(&extraction.text),
        ocr_pages: extraction.ocr_pages,
    })
}

// ============ Reset ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Drop chunks and vectors, keep document rows, re-index every file.
    Soft,
    /// Also forget every document row, tombstones and errors included.
    Hard,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub mode: ResetMode,
    pub chunks_removed: u64,
    pub documents_forgotten: u64,
    pub jobs: Vec<i64>,
}

/// Empty the index and rebuild it from the files on disk.
///
/// Files are never touched. Job rows stay because job ids are the document
/// versions; the upserts enqueued here supersede anything still pending.
pub async fn reset(ctx: &AppContext, mode: ResetMode) -> Result<ResetReport> {
    let mut tx = ctx.pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors")
        .execute(&mut *tx)
        .await?;
    let chunks_removed = sqlx::query("DELETE FROM chunks")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let documents_forgotten = match mode {
        ResetMode::Soft => {
            sqlx::query(
                "UPDATE documents SET status = 'pending', chunk_count = 0, content_hash = '',                  last_error = NULL WHERE status != 'deleted'",
            )
            .execute(&mut *tx)
            .await?;
            0
        }
        ResetMode::Hard => sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await?
            .rows_affected(),
    };
    tx.commit().await?;

    let scanner = ctx.scanner.clone();
    let entries = tokio::task::spawn_blocking(move || scanner.scan()).await??;
    let jobs = enqueue_upserts(ctx, entries).await?;

    tracing::info!(
        ?mode,
        chunks_removed,
        documents_forgotten,
        jobs = jobs.len(),
        "knowledge base reset"
    );
    Ok(ResetReport {
        mode,
        chunks_removed,
        documents_forgotten,
        jobs,
    })
}
