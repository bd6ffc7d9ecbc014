//! Indexing worker pool.
//!
//! Each worker claims one job from the [`JobQueue`], runs it to the end
//! (read → extract → chunk → embed → index) and only then claims the next.
//! Idle workers park on the queue's `Notify` with a poll interval as a
//! backstop. Failures are classified and recorded; they never stop a
//! worker.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chunk::{chunk_text, normalize_text};
use crate::connector_fs::{hash_bytes, modified_secs};
use crate::context::AppContext;
use crate::embedding::embed_in_batches;
use crate::error::{PipelineError, Result};
use crate::index::{DocumentMeta, UpsertStats};
use crate::models::{Chunk, IndexingJob, JobOp};
use crate::queue::RetryDecision;

/// How one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Indexed { stats: UpsertStats, ocr_pages: usize },
    Deleted { removed: usize },
    /// Permanent error; the document is marked `failed`.
    Failed(String),
    Retry(Duration),
    Dead(String),
    /// A newer version of the document was already applied.
    Superseded,
    /// The lease expired and another claim owns the job now.
    LeaseLost,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Start `queue.workers` workers on the current runtime.
    pub fn spawn(ctx: AppContext) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..ctx.config.queue.workers)
            .map(|id| tokio::spawn(worker_loop(id, ctx.clone(), rx.clone())))
            .collect();
        info!(workers = ctx.config.queue.workers, "worker pool started");
        Self { handles, shutdown }
    }

    /// Let running jobs finish, then stop every worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(id: usize, ctx: AppContext, mut shutdown: watch::Receiver<bool>) {
    let notify = ctx.queue.notifier();
    let idle = Duration::from_millis(ctx.config.queue.idle_poll_ms);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.queue.claim().await {
            Ok(Some(job)) => {
                debug!(worker = id, job = job.id, document = %job.document_id, "claimed");
                if let Err(e) = run_job(&ctx, &job).await {
                    // Bookkeeping failed; the lease expires and the job is redelivered.
                    error!(worker = id, job = job.id, error = %e, "could not record job result");
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(worker = id, error = %e, "claim failed"),
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(idle) => {}
            _ = shutdown.changed() => {}
        }
    }
    debug!(worker = id, "worker exiting");
}

/// Run every job that is runnable right now on the calling task, one after
/// another. Jobs waiting on a backoff delay are left in the queue.
pub async fn drain(ctx: &AppContext) -> Result<Vec<JobOutcome>> {
    let mut outcomes = Vec::new();
    while let Some(job) = ctx.queue.claim().await? {
        outcomes.push(run_job(ctx, &job).await?);
    }
    Ok(outcomes)
}

/// Process a claimed job and settle it in the queue. The returned error is
/// only about recording the result, never about the job itself.
pub async fn run_job(ctx: &AppContext, job: &IndexingJob) -> Result<JobOutcome> {
    let mut meta = meta_for(job);
    let result = process_job(ctx, job, &mut meta).await;

    let outcome = match result {
        Ok(outcome) => {
            if !ctx.queue.complete(job).await? {
                return Ok(JobOutcome::LeaseLost);
            }
            outcome
        }
        Err(PipelineError::IndexConsistency {
            attempted, applied, ..
        }) => {
            info!(
                job = job.id,
                document = %job.document_id,
                attempted,
                applied,
                "stale write dropped"
            );
            if !ctx.queue.mark_superseded(job).await? {
                return Ok(JobOutcome::LeaseLost);
            }
            JobOutcome::Superseded
        }
        Err(e) if e.is_retryable() => {
            let message = e.to_string();
            warn!(job = job.id, document = %job.document_id, attempt = job.attempts, error = %message, "job failed");
            ctx.index.note_error(&job.document_id, &message).await?;
            match ctx.queue.retry_later(job, &message).await? {
                RetryDecision::Retry(delay) => JobOutcome::Retry(delay),
                RetryDecision::Dead => JobOutcome::Dead(message),
                RetryDecision::Superseded => JobOutcome::Superseded,
                RetryDecision::LeaseLost => JobOutcome::LeaseLost,
            }
        }
        Err(e) => {
            let message = e.to_string();
            warn!(job = job.id, document = %job.document_id, error = %message, "document failed");
            match ctx.index.mark_failed(&meta, job.version(), &message).await {
                Ok(_) => {}
                Err(PipelineError::IndexConsistency { .. }) => {
                    if !ctx.queue.mark_superseded(job).await? {
                        return Ok(JobOutcome::LeaseLost);
                    }
                    return Ok(JobOutcome::Superseded);
                }
                Err(other) => return Err(other),
            }
            if !ctx.queue.fail_permanently(job, &message).await? {
                return Ok(JobOutcome::LeaseLost);
            }
            JobOutcome::Failed(message)
        }
    };

    debug!(job = job.id, document = %job.document_id, outcome = ?outcome, "job settled");
    Ok(outcome)
}

fn meta_for(job: &IndexingJob) -> DocumentMeta {
    DocumentMeta {
        id: job.document_id.clone(),
        path: job.path.clone(),
        file_name: file_name(&job.path),
        category: job.category,
        content_hash: String::new(),
        modified_at: 0,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// The job body. Fills `meta` with the file's hash and mtime as soon as
/// they are known so a failure is recorded against the right content.
async fn process_job(
    ctx: &AppContext,
    job: &IndexingJob,
    meta: &mut DocumentMeta,
) -> Result<JobOutcome> {
    let version = job.version();

    if let Some(doc) = ctx.index.document(&job.document_id).await? {
        if doc.applied_version >= version {
            return Err(PipelineError::IndexConsistency {
                document_id: doc.id,
                attempted: version,
                applied: doc.applied_version,
            });
        }
    }

    if job.op == JobOp::Delete {
        if ctx.scanner.entry_for(&job.path).is_none() {
            let removed = ctx.index.delete(meta, version).await?;
            info!(document = %meta.id, removed, "document removed from index");
            return Ok(JobOutcome::Deleted { removed });
        }
        // Recreated after the delete was queued: index what is there now.
        info!(document = %meta.id, "file is back, indexing instead of deleting");
    }

    let bytes = match tokio::fs::read(&job.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Gone before we got to it: same as a delete.
            let removed = ctx.index.delete(meta, version).await?;
            info!(document = %meta.id, removed, "file vanished, document removed");
            return Ok(JobOutcome::Deleted { removed });
        }
        Err(e) => return Err(e.into()),
    };
    meta.content_hash = hash_bytes(&bytes);
    if let Ok(metadata) = tokio::fs::metadata(&job.path).await {
        meta.modified_at = modified_secs(&metadata);
    }

    let limit = ctx.config.knowledge_base.max_file_bytes;
    if bytes.len() as u64 > limit {
        return Err(PipelineError::Parse(format!(
            "file is {} bytes, limit is {}",
            bytes.len(),
            limit
        )));
    }

    let extractors = ctx.extractors.clone();
    let path = job.path.clone();
    let extraction = tokio::task::spawn_blocking(move || extractors.extract(&path, &bytes))
        .await
        .map_err(|e| PipelineError::Parse(format!("extractor crashed: {}", e)))??;

    let text = normalize_text(&extraction.text);
    if text.is_empty() {
        return Err(PipelineError::Parse("no extractable text".to_string()));
    }

    let chunking = &ctx.config.chunking;
    let chunks = chunk_text(&meta.id, &text, chunking.max_chars, chunking.overlap_chars);

    let model = ctx.embedder.model_name();
    let existing = ctx.index.existing_chunks(&meta.id, model).await?;
    let changed: Vec<&Chunk> = chunks
        .iter()
        .filter(|c| existing.get(&c.id) != Some(&c.hash))
        .collect();
    let texts: Vec<String> = changed.iter().map(|c| c.text.clone()).collect();
    let embedded = embed_in_batches(
        ctx.embedder.as_ref(),
        &texts,
        ctx.config.embedding.batch_size,
    )
    .await?;
    let vectors: HashMap<String, Vec<f32>> = changed
        .iter()
        .map(|c| c.id.clone())
        .zip(embedded)
        .collect();

    let stats = ctx
        .index
        .upsert(meta, version, model, &chunks, &vectors)
        .await?;
    info!(
        document = %meta.id,
        version,
        chunks = chunks.len(),
        embedded = vectors.len(),
        ocr_pages = extraction.ocr_pages.len(),
        "document indexed"
    );
    Ok(JobOutcome::Indexed {
        stats,
        ocr_pages: extraction.ocr_pages.len(),
    })
}
