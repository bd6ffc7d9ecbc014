//! Keeps the index in step with the knowledge roots.
//!
//! [`reconcile`] is the authority: it hashes every eligible file, diffs the
//! result against the `documents` table and enqueues whatever is missing.
//! It runs at startup and on demand. Between reconciliations a
//! [`ChangeFeed`] reports individual changes, which pass through a
//! [`Debouncer`] and a content-hash check before becoming jobs.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connector_fs::{hash_file, FileEntry, Scanner};
use crate::context::AppContext;
use crate::index::DocumentMeta;
use crate::models::{Document, DocumentStatus, IndexingJob, JobOp, JobState, NewJob};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub upserts: usize,
    pub deletes: usize,
    pub unchanged: usize,
}

/// Diff the roots against the recorded documents and enqueue the
/// difference: `upsert` for new, changed, previously failed or never
/// finished files; `delete` for live documents whose file is gone.
pub async fn reconcile(ctx: &AppContext) -> Result<ReconcileReport> {
    let scanner = ctx.scanner.clone();
    let hashed = tokio::task::spawn_blocking(move || -> Result<Vec<(FileEntry, Option<String>)>> {
        let entries = scanner.scan()?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let hash = match hash_file(&entry.path) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        warn!(path = %entry.path.display(), error = %e, "cannot hash file");
                        None
                    }
                };
                (entry, hash)
            })
            .collect())
    })
    .await??;

    let documents: HashMap<String, Document> = ctx
        .index
        .documents()
        .await?
        .into_iter()
        .map(|d| (d.id.clone(), d))
        .collect();

    let mut report = ReconcileReport {
        scanned: hashed.len(),
        ..ReconcileReport::default()
    };
    let mut seen = HashSet::new();

    for (entry, hash) in &hashed {
        seen.insert(entry.document_id.as_str());
        let open = ctx.queue.open_job(&entry.document_id).await?;
        let stale = needs_upsert(
            documents.get(&entry.document_id),
            hash.as_deref(),
            open.as_ref(),
            true,
        );
        if !stale {
            report.unchanged += 1;
            continue;
        }

        ctx.index
            .ensure_document(&DocumentMeta {
                id: entry.document_id.clone(),
                path: entry.path.clone(),
                file_name: entry.file_name.clone(),
                category: entry.category,
                content_hash: String::new(),
                modified_at: entry.modified_at,
            })
            .await?;
        ctx.queue
            .enqueue(NewJob {
                document_id: entry.document_id.clone(),
                path: entry.path.clone(),
                category: entry.category,
                op: JobOp::Upsert,
            })
            .await?;
        report.upserts += 1;
    }

    for doc in documents.values() {
        if doc.status == DocumentStatus::Deleted || seen.contains(doc.id.as_str()) {
            continue;
        }
        if is_delete(ctx.queue.open_job(&doc.id).await?.as_ref()) {
            continue;
        }
        ctx.queue
            .enqueue(NewJob {
                document_id: doc.id.clone(),
                path: doc.path.clone(),
                category: doc.category,
                op: JobOp::Delete,
            })
            .await?;
        report.deletes += 1;
    }

    info!(
        scanned = report.scanned,
        upserts = report.upserts,
        deletes = report.deletes,
        unchanged = report.unchanged,
        "reconciliation finished"
    );
    Ok(report)
}

// ============ Change feed ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// A source of filesystem change notifications. May miss events;
/// reconciliation covers for it.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait for the next batch of changes. Must be cancel-safe.
    async fn next_batch(&mut self) -> Result<Vec<ChangeEvent>>;
}

/// Detects changes by comparing periodic snapshots of size and mtime.
pub struct PollingChangeFeed {
    scanner: Arc<Scanner>,
    interval: tokio::time::Interval,
    snapshot: Option<HashMap<PathBuf, (u64, SystemTime)>>,
}

impl PollingChangeFeed {
    pub fn new(scanner: Arc<Scanner>, interval: Duration) -> Self {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            scanner,
            interval,
            snapshot: None,
        }
    }

    /// Take a snapshot and return the changes since the previous one. The
    /// first call only records the baseline.
    pub async fn poll_once(&mut self) -> Result<Vec<ChangeEvent>> {
        let scanner = self.scanner.clone();
        let current = tokio::task::spawn_blocking(move || -> Result<HashMap<PathBuf, (u64, SystemTime)>> {
            Ok(scanner
                .scan()?
                .into_iter()
                .filter_map(|entry| {
                    let modified = std::fs::metadata(&entry.path).and_then(|m| m.modified()).ok()?;
                    Some((entry.path, (entry.size, modified)))
                })
                .collect())
        })
        .await??;

        let events = match &self.snapshot {
            Some(previous) => diff_snapshots(previous, &current),
            None => Vec::new(),
        };
        self.snapshot = Some(current);
        Ok(events)
    }
}

#[async_trait]
impl ChangeFeed for PollingChangeFeed {
    async fn next_batch(&mut self) -> Result<Vec<ChangeEvent>> {
        self.interval.tick().await;
        self.poll_once().await
    }
}

fn diff_snapshots(
    previous: &HashMap<PathBuf, (u64, SystemTime)>,
    current: &HashMap<PathBuf, (u64, SystemTime)>,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for (path, stamp) in current {
        let kind = match previous.get(path) {
            None => ChangeKind::Created,
            Some(old) if old != stamp => ChangeKind::Modified,
            Some(_) => continue,
        };
        events.push(ChangeEvent {
            kind,
            path: path.clone(),
        });
    }
    for path in previous.keys().filter(|p| !current.contains_key(*p)) {
        events.push(ChangeEvent {
            kind: ChangeKind::Removed,
            path: path.clone(),
        });
    }
    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

// ============ Debouncer ============

/// Collapses bursts of events on one path into a single change, released
/// once the path has been quiet for the debounce window.
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, (ChangeKind, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        let kind = match self.pending.get(&event.path) {
            Some((ChangeKind::Removed, _)) if event.kind == ChangeKind::Created => {
                ChangeKind::Modified
            }
            Some((ChangeKind::Created, _)) if event.kind == ChangeKind::Modified => {
                ChangeKind::Created
            }
            _ => event.kind,
        };
        self.pending.insert(event.path, (kind, now));
    }

    /// Events whose path has been quiet for the whole window, by path.
    pub fn ready(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let window = self.window;
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, last))| now.duration_since(*last) >= window)
            .map(|(path, _)| path.clone())
            .collect();

        let mut events: Vec<ChangeEvent> = due
            .into_iter()
            .filter_map(|path| {
                self.pending
                    .remove(&path)
                    .map(|(kind, _)| ChangeEvent { kind, path })
            })
            .collect();
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }

    /// When the earliest pending event becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.pending.values().map(|(_, last)| *last + self.window).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============ Watch loop ============

/// Turn one debounced change into a job, if it changes anything. Returns
/// the enqueued job id.
pub async fn apply_change(ctx: &AppContext, event: &ChangeEvent) -> Result<Option<i64>> {
    let Some((category, document_id)) = ctx.scanner.classify(&event.path) else {
        return Ok(None);
    };

    let path = event.path.clone();
    let current_hash = tokio::task::spawn_blocking(move || hash_file(&path).ok()).await?;
    let existing = ctx.index.document(&document_id).await?;
    let open = ctx.queue.open_job(&document_id).await?;

    let op = match current_hash {
        None => {
            // Removed, or vanished before we could read it.
            match &existing {
                Some(doc) if doc.status != DocumentStatus::Deleted && !is_delete(open.as_ref()) => {
                    JobOp::Delete
                }
                _ => return Ok(None),
            }
        }
        Some(hash) => {
            if !needs_upsert(existing.as_ref(), Some(hash.as_str()), open.as_ref(), false) {
                debug!(document = %document_id, "content unchanged or already queued, skipping");
                return Ok(None);
            }
            JobOp::Upsert
        }
    };

    if op == JobOp::Upsert && existing.is_none() {
        ctx.index
            .ensure_document(&DocumentMeta {
                id: document_id.clone(),
                path: event.path.clone(),
                file_name: file_name(&event.path),
                category,
                content_hash: String::new(),
                modified_at: 0,
            })
            .await?;
    }

    let id = ctx
        .queue
        .enqueue(NewJob {
            document_id: document_id.clone(),
            path: event.path.clone(),
            category,
            op,
        })
        .await?;
    info!(document = %document_id, op = op.as_str(), job = id, "change enqueued");
    Ok(Some(id))
}

/// Whether a file that exists with content `hash` needs an upsert job.
///
/// An unfinished delete always loses to a file that is back on disk. A
/// pending upsert reads the file when it runs, so a second one adds
/// nothing. Otherwise the stored row decides; `retry_failed` re-queues
/// failed documents even when their content is unchanged.
fn needs_upsert(
    doc: Option<&Document>,
    hash: Option<&str>,
    open: Option<&IndexingJob>,
    retry_failed: bool,
) -> bool {
    match open {
        Some(job) if job.op == JobOp::Delete => return true,
        Some(job) if job.state == JobState::Pending => return false,
        _ => {}
    }
    match doc {
        None => true,
        Some(doc) => match doc.status {
            DocumentStatus::Deleted | DocumentStatus::Pending => true,
            DocumentStatus::Failed => retry_failed || hash != Some(doc.content_hash.as_str()),
            DocumentStatus::Parsed => hash != Some(doc.content_hash.as_str()),
        },
    }
}

fn is_delete(job: Option<&IndexingJob>) -> bool {
    job.is_some_and(|j| j.op == JobOp::Delete)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Feed changes into the queue until `shutdown` flips to true.
pub async fn run(
    ctx: AppContext,
    mut feed: Box<dyn ChangeFeed>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut debouncer = Debouncer::new(Duration::from_millis(ctx.config.watcher.debounce_ms));
    info!("watching knowledge roots");

    loop {
        let wake = debouncer.next_ready_at().map(tokio::time::Instant::from_std);
        tokio::select! {
            batch = feed.next_batch() => match batch {
                Ok(events) => {
                    let now = Instant::now();
                    for event in events {
                        debouncer.push(event, now);
                    }
                }
                Err(e) => warn!(error = %e, "change feed failed"),
            },
            _ = sleep_until(wake) => {}
            _ = shutdown.changed() => break,
        }

        for event in debouncer.ready(Instant::now()) {
            if let Err(e) = apply_change(&ctx, &event).await {
                warn!(path = %event.path.display(), error = %e, "could not enqueue change");
            }
        }
    }

    info!("watcher stopped");
    Ok(())
}

async fn sleep_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
