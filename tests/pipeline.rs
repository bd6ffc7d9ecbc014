use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use knowledge_harness::answer::{AnswerError, Language, QueryRequest};
use knowledge_harness::chunk::{chunk_text, normalize_text};
use knowledge_harness::config::{self, Config};
use knowledge_harness::context::AppContext;
use knowledge_harness::embedding::{create_embedder, embed_query, Embedder, HashEmbedder};
use knowledge_harness::error::PipelineError;
use knowledge_harness::generation::{ExtractiveGenerator, Generator, Prompt};
use knowledge_harness::index::DocumentMeta;
use knowledge_harness::models::{Category, Chunk, DocumentStatus, JobOp, NewJob};
use knowledge_harness::status::{self, ResetMode, StatusError, Target};
use knowledge_harness::watcher::{self, ChangeEvent, ChangeKind};
use knowledge_harness::worker::{self, JobOutcome, WorkerPool};

const REPORT: &str = "Acme Robotics was founded in Lyon by two engineers. The company designs \
warehouse automation systems for mid-sized retailers.\u{0c}Financial summary. Annual revenue \
was $4.2M in 2024. Operating costs were stable and the team grew to forty people.";

struct Harness {
    _tmp: TempDir,
    internal: PathBuf,
    external: PathBuf,
    config: Config,
    ctx: AppContext,
}

fn write_config(root: &Path) -> PathBuf {
    let content = format!(
        r#"[db]
path = "{root}/data/kh.sqlite"

[knowledge_base]
internal_root = "{root}/kb/internal"
external_root = "{root}/kb/external"

[chunking]
max_chars = 200
overlap_chars = 40

[parser]
ocr_enabled = false

[queue]
workers = 2
max_attempts = 2
initial_backoff_ms = 0
max_backoff_ms = 0
idle_poll_ms = 50

[retrieval]
min_relevance = 0.2
"#,
        root = root.display()
    );
    let path = root.join("kh.toml");
    fs::write(&path, content).unwrap();
    path
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let internal = tmp.path().join("kb/internal");
    let external = tmp.path().join("kb/external");
    fs::create_dir_all(&internal).unwrap();
    fs::create_dir_all(&external).unwrap();

    let config = config::load_config(&write_config(tmp.path())).unwrap();
    let ctx = AppContext::open(&config).await.unwrap();
    Harness {
        _tmp: tmp,
        internal,
        external,
        config,
        ctx,
    }
}

impl Harness {
    /// Same database and roots, different providers.
    fn with_providers(&self, embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> AppContext {
        AppContext::from_parts(&self.config, self.ctx.pool.clone(), embedder, generator).unwrap()
    }

    async fn sync(&self) -> Vec<JobOutcome> {
        watcher::reconcile(&self.ctx).await.unwrap();
        worker::drain(&self.ctx).await.unwrap()
    }

    /// Leave the job leased with a lapsed lease, as a crashed worker would.
    async fn lapse_lease(&self, job_id: i64) {
        sqlx::query("UPDATE jobs SET state = 'leased', lease_expires_at = 0 WHERE id = ?")
            .bind(job_id)
            .execute(&self.ctx.pool)
            .await
            .unwrap();
    }

    async fn ask(&self, query: &str) -> knowledge_harness::answer::QueryResponse {
        self.ctx
            .composer()
            .answer(QueryRequest::new(query))
            .await
            .unwrap()
    }
}

/// Fails every call, but claims the hash embedder's vector space.
struct DownEmbedder(HashEmbedder);

#[async_trait]
impl Embedder for DownEmbedder {
    fn model_name(&self) -> &str {
        self.0.model_name()
    }
    fn dims(&self) -> usize {
        self.0.dims()
    }
    async fn embed(&self, _texts: &[String]) -> knowledge_harness::error::Result<Vec<Vec<f32>>> {
        Err(PipelineError::EmbeddingService("503 Service Unavailable".to_string()))
    }
}

struct SlowGenerator;

#[async_trait]
impl Generator for SlowGenerator {
    fn name(&self) -> &str {
        "slow"
    }
    async fn generate(&self, _prompt: &Prompt) -> knowledge_harness::error::Result<String> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok("too late".to_string())
    }
}

// ============ End-to-end scenarios ============

#[tokio::test]
async fn answers_with_figure_and_citation() {
    let h = harness().await;
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();

    let outcomes = h.sync().await;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Indexed { .. }]));

    let response = h.ask("What was the annual revenue?").await;
    assert!(response.grounded);
    assert!(response.answer.contains("$4.2M"), "answer: {}", response.answer);
    assert_eq!(response.sources, vec!["annual-report.txt"]);
    assert_eq!(response.language, Language::English);
}

#[tokio::test]
async fn deleted_file_is_no_longer_cited() {
    let h = harness().await;
    let path = h.internal.join("annual-report.txt");
    fs::write(&path, REPORT).unwrap();
    h.sync().await;
    assert_eq!(h.ask("What was the annual revenue?").await.sources, vec!["annual-report.txt"]);

    fs::remove_file(&path).unwrap();
    let outcomes = h.sync().await;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Deleted { removed }] if *removed > 0));

    let response = h.ask("What was the annual revenue?").await;
    assert!(!response.sources.contains(&"annual-report.txt".to_string()));
    let doc = status::document_status(&h.ctx, "internal/annual-report.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Deleted);
}

#[tokio::test]
async fn corrupt_pdf_fails_without_blocking_others() {
    let h = harness().await;
    fs::write(
        h.external.join("broken.pdf"),
        b"%PDF-1.7\n1 0 obj << /Type /Catalog >>\nthis is not really a pdf\n%%EOF",
    )
    .unwrap();
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();

    let outcomes = h.sync().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().any(|o| matches!(o, JobOutcome::Failed(_))));
    assert!(outcomes.iter().any(|o| matches!(o, JobOutcome::Indexed { .. })));

    let broken = status::document_status(&h.ctx, "external/broken.pdf")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broken.status, DocumentStatus::Failed);
    assert!(broken.last_error.is_some());
    assert_eq!(h.ctx.index.vector_count("external/broken.pdf").await.unwrap(), 0);

    let report = status::document_status(&h.ctx, "internal/annual-report.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, DocumentStatus::Parsed);
    assert!(h.ask("What was the annual revenue?").await.grounded);
}

#[tokio::test]
async fn unrelated_question_gets_no_grounded_answer() {
    let h = harness().await;
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();
    h.sync().await;

    let response = h.ask("How do penguins survive antarctic winters?").await;
    assert!(!response.grounded);
    assert_eq!(response.answer, Language::English.no_answer());
    assert!(response.sources.is_empty());
    assert!(response.chunk_ids.is_empty());
}

#[tokio::test]
async fn french_question_on_empty_index() {
    let h = harness().await;
    let response = h.ask("Quelle est la politique de télétravail ?").await;
    assert!(!response.grounded);
    assert_eq!(response.language, Language::French);
    assert_eq!(response.answer, Language::French.no_answer());
}

// ============ Index properties ============

#[tokio::test]
async fn reindexing_unchanged_content_is_a_noop() {
    let h = harness().await;
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();
    h.sync().await;
    let id = "internal/annual-report.txt";
    let before = h.ctx.index.chunks(id).await.unwrap();
    assert!(before.len() >= 2);

    // A touch is not a change.
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();
    assert_eq!(watcher::reconcile(&h.ctx).await.unwrap().upserts, 0);

    // A forced re-index re-reads the file but writes nothing.
    status::reindex(&h.ctx, Target::Document(id.to_string())).await.unwrap();
    let outcomes = worker::drain(&h.ctx).await.unwrap();
    match outcomes.as_slice() {
        [JobOutcome::Indexed { stats, .. }] => {
            assert_eq!(stats.written, 0);
            assert_eq!(stats.removed, 0);
            assert_eq!(stats.unchanged, before.len());
        }
        other => panic!("unexpected outcomes: {:?}", other),
    }
    assert_eq!(h.ctx.index.chunks(id).await.unwrap(), before);
    assert_eq!(h.ctx.index.vector_count(id).await.unwrap(), before.len() as i64);
}

#[tokio::test]
async fn indexed_document_is_retrievable_until_deleted() {
    let h = harness().await;
    fs::write(h.external.join("faq.md"), "# Support\n\nRefunds are processed within ten business days.").unwrap();
    h.sync().await;

    let embedder = h.ctx.embedder.clone();
    let query = embed_query(embedder.as_ref(), "How long do refunds take?").await.unwrap();
    let hits = h
        .ctx
        .index
        .search(&query, embedder.model_name(), 5, None)
        .await
        .unwrap();
    assert!(hits.iter().any(|hit| hit.document_id == "external/faq.md"));
    let internal_only = h
        .ctx
        .index
        .search(&query, embedder.model_name(), 5, Some(Category::Internal))
        .await
        .unwrap();
    assert!(internal_only.is_empty());

    fs::remove_file(h.external.join("faq.md")).unwrap();
    h.sync().await;
    let hits = h
        .ctx
        .index
        .search(&query, embedder.model_name(), 5, None)
        .await
        .unwrap();
    assert!(hits.iter().all(|hit| hit.document_id != "external/faq.md"));
}

#[tokio::test]
async fn redelivered_job_leaves_the_same_state() {
    let h = harness().await;
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();
    watcher::reconcile(&h.ctx).await.unwrap();
    let job = h.ctx.queue.claim().await.unwrap().unwrap();

    let first = worker::run_job(&h.ctx, &job).await.unwrap();
    assert!(matches!(first, JobOutcome::Indexed { .. }));
    let chunks = h.ctx.index.chunks(&job.document_id).await.unwrap();
    let doc = h.ctx.index.document(&job.document_id).await.unwrap().unwrap();

    // The worker died before its completion was recorded.
    h.lapse_lease(job.id).await;
    let redelivered = h.ctx.queue.claim().await.unwrap().unwrap();
    assert_eq!(redelivered.id, job.id);
    assert_eq!(redelivered.attempts, 2);

    let second = worker::run_job(&h.ctx, &redelivered).await.unwrap();
    assert_eq!(second, JobOutcome::Superseded);
    assert_eq!(h.ctx.index.chunks(&job.document_id).await.unwrap(), chunks);
    let again = h.ctx.index.document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(again.applied_version, doc.applied_version);
    assert_eq!(again.content_hash, doc.content_hash);
}

#[tokio::test]
async fn older_version_never_overwrites_newer() {
    let h = harness().await;
    let embedder = HashEmbedder::new(256);
    let meta = DocumentMeta {
        id: "internal/policy.txt".to_string(),
        path: h.internal.join("policy.txt"),
        file_name: "policy.txt".to_string(),
        category: Category::Internal,
        content_hash: "v".to_string(),
        modified_at: 1,
    };
    let write = |version: i64, text: &str| {
        let chunks = chunk_text(&meta.id, &normalize_text(text), 200, 40);
        let vectors: HashMap<String, Vec<f32>> = chunks
            .iter()
            .map(|c| (c.id.clone(), embedder.embed_one(&c.text)))
            .collect();
        (version, chunks, vectors)
    };

    let (v2, chunks2, vectors2) = write(2, "Remote work is allowed three days a week.");
    let (v1, chunks1, vectors1) = write(1, "Remote work is not allowed.");

    h.ctx
        .index
        .upsert(&meta, v2, embedder.model_name(), &chunks2, &vectors2)
        .await
        .unwrap();
    let stale = h
        .ctx
        .index
        .upsert(&meta, v1, embedder.model_name(), &chunks1, &vectors1)
        .await;
    assert!(matches!(
        stale,
        Err(PipelineError::IndexConsistency { attempted: 1, applied: 2, .. })
    ));

    let stored = h.ctx.index.chunks(&meta.id).await.unwrap();
    assert_eq!(stored, chunks2);

    // A late delete is just as stale.
    assert!(h.ctx.index.delete(&meta, v1).await.is_err());
    assert_eq!(h.ctx.index.vector_count(&meta.id).await.unwrap(), 1);
}

#[tokio::test]
async fn stale_job_is_dropped_by_the_worker() {
    let h = harness().await;
    let path = h.internal.join("policy.txt");
    fs::write(&path, "Remote work is not allowed.").unwrap();
    let new_job = || NewJob {
        document_id: "internal/policy.txt".to_string(),
        path: path.clone(),
        category: Category::Internal,
        op: JobOp::Upsert,
    };

    let v1 = h.ctx.queue.enqueue(new_job()).await.unwrap();
    let old = h.ctx.queue.claim().await.unwrap().unwrap();
    assert_eq!(old.id, v1);

    fs::write(&path, "Remote work is allowed three days a week.").unwrap();
    let v2 = h.ctx.queue.enqueue(new_job()).await.unwrap();

    // The first worker stalls past its lease; v1 is redelivered, then v2 runs.
    h.lapse_lease(v1).await;
    let outcomes = worker::drain(&h.ctx).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| matches!(o, JobOutcome::Indexed { .. })));

    // The stalled worker finally gets to run its copy of v1.
    assert_eq!(worker::run_job(&h.ctx, &old).await.unwrap(), JobOutcome::LeaseLost);

    let doc = h.ctx.index.document("internal/policy.txt").await.unwrap().unwrap();
    assert_eq!(doc.applied_version, v2);
    let chunks = h.ctx.index.chunks("internal/policy.txt").await.unwrap();
    assert!(chunks[0].text.contains("three days"));
}

#[tokio::test]
async fn worker_drops_stale_version_it_still_holds() {
    let h = harness().await;
    let path = h.internal.join("policy.txt");
    fs::write(&path, "Remote work is allowed three days a week.").unwrap();
    let job = NewJob {
        document_id: "internal/policy.txt".to_string(),
        path: path.clone(),
        category: Category::Internal,
        op: JobOp::Upsert,
    };
    let v1 = h.ctx.queue.enqueue(job).await.unwrap();
    let claimed = h.ctx.queue.claim().await.unwrap().unwrap();

    // A newer version lands directly in the index while v1 is in flight.
    let embedder = HashEmbedder::new(256);
    let meta = DocumentMeta {
        id: "internal/policy.txt".to_string(),
        path: path.clone(),
        file_name: "policy.txt".to_string(),
        category: Category::Internal,
        content_hash: "v2".to_string(),
        modified_at: 1,
    };
    let chunks = chunk_text(&meta.id, "Remote work is allowed every day.", 200, 40);
    let vectors: HashMap<String, Vec<f32>> = chunks
        .iter()
        .map(|c| (c.id.clone(), embedder.embed_one(&c.text)))
        .collect();
    h.ctx
        .index
        .upsert(&meta, v1 + 1, embedder.model_name(), &chunks, &vectors)
        .await
        .unwrap();

    assert_eq!(worker::run_job(&h.ctx, &claimed).await.unwrap(), JobOutcome::Superseded);
    let stored = h.ctx.index.chunks("internal/policy.txt").await.unwrap();
    assert_eq!(stored, chunks);
}

#[tokio::test]
async fn recreated_file_survives_queued_delete() {
    let h = harness().await;
    let path = h.internal.join("annual-report.txt");
    fs::write(&path, REPORT).unwrap();
    h.sync().await;

    let event = |kind| ChangeEvent {
        kind,
        path: path.clone(),
    };
    fs::remove_file(&path).unwrap();
    assert!(watcher::apply_change(&h.ctx, &event(ChangeKind::Removed))
        .await
        .unwrap()
        .is_some());

    // Same bytes come back before the delete runs.
    fs::write(&path, REPORT).unwrap();
    assert!(watcher::apply_change(&h.ctx, &event(ChangeKind::Created))
        .await
        .unwrap()
        .is_some());
    // The queued upsert already covers a further edit.
    assert_eq!(
        watcher::apply_change(&h.ctx, &event(ChangeKind::Modified)).await.unwrap(),
        None
    );

    let outcomes = worker::drain(&h.ctx).await.unwrap();
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Indexed { .. }]));
    let doc = h.ctx.index.document("internal/annual-report.txt").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Parsed);
    let response = h.ask("What was the annual revenue?").await;
    assert!(response.grounded);
    assert_eq!(response.sources, vec!["annual-report.txt"]);
}

#[tokio::test]
async fn delete_job_indexes_file_that_came_back() {
    let h = harness().await;
    let path = h.internal.join("annual-report.txt");
    fs::write(&path, REPORT).unwrap();
    h.sync().await;

    // Queued while the file was briefly gone; nothing else noticed the return.
    h.ctx
        .queue
        .enqueue(NewJob {
            document_id: "internal/annual-report.txt".to_string(),
            path: path.clone(),
            category: Category::Internal,
            op: JobOp::Delete,
        })
        .await
        .unwrap();

    let outcomes = worker::drain(&h.ctx).await.unwrap();
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Indexed { .. }]));
    let doc = h.ctx.index.document("internal/annual-report.txt").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Parsed);
    assert!(doc.chunk_count > 0);
}

#[tokio::test]
async fn reconcile_overrides_delete_for_file_on_disk() {
    let h = harness().await;
    let path = h.internal.join("annual-report.txt");
    fs::write(&path, REPORT).unwrap();
    h.sync().await;

    h.ctx
        .queue
        .enqueue(NewJob {
            document_id: "internal/annual-report.txt".to_string(),
            path: path.clone(),
            category: Category::Internal,
            op: JobOp::Delete,
        })
        .await
        .unwrap();
    let report = watcher::reconcile(&h.ctx).await.unwrap();
    assert_eq!(report.upserts, 1);

    let outcomes = worker::drain(&h.ctx).await.unwrap();
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Indexed { .. }]));
}

#[tokio::test]
async fn readers_never_see_a_half_written_document() {
    let h = harness().await;
    let embedder = Arc::new(HashEmbedder::new(256));
    let meta = DocumentMeta {
        id: "internal/handbook.txt".to_string(),
        path: h.internal.join("handbook.txt"),
        file_name: "handbook.txt".to_string(),
        category: Category::Internal,
        content_hash: String::new(),
        modified_at: 1,
    };
    // Two generations of the same document with different chunk counts.
    let generation = |tag: &str, sections: usize| {
        let text = (0..sections)
            .map(|i| format!("Section {} of the handbook, edition {}. Vacation policy applies.", i, tag))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&meta.id, &normalize_text(&text), 200, 40);
        let vectors: HashMap<String, Vec<f32>> = chunks
            .iter()
            .map(|c| (c.id.clone(), embedder.embed_one(&c.text)))
            .collect();
        (chunks, vectors)
    };
    let (first, first_vectors) = generation("alpha", 4);
    let (second, second_vectors) = generation("omega", 7);
    assert_ne!(first.len(), second.len());

    let model = embedder.model_name().to_string();
    h.ctx
        .index
        .upsert(&meta, 1, &model, &first, &first_vectors)
        .await
        .unwrap();

    let as_set = |chunks: &[Chunk]| -> HashSet<(String, String)> {
        chunks.iter().map(|c| (c.id.clone(), c.text.clone())).collect()
    };
    let first_set = as_set(&first);
    let second_set = as_set(&second);

    let writer = {
        let index = h.ctx.index.clone();
        let meta = meta.clone();
        let model = model.clone();
        let editions = [(first, first_vectors), (second, second_vectors)];
        tokio::spawn(async move {
            for version in 2..40i64 {
                let (chunks, vectors) = &editions[(version % 2) as usize];
                index
                    .upsert(&meta, version, &model, chunks, vectors)
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let query = embed_query(embedder.as_ref(), "vacation policy handbook").await.unwrap();
    let mut reads = 0;
    while !writer.is_finished() || reads == 0 {
        let hits = h.ctx.index.search(&query, &model, 100, None).await.unwrap();
        let seen: HashSet<(String, String)> = hits
            .into_iter()
            .map(|hit| (hit.chunk_id, hit.text))
            .collect();
        assert!(
            seen == first_set || seen == second_set,
            "read mixed two editions: {} chunks",
            seen.len()
        );
        reads += 1;
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
}

// ============ Content view and reset ============

#[tokio::test]
async fn content_view_shows_the_extracted_text() {
    let h = harness().await;
    let path = h.internal.join("annual-report.txt");
    fs::write(&path, REPORT).unwrap();
    h.sync().await;

    let content = status::document_content(&h.ctx, "internal/annual-report.txt")
        .await
        .unwrap();
    assert_eq!(content.file_name, "annual-report.txt");
    assert_eq!(content.category, Category::Internal);
    assert!(content.content.contains("Annual revenue was $4.2M in 2024."));
    assert!(content.ocr_pages.is_empty());

    let err = status::document_content(&h.ctx, "internal/missing.txt")
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<StatusError>(), Some(StatusError::NotFound(_))));

    fs::remove_file(&path).unwrap();
    let err = status::document_content(&h.ctx, "internal/annual-report.txt")
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<StatusError>(), Some(StatusError::FileMissing(_))));
}

#[tokio::test]
async fn reindex_of_unknown_document_is_typed_not_found() {
    let h = harness().await;
    let err = status::reindex(&h.ctx, Target::Document("external/nope.md".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StatusError>(),
        Some(StatusError::NotFound(id)) if id == "external/nope.md"
    ));
}

#[tokio::test]
async fn soft_reset_rebuilds_every_document_from_disk() {
    let h = harness().await;
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();
    fs::write(h.external.join("faq.md"), "# Support\n\nRefunds are processed within ten business days.").unwrap();
    h.sync().await;
    let id = "internal/annual-report.txt";
    let before = h.ctx.index.chunks(id).await.unwrap();

    let report = status::reset(&h.ctx, ResetMode::Soft).await.unwrap();
    assert_eq!(report.chunks_removed, before.len() as u64 + 1);
    assert_eq!(report.documents_forgotten, 0);
    assert_eq!(report.jobs.len(), 2);
    assert!(h.ctx.index.chunks(id).await.unwrap().is_empty());
    assert_eq!(h.ctx.index.vector_count(id).await.unwrap(), 0);
    let doc = status::document_status(&h.ctx, id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    let outcomes = worker::drain(&h.ctx).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, JobOutcome::Indexed { stats, .. } if stats.unchanged == 0)));
    assert_eq!(h.ctx.index.chunks(id).await.unwrap(), before);
    assert_eq!(h.ask("What was the annual revenue?").await.sources, vec!["annual-report.txt"]);
}

#[tokio::test]
async fn hard_reset_forgets_tombstones_but_keeps_files() {
    let h = harness().await;
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();
    fs::write(h.external.join("old.txt"), "Legacy pricing sheet.").unwrap();
    h.sync().await;
    fs::remove_file(h.external.join("old.txt")).unwrap();
    h.sync().await;
    assert_eq!(status::list_status(&h.ctx).await.unwrap().len(), 2);

    let report = status::reset(&h.ctx, ResetMode::Hard).await.unwrap();
    assert_eq!(report.documents_forgotten, 2);
    assert_eq!(report.jobs.len(), 1);
    assert!(status::list_status(&h.ctx).await.unwrap().is_empty());
    assert!(h.internal.join("annual-report.txt").exists());

    worker::drain(&h.ctx).await.unwrap();
    let ids: Vec<String> = status::list_status(&h.ctx)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec!["internal/annual-report.txt"]);
    assert!(h.ask("What was the annual revenue?").await.grounded);
}

#[tokio::test]
async fn chunking_is_deterministic() {
    let text = normalize_text(&REPORT.repeat(4));
    let a = chunk_text("internal/annual-report.txt", &text, 200, 40);
    let b = chunk_text("internal/annual-report.txt", &text, 200, 40);
    assert_eq!(a, b);
}

// ============ Failure handling ============

#[tokio::test]
async fn embedding_outage_dead_letters_and_keeps_old_records() {
    let h = harness().await;
    let path = h.internal.join("annual-report.txt");
    fs::write(&path, REPORT).unwrap();
    h.sync().await;
    let id = "internal/annual-report.txt";
    let indexed = h.ctx.index.chunks(id).await.unwrap();

    fs::write(&path, format!("{}\n\nHeadcount is now fifty.", REPORT)).unwrap();
    let hash_embedder = create_embedder(&h.config.embedding).unwrap();
    let model = hash_embedder.model_name().to_string();
    let dims = hash_embedder.dims();
    let down = h.with_providers(
        Arc::new(DownEmbedder(HashEmbedder::new(dims))),
        Arc::new(ExtractiveGenerator),
    );
    assert_eq!(down.embedder.model_name(), model);

    watcher::reconcile(&down).await.unwrap();
    let outcomes = worker::drain(&down).await.unwrap();
    assert!(matches!(
        outcomes.as_slice(),
        [JobOutcome::Retry(_), JobOutcome::Dead(_)]
    ));

    let dead = down.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);

    let doc = h.ctx.index.document(id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Parsed);
    assert!(doc.last_error.unwrap().contains("503"));
    assert_eq!(h.ctx.index.chunks(id).await.unwrap(), indexed);
    assert!(h.ask("What was the annual revenue?").await.grounded);
}

#[tokio::test]
async fn slow_generation_hits_the_deadline() {
    let h = harness().await;
    fs::write(h.internal.join("annual-report.txt"), REPORT).unwrap();
    h.sync().await;

    let slow = h.with_providers(h.ctx.embedder.clone(), Arc::new(SlowGenerator));
    let request = QueryRequest {
        timeout_ms: Some(50),
        ..QueryRequest::new("What was the annual revenue?")
    };
    let result = slow.composer().answer(request).await;
    assert!(matches!(
        result,
        Err(AnswerError::Pipeline(PipelineError::RetrievalTimeout(50)))
    ));
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let h = harness().await;
    let result = h.ctx.composer().answer(QueryRequest::new("   ")).await;
    assert!(matches!(result, Err(AnswerError::EmptyQuery)));
}

// ============ Watcher and workers ============

#[tokio::test]
async fn change_events_skip_touches() {
    let h = harness().await;
    let path = h.internal.join("annual-report.txt");
    fs::write(&path, REPORT).unwrap();
    h.sync().await;

    let event = |kind| ChangeEvent {
        kind,
        path: path.clone(),
    };
    fs::write(&path, REPORT).unwrap();
    assert_eq!(watcher::apply_change(&h.ctx, &event(ChangeKind::Modified)).await.unwrap(), None);

    fs::write(&path, "Annual revenue was restated to $4.0M.").unwrap();
    assert!(watcher::apply_change(&h.ctx, &event(ChangeKind::Modified))
        .await
        .unwrap()
        .is_some());

    let outside = ChangeEvent {
        kind: ChangeKind::Created,
        path: PathBuf::from("/elsewhere/notes.txt"),
    };
    assert_eq!(watcher::apply_change(&h.ctx, &outside).await.unwrap(), None);
}

#[tokio::test]
async fn worker_pool_drains_the_queue() {
    let h = harness().await;
    for i in 0..5 {
        fs::write(
            h.internal.join(format!("note-{}.txt", i)),
            format!("Meeting note {} about the quarterly roadmap.", i),
        )
        .unwrap();
    }

    let pool = WorkerPool::spawn(h.ctx.clone());
    let report = watcher::reconcile(&h.ctx).await.unwrap();
    assert_eq!(report.upserts, 5);
    assert!(h.ctx.queue.wait_idle(Duration::from_secs(20)).await.unwrap());
    pool.shutdown().await;

    let docs = status::list_status(&h.ctx).await.unwrap();
    assert_eq!(docs.len(), 5);
    assert!(docs.iter().all(|d| d.status == DocumentStatus::Parsed));
    assert_eq!(h.ctx.queue.stats().await.unwrap().done, 5);
}
