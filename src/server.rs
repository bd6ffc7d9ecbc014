//! HTTP server.
//!
//! Serves the query, ingestion status and re-index APIs over JSON, while the
//! worker pool and the watcher run in the same process.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Answer a question with citations |
//! | `GET`  | `/documents` | Ingestion status of every document |
//! | `GET`  | `/documents/{*id}` | Ingestion status of one document |
//! | `GET`  | `/documents/{*id}/content` | Extracted text of one document |
//! | `POST` | `/reindex` | Re-index one document or everything |
//! | `POST` | `/reset` | Empty the index and rebuild it (`soft` or `hard`) |
//! | `GET`  | `/jobs/dead` | Dead-lettered jobs |
//! | `GET`  | `/health` | Health check with queue counts |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unprocessable` (422),
//! `timeout` (504), `upstream` (502), `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::answer::{AnswerError, QueryRequest, QueryResponse};
use crate::context::AppContext;
use crate::error::PipelineError;
use crate::models::IndexingJob;
use crate::queue::QueueStats;
use crate::status::{
    self, DocumentContent, DocumentStatusView, ResetMode, ResetReport, StatusError, Target,
};
use crate::watcher::{self, PollingChangeFeed};
use crate::worker::WorkerPool;

/// Start workers and the watcher, reconcile, then serve until Ctrl-C.
pub async fn run_server(ctx: AppContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();

    let mut feed = PollingChangeFeed::new(
        ctx.scanner.clone(),
        Duration::from_millis(ctx.config.watcher.poll_interval_ms),
    );
    // Baseline before reconciling so nothing changed in between is missed.
    feed.poll_once().await?;
    let report = watcher::reconcile(&ctx).await?;
    println!(
        "Reconciled {} files: {} to index, {} to remove.",
        report.scanned, report.upserts, report.deletes
    );

    let workers = WorkerPool::spawn(ctx.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watch_handle = tokio::spawn(watcher::run(ctx.clone(), Box::new(feed), shutdown_rx));

    let app = router(ctx);
    println!("Knowledge server listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    match watch_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "watcher task ended abnormally"),
    }
    workers.shutdown().await;
    Ok(())
}

pub fn router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/documents", get(handle_list_documents))
        .route("/documents/{*id}", get(handle_get_document))
        .route("/reindex", post(handle_reindex))
        .route("/reset", post(handle_reset))
        .route("/jobs/dead", get(handle_dead_letters))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(ctx)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<AnswerError> for AppError {
    fn from(err: AnswerError) -> Self {
        let message = err.to_string();
        match err {
            AnswerError::EmptyQuery => bad_request(message),
            AnswerError::Pipeline(PipelineError::RetrievalTimeout(_)) => AppError {
                status: StatusCode::GATEWAY_TIMEOUT,
                code: "timeout",
                message,
            },
            AnswerError::Pipeline(
                PipelineError::EmbeddingService(_) | PipelineError::Generation(_),
            ) => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "upstream",
                message,
            },
            AnswerError::Pipeline(_) => internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = err.to_string();
        match err.downcast_ref::<StatusError>() {
            Some(StatusError::NotFound(_) | StatusError::FileMissing(_)) => not_found(message),
            Some(StatusError::Unreadable { .. }) => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "unprocessable",
                message,
            },
            None => internal(message),
        }
    }
}

// ============ POST /query ============

async fn handle_query(
    State(ctx): State<AppContext>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let response = ctx.composer().answer(request).await?;
    Ok(Json(response))
}

// ============ GET /documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentStatusView>,
}

async fn handle_list_documents(
    State(ctx): State<AppContext>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = status::list_status(&ctx).await?;
    Ok(Json(DocumentListResponse { documents }))
}

#[derive(Serialize)]
#[serde(untagged)]
enum DocumentView {
    Status(DocumentStatusView),
    Content(DocumentContent),
}

/// The wildcard also swallows a trailing `/content`, so both views are
/// routed here. A document whose id really ends in `/content` wins.
async fn handle_get_document(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    if let Some(view) = status::document_status(&ctx, &id).await? {
        return Ok(Json(DocumentView::Status(view)));
    }
    if let Some(doc_id) = id.strip_suffix("/content") {
        let content = status::document_content(&ctx, doc_id).await?;
        return Ok(Json(DocumentView::Content(content)));
    }
    Err(not_found(format!("document not found: {}", id)))
}

// ============ POST /reindex ============

#[derive(Serialize)]
struct ReindexResponse {
    jobs: Vec<i64>,
}

async fn handle_reindex(
    State(ctx): State<AppContext>,
    Json(target): Json<Target>,
) -> Result<Json<ReindexResponse>, AppError> {
    if matches!(&target, Target::Document(id) if id.trim().is_empty()) {
        return Err(bad_request("document id must not be empty"));
    }
    let jobs = status::reindex(&ctx, target).await?;
    Ok(Json(ReindexResponse { jobs }))
}

// ============ POST /reset ============

#[derive(serde::Deserialize)]
struct ResetRequest {
    mode: ResetMode,
}

async fn handle_reset(
    State(ctx): State<AppContext>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<ResetReport>, AppError> {
    Ok(Json(status::reset(&ctx, request.mode).await?))
}

// ============ GET /jobs/dead ============

#[derive(Serialize)]
struct DeadLetterResponse {
    jobs: Vec<IndexingJob>,
}

async fn handle_dead_letters(
    State(ctx): State<AppContext>,
) -> Result<Json<DeadLetterResponse>, AppError> {
    let jobs = ctx
        .queue
        .dead_letters()
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(DeadLetterResponse { jobs }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    queue: QueueStats,
}

async fn handle_health(State(ctx): State<AppContext>) -> Result<Json<HealthResponse>, AppError> {
    let queue = ctx
        .queue
        .stats()
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue,
    }))
}
