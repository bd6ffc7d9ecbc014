//! # Knowledge Harness CLI (`kh`)
//!
//! ## Usage
//!
//! ```bash
//! kh --config ./config/kh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kh init` | Create the SQLite database and schema |
//! | `kh reconcile` | Diff the knowledge roots against the index and enqueue changes |
//! | `kh reindex <id\|all>` | Force re-indexing of one document or everything |
//! | `kh status [id]` | Show ingestion status |
//! | `kh content <id>` | Print the extracted text of a document |
//! | `kh reset [--hard]` | Empty the index and rebuild it from disk |
//! | `kh ask "<question>"` | Answer a question with citations |
//! | `kh jobs` | Show queue counts and dead-lettered jobs |
//! | `kh serve` | Watch the roots, run workers and serve HTTP |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use knowledge_harness::answer::{AnswerError, Language, QueryRequest};
use knowledge_harness::config;
use knowledge_harness::context::AppContext;
use knowledge_harness::error::PipelineError;
use knowledge_harness::migrate;
use knowledge_harness::models::Category;
use knowledge_harness::server;
use knowledge_harness::status::{self, ResetMode, Target};
use knowledge_harness::watcher;
use knowledge_harness::worker::{self, JobOutcome};

/// Exit code for a query that ran past its deadline.
const EXIT_TIMEOUT: i32 = 3;

/// Knowledge Harness: keeps a vector index in step with a knowledge base
/// and answers questions from it with citations.
#[derive(Parser)]
#[command(name = "kh", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Diff the knowledge roots against the index and enqueue the changes.
    Reconcile {
        /// Process the enqueued jobs before exiting.
        #[arg(long)]
        wait: bool,
    },

    /// Re-index one document (by id) or `all`.
    Reindex {
        target: String,

        /// Process the enqueued jobs before exiting.
        #[arg(long)]
        wait: bool,
    },

    /// Show ingestion status of all documents, or of one.
    Status { id: Option<String> },

    /// Print the text extracted from a document, as the indexer sees it.
    Content { id: String },

    /// Drop every chunk and vector and re-index all files on disk.
    Reset {
        /// Also forget document history, deleted documents included.
        #[arg(long)]
        hard: bool,

        /// Process the enqueued jobs before exiting.
        #[arg(long)]
        wait: bool,
    },

    /// Answer a question from the indexed knowledge.
    Ask {
        query: String,

        /// Restrict retrieval to `internal` or `external`.
        #[arg(long)]
        category: Option<Category>,

        /// Answer language (`en` or `fr`); detected from the question if omitted.
        #[arg(long)]
        lang: Option<String>,

        /// Deadline for the whole query, in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show queue counts and dead-lettered jobs.
    Jobs,

    /// Watch the knowledge roots, run the worker pool and serve HTTP.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Reconcile { wait } => {
            let ctx = AppContext::open(&cfg).await?;
            let report = watcher::reconcile(&ctx).await?;
            println!("scanned: {}", report.scanned);
            println!("enqueued upserts: {}", report.upserts);
            println!("enqueued deletes: {}", report.deletes);
            println!("unchanged: {}", report.unchanged);
            if wait {
                run_pending(&ctx).await?;
            }
        }
        Commands::Reindex { target, wait } => {
            let ctx = AppContext::open(&cfg).await?;
            let jobs = status::reindex(&ctx, Target::parse(&target)).await?;
            println!("enqueued jobs: {}", jobs.len());
            if wait {
                run_pending(&ctx).await?;
            }
        }
        Commands::Status { id } => {
            let ctx = AppContext::open(&cfg).await?;
            let docs = match id {
                Some(id) => vec![status::document_status(&ctx, &id)
                    .await?
                    .with_context(|| format!("document not found: {}", id))?],
                None => status::list_status(&ctx).await?,
            };
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                println!(
                    "{}  {}  chunks={}  indexed_at={}",
                    doc.id,
                    doc.status.as_str(),
                    doc.chunk_count,
                    doc.last_indexed_at
                        .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
                if let Some(err) = doc.last_error {
                    println!("    error: {}", err);
                }
            }
        }
        Commands::Content { id } => {
            let ctx = AppContext::open(&cfg).await?;
            let content = status::document_content(&ctx, &id).await?;
            if !content.ocr_pages.is_empty() {
                eprintln!("OCR pages: {:?}", content.ocr_pages);
            }
            println!("{}", content.content);
        }
        Commands::Reset { hard, wait } => {
            let ctx = AppContext::open(&cfg).await?;
            let mode = if hard { ResetMode::Hard } else { ResetMode::Soft };
            let report = status::reset(&ctx, mode).await?;
            println!("chunks removed: {}", report.chunks_removed);
            println!("documents forgotten: {}", report.documents_forgotten);
            println!("enqueued jobs: {}", report.jobs.len());
            if wait {
                run_pending(&ctx).await?;
            }
        }
        Commands::Ask {
            query,
            category,
            lang,
            timeout_ms,
        } => {
            let language = match lang {
                Some(code) => Some(
                    Language::from_code(&code)
                        .with_context(|| format!("unknown language: {} (use en or fr)", code))?,
                ),
                None => None,
            };
            let ctx = AppContext::open(&cfg).await?;
            let request = QueryRequest {
                query,
                category,
                language,
                timeout_ms,
            };
            match ctx.composer().answer(request).await {
                Ok(response) => {
                    println!("{}", response.answer);
                    if !response.sources.is_empty() {
                        println!();
                        println!("Sources:");
                        for source in &response.sources {
                            println!("  - {}", source);
                        }
                    }
                }
                Err(AnswerError::Pipeline(e @ PipelineError::RetrievalTimeout(_))) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(EXIT_TIMEOUT);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Jobs => {
            let ctx = AppContext::open(&cfg).await?;
            let stats = ctx.queue.stats().await?;
            println!(
                "pending: {}  leased: {}  done: {}  failed: {}  dead: {}  superseded: {}",
                stats.pending, stats.leased, stats.done, stats.failed, stats.dead, stats.superseded
            );
            let dead = ctx.queue.dead_letters().await?;
            if !dead.is_empty() {
                println!("Dead letters:");
                for job in dead {
                    println!(
                        "  #{} {} {} attempts={} error={}",
                        job.id,
                        job.op.as_str(),
                        job.document_id,
                        job.attempts,
                        job.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Serve => {
            let ctx = AppContext::open(&cfg).await?;
            server::run_server(ctx).await?;
        }
    }

    Ok(())
}

/// Run every runnable job in this process and print a summary.
async fn run_pending(ctx: &AppContext) -> anyhow::Result<()> {
    let outcomes = worker::drain(ctx).await?;
    let count = |f: fn(&JobOutcome) -> bool| outcomes.iter().filter(|o| f(o)).count();
    println!("indexed: {}", count(|o| matches!(o, JobOutcome::Indexed { .. })));
    println!("deleted: {}", count(|o| matches!(o, JobOutcome::Deleted { .. })));
    println!("failed: {}", count(|o| matches!(o, JobOutcome::Failed(_))));
    println!("retrying: {}", count(|o| matches!(o, JobOutcome::Retry(_))));
    println!("dead: {}", count(|o| matches!(o, JobOutcome::Dead(_))));
    println!("lease lost: {}", count(|o| matches!(o, JobOutcome::LeaseLost)));
    Ok(())
}
