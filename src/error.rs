//! Error taxonomy for the ingestion and answering pipeline.
//!
//! Workers classify every failure into one of these kinds to decide between
//! retrying a job, failing it permanently, or dropping a stale write.

use thiserror::Error;

use crate::extract::ExtractError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Unreadable, corrupt, or unsupported content. Never retried.
    #[error("parse error: {0}")]
    Parse(String),

    /// I/O timeouts, temporarily unavailable collaborators. Retried with backoff.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The embedding endpoint failed. Retried until the attempt budget runs out.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// A caller deadline expired during retrieval or generation.
    #[error("retrieval timed out after {0} ms")]
    RetrievalTimeout(u64),

    /// A write carried an older version than the one already applied.
    #[error("stale write for {document_id}: version {attempted} <= applied {applied}")]
    IndexConsistency {
        document_id: String,
        attempted: i64,
        applied: i64,
    },

    /// The generation model failed or returned nothing usable.
    #[error("generation error: {0}")]
    Generation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl PipelineError {
    /// Whether a job hitting this error should be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientIo(_)
                | PipelineError::EmbeddingService(_)
                | PipelineError::Storage(_)
        )
    }
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::OcrUnavailable(msg) => PipelineError::TransientIo(msg),
            other => PipelineError::Parse(other.to_string()),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                PipelineError::Parse(err.to_string())
            }
            _ => PipelineError::TransientIo(err.to_string()),
        }
    }
}
