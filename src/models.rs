//! Core data models shared by the ingestion and answering paths.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which content root a document lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Internal,
    External,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Internal => "internal",
            Category::External => "external",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Category::Internal),
            "external" => Ok(Category::External),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Parsed,
    Failed,
    /// Tombstone left after the file disappeared.
    Deleted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Parsed => "parsed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "parsed" => Ok(DocumentStatus::Parsed),
            "failed" => Ok(DocumentStatus::Failed),
            "deleted" => Ok(DocumentStatus::Deleted),
            other => Err(format!("unknown document status: {}", other)),
        }
    }
}

/// One knowledge-base file as recorded in the `documents` table.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub path: PathBuf,
    pub file_name: String,
    pub category: Category,
    pub content_hash: String,
    pub modified_at: i64,
    pub status: DocumentStatus,
    pub applied_version: i64,
    pub chunk_count: i64,
    pub last_indexed_at: Option<i64>,
    pub last_error: Option<String>,
}

/// A bounded span of normalized document text.
///
/// `start..end` is the byte range this chunk owns in the normalized text;
/// owned ranges of one document partition it. `text` may additionally carry
/// an overlap prefix copied from the previous chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
    pub char_len: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOp {
    Upsert,
    Delete,
}

impl JobOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOp::Upsert => "upsert",
            JobOp::Delete => "delete",
        }
    }
}

impl FromStr for JobOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(JobOp::Upsert),
            "delete" => Ok(JobOp::Delete),
            other => Err(format!("unknown job op: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Leased,
    Done,
    /// Terminal: permanent error, not retried.
    Failed,
    /// Terminal: retry budget exhausted. The dead-letter record.
    Dead,
    /// A newer job for the same document was enqueued before this one ran.
    Superseded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
            JobState::Superseded => "superseded",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "leased" => Ok(JobState::Leased),
            "done" => Ok(JobState::Done),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            "superseded" => Ok(JobState::Superseded),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// A unit of indexing work. `id` is assigned by the durable queue in
/// enqueue order and doubles as the document version the job writes.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingJob {
    pub id: i64,
    pub document_id: String,
    pub path: PathBuf,
    pub category: Category,
    pub op: JobOp,
    pub state: JobState,
    pub attempts: u32,
    pub enqueued_at: i64,
    pub last_error: Option<String>,
}

impl IndexingJob {
    pub fn version(&self) -> i64 {
        self.id
    }
}

/// A job about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub document_id: String,
    pub path: PathBuf,
    pub category: Category,
    pub op: JobOp,
}
