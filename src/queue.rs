//! Durable indexing job queue in the `jobs` table.
//!
//! A job is durable once [`JobQueue::enqueue`] returns: workers, crashes and
//! restarts all see the same rows. Claiming takes a lease; a lease that
//! expires (crashed worker) makes the job claimable again. Retries back off
//! exponentially and a job that runs out of attempts becomes a dead letter.
//!
//! Each claim increments `attempts`, which doubles as the lease token: a
//! worker can only settle a job while it is still leased under the attempt
//! it claimed. A worker whose lease expired and was taken over finds its
//! settle rejected and must drop the result.
//!
//! All timestamps in `jobs` are unix milliseconds.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::models::{Category, IndexingJob, JobOp, JobState, NewJob};

/// Counts per job state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub done: i64,
    pub failed: i64,
    pub dead: i64,
    pub superseded: i64,
}

/// What happened to a job handed to [`JobQueue::retry_later`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in the queue, claimable after the delay.
    Retry(Duration),
    /// Attempts exhausted; kept as a dead letter.
    Dead,
    /// A newer job for the same document exists, so this one was dropped.
    Superseded,
    /// The lease expired and the job now belongs to another claim.
    LeaseLost,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: QueueConfig,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: &QueueConfig) -> Self {
        Self {
            pool,
            config: config.clone(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Workers wait on this between claims.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Persist a job and wake a worker. Older pending jobs for the same
    /// document are superseded. Returns the job id, which is also the
    /// version the job will write.
    pub async fn enqueue(&self, job: NewJob) -> Result<i64> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let superseded = sqlx::query(
            "UPDATE jobs SET state = 'superseded', finished_at = ? \
             WHERE document_id = ? AND state = 'pending'",
        )
        .bind(now)
        .bind(&job.document_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (document_id, path, category, op, state, attempts, enqueued_at, available_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&job.document_id)
        .bind(job.path.to_string_lossy().as_ref())
        .bind(job.category.as_str())
        .bind(job.op.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        self.notify.notify_one();

        debug!(
            job = id,
            document = %job.document_id,
            op = job.op.as_str(),
            superseded,
            "enqueued"
        );
        Ok(id)
    }

    /// Lease the oldest runnable job, if any.
    ///
    /// Runnable means pending and due, or leased with an expired lease. A
    /// document with a live lease is skipped so one document is never
    /// processed by two workers at once.
    pub async fn claim(&self) -> Result<Option<IndexingJob>> {
        let now = now_ms();
        let lease_ms = (self.config.lease_secs * 1000) as i64;

        let expired = sqlx::query(
            "UPDATE jobs SET state = 'dead', finished_at = ?, \
             last_error = COALESCE(last_error, 'lease expired') \
             WHERE state = 'leased' AND lease_expires_at <= ? AND attempts >= ?",
        )
        .bind(now)
        .bind(now)
        .bind(self.config.max_attempts as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if expired > 0 {
            warn!(count = expired, "dead-lettered jobs whose last lease expired");
        }

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'leased', attempts = attempts + 1, lease_expires_at = ?
            WHERE id = (
                SELECT j.id FROM jobs j
                WHERE ((j.state = 'pending' AND j.available_at <= ?)
                       OR (j.state = 'leased' AND j.lease_expires_at <= ?))
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs o
                      WHERE o.document_id = j.document_id
                        AND o.id != j.id
                        AND o.state = 'leased'
                        AND o.lease_expires_at > ?
                  )
                ORDER BY j.id
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now + lease_ms)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_job))
    }

    /// The settle methods return `false` when `job` is no longer held under
    /// the claim that produced it; the caller must then drop its result.
    pub async fn complete(&self, job: &IndexingJob) -> Result<bool> {
        self.finish(job, JobState::Done, None).await
    }

    /// Permanent failure: the job will not run again.
    pub async fn fail_permanently(&self, job: &IndexingJob, error: &str) -> Result<bool> {
        self.finish(job, JobState::Failed, Some(error)).await
    }

    /// A newer write already landed; nothing left to do for this job.
    pub async fn mark_superseded(&self, job: &IndexingJob) -> Result<bool> {
        self.finish(job, JobState::Superseded, None).await
    }

    async fn finish(&self, job: &IndexingJob, state: JobState, error: Option<&str>) -> Result<bool> {
        let settled = sqlx::query(
            "UPDATE jobs SET state = ?, finished_at = ?, lease_expires_at = NULL, \
             last_error = COALESCE(?, last_error) \
             WHERE id = ? AND state = 'leased' AND attempts = ?",
        )
        .bind(state.as_str())
        .bind(now_ms())
        .bind(error)
        .bind(job.id)
        .bind(job.attempts as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if settled == 0 {
            warn!(job = job.id, attempt = job.attempts, "lease lost, result dropped");
        }
        Ok(settled > 0)
    }

    /// Schedule another attempt after a transient failure, or dead-letter the
    /// job once `max_attempts` is reached.
    pub async fn retry_later(&self, job: &IndexingJob, error: &str) -> Result<RetryDecision> {
        let newer: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE document_id = ? AND id > ?")
                .bind(&job.document_id)
                .bind(job.id)
                .fetch_one(&self.pool)
                .await?;
        if newer > 0 {
            if !self.finish(job, JobState::Superseded, Some(error)).await? {
                return Ok(RetryDecision::LeaseLost);
            }
            return Ok(RetryDecision::Superseded);
        }

        if job.attempts >= self.config.max_attempts {
            if !self.finish(job, JobState::Dead, Some(error)).await? {
                return Ok(RetryDecision::LeaseLost);
            }
            warn!(
                job = job.id,
                document = %job.document_id,
                attempts = job.attempts,
                error,
                "job moved to dead letters"
            );
            return Ok(RetryDecision::Dead);
        }

        let delay = backoff_delay(
            job.attempts,
            self.config.initial_backoff_ms,
            self.config.max_backoff_ms,
        );
        let rescheduled = sqlx::query(
            "UPDATE jobs SET state = 'pending', available_at = ?, lease_expires_at = NULL, \
             last_error = ? WHERE id = ? AND state = 'leased' AND attempts = ?",
        )
        .bind(now_ms() + delay.as_millis() as i64)
        .bind(error)
        .bind(job.id)
        .bind(job.attempts as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rescheduled == 0 {
            warn!(job = job.id, attempt = job.attempts, "lease lost, retry dropped");
            return Ok(RetryDecision::LeaseLost);
        }

        info!(
            job = job.id,
            document = %job.document_id,
            attempt = job.attempts,
            delay_ms = delay.as_millis() as u64,
            "job scheduled for retry"
        );
        Ok(RetryDecision::Retry(delay))
    }

    pub async fn dead_letters(&self) -> Result<Vec<IndexingJob>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE state = 'dead' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn job(&self, job_id: i64) -> Result<Option<IndexingJob>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_job))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let n: i64 = row.get("n");
            match row.get::<String, _>("state").parse::<JobState>() {
                Ok(JobState::Pending) => stats.pending = n,
                Ok(JobState::Leased) => stats.leased = n,
                Ok(JobState::Done) => stats.done = n,
                Ok(JobState::Failed) => stats.failed = n,
                Ok(JobState::Dead) => stats.dead = n,
                Ok(JobState::Superseded) => stats.superseded = n,
                Err(e) => warn!(error = %e, "unexpected job state"),
            }
        }
        Ok(stats)
    }

    /// The newest job for the document that has not finished yet (pending
    /// or leased), if any.
    pub async fn open_job(&self, document_id: &str) -> Result<Option<IndexingJob>> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE document_id = ? AND state IN ('pending', 'leased') \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_job))
    }

    /// No job is pending or leased.
    pub async fn is_idle(&self) -> Result<bool> {
        let busy: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'leased')")
                .fetch_one(&self.pool)
                .await?;
        Ok(busy == 0)
    }

    /// Polls until [`is_idle`](Self::is_idle) or `timeout`; returns whether
    /// the queue drained.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_idle().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// `initial · 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = initial_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(max_ms))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn row_to_job(row: &SqliteRow) -> IndexingJob {
    IndexingJob {
        id: row.get("id"),
        document_id: row.get("document_id"),
        path: PathBuf::from(row.get::<String, _>("path")),
        category: row
            .get::<String, _>("category")
            .parse()
            .unwrap_or(Category::Internal),
        op: row
            .get::<String, _>("op")
            .parse()
            .unwrap_or(JobOp::Upsert),
        state: row
            .get::<String, _>("state")
            .parse()
            .unwrap_or(JobState::Pending),
        attempts: row.get::<i64, _>("attempts") as u32,
        enqueued_at: row.get("enqueued_at"),
        last_error: row.get("last_error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn queue_with(config: QueueConfig) -> JobQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        JobQueue::new(pool, &config)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_attempts: 2,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            ..QueueConfig::default()
        }
    }

    fn new_job(doc: &str, op: JobOp) -> NewJob {
        NewJob {
            document_id: doc.to_string(),
            path: PathBuf::from(format!("/kb/{}", doc)),
            category: Category::Internal,
            op,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1, 100, 1000), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, 100, 1000), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, 100, 1000), Duration::from_millis(400));
        assert_eq!(backoff_delay(10, 100, 1000), Duration::from_millis(1000));
        assert_eq!(backoff_delay(200, 100, 1000), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn ids_increase_in_enqueue_order() {
        let queue = queue_with(fast_config()).await;
        let a = queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();
        let b = queue.enqueue(new_job("internal/b.txt", JobOp::Upsert)).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn newer_job_supersedes_pending_one() {
        let queue = queue_with(fast_config()).await;
        let first = queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();
        let second = queue.enqueue(new_job("internal/a.txt", JobOp::Delete)).await.unwrap();

        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert_eq!(claimed.op, JobOp::Delete);
        assert_eq!(claimed.attempts, 1);
        let old = queue.job(first).await.unwrap().unwrap();
        assert_eq!(old.state, JobState::Superseded);
    }

    #[tokio::test]
    async fn leased_document_is_not_claimed_twice() {
        let queue = queue_with(fast_config()).await;
        queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();
        let running = queue.claim().await.unwrap().unwrap();
        queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();

        assert!(queue.claim().await.unwrap().is_none());
        assert!(queue.complete(&running).await.unwrap());
        assert!(queue.claim().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retries_then_dead_letters() {
        let queue = queue_with(fast_config()).await;
        queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        let decision = queue.retry_later(&job, "embedding 503").await.unwrap();
        assert_eq!(decision, RetryDecision::Retry(Duration::ZERO));

        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        let decision = queue.retry_later(&job, "embedding 503").await.unwrap();
        assert_eq!(decision, RetryDecision::Dead);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("embedding 503"));
        assert!(queue.claim().await.unwrap().is_none());
        assert!(queue.is_idle().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let queue = queue_with(QueueConfig {
            lease_secs: 0,
            max_attempts: 3,
            ..QueueConfig::default()
        })
        .await;
        queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();
        let first = queue.claim().await.unwrap().unwrap();
        let again = queue.claim().await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn expired_claim_cannot_settle_after_takeover() {
        let queue = queue_with(QueueConfig {
            max_attempts: 5,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            ..QueueConfig::default()
        })
        .await;
        queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();
        let first = queue.claim().await.unwrap().unwrap();

        sqlx::query("UPDATE jobs SET lease_expires_at = 0 WHERE id = ?")
            .bind(first.id)
            .execute(&queue.pool)
            .await
            .unwrap();
        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);

        // The first worker wakes up late: none of its settles may land.
        assert_eq!(
            queue.retry_later(&first, "slow").await.unwrap(),
            RetryDecision::LeaseLost
        );
        assert!(!queue.complete(&first).await.unwrap());
        assert!(!queue.fail_permanently(&first, "slow").await.unwrap());
        assert!(queue.claim().await.unwrap().is_none());

        let current = queue.job(first.id).await.unwrap().unwrap();
        assert_eq!(current.state, JobState::Leased);
        assert_eq!(current.attempts, 2);

        assert!(queue.complete(&second).await.unwrap());
        assert_eq!(queue.job(first.id).await.unwrap().unwrap().state, JobState::Done);
    }

    #[tokio::test]
    async fn stats_count_states() {
        let queue = queue_with(fast_config()).await;
        queue.enqueue(new_job("internal/a.txt", JobOp::Upsert)).await.unwrap();
        queue.enqueue(new_job("internal/b.txt", JobOp::Upsert)).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        assert!(queue.fail_permanently(&job, "corrupt").await.unwrap());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
    }
}
