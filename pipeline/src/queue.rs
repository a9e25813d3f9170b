//! Durable heartbeat job queue backed by the `heartbeat_jobs` table.
//!
//! Jobs move `waiting -> active -> (deleted | waiting | failed)`. Succeeded
//! jobs are deleted; jobs that exhaust their attempts stay `failed` until an
//! operator looks at them. Claims use `FOR UPDATE SKIP LOCKED` so any number
//! of workers (and processes) can poll the same table.

use crate::errors::Result;
use crate::model::{FailedJob, HeartbeatPayload};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

pub const QUEUE_NAME: &str = "heartbeats";

/// Attempt budget and exponential backoff applied to every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt: backoff * 2^(attempt-1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff.saturating_mul(2_u32.pow(exp))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// A claimed job. `attempt` is 1 on first delivery.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub payload: HeartbeatPayload,
    pub attempt: u32,
    pub policy: RetryPolicy,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: &HeartbeatPayload) -> Result<Uuid>;

    /// Claims the oldest due job, if any, holding it for `lease`.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>>;

    /// Pushes the lease of an active job `lease` into the future.
    async fn extend_lease(&self, id: Uuid, lease: Duration) -> Result<()>;

    /// Discards a succeeded job.
    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Puts the job back to wait `delay` before its next attempt.
    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<()>;

    /// Marks the job permanently failed; it stays in the failed set.
    async fn fail(&self, id: Uuid, error: &str) -> Result<()>;

    async fn failed(&self, limit: i64) -> Result<Vec<FailedJob>>;
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    #[sqlx(json)]
    payload: HeartbeatPayload,
    attempts: i32,
    max_attempts: i32,
    backoff_ms: i64,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            payload: row.payload,
            attempt: row.attempts.max(0) as u32,
            policy: RetryPolicy {
                max_attempts: row.max_attempts.max(1) as u32,
                backoff: Duration::from_millis(row.backoff_ms.max(0) as u64),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, payload: &HeartbeatPayload) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO heartbeat_jobs (id, payload, max_attempts, backoff_ms)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(Json(payload))
        .bind(self.policy.max_attempts as i32)
        .bind(self.policy.backoff.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>> {
        // An active job whose lease ran out belongs to a worker that died.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE heartbeat_jobs
            SET state = 'active',
                attempts = attempts + 1,
                locked_until = now() + make_interval(secs => $1)
            WHERE id = (
                SELECT id FROM heartbeat_jobs
                WHERE (state = 'waiting' AND run_at <= now())
                   OR (state = 'active' AND locked_until < now())
                ORDER BY run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts, max_attempts, backoff_ms
            "#,
        )
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Job::from))
    }

    async fn extend_lease(&self, id: Uuid, lease: Duration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE heartbeat_jobs
            SET locked_until = now() + make_interval(secs => $2)
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM heartbeat_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE heartbeat_jobs
            SET state = 'waiting',
                run_at = now() + make_interval(secs => $2),
                locked_until = NULL,
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE heartbeat_jobs
            SET state = 'failed',
                locked_until = NULL,
                last_error = $2,
                failed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failed(&self, limit: i64) -> Result<Vec<FailedJob>> {
        let jobs = sqlx::query_as::<_, FailedJob>(
            r#"
            SELECT id, payload, attempts, last_error, created_at, failed_at
            FROM heartbeat_jobs
            WHERE state = 'failed'
            ORDER BY failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}
