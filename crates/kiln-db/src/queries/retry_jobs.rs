//! Query functions for the `retry_jobs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{RetryJob, RetryStatus};

/// Insert a pending retry job scheduled for a future instant.
pub async fn insert_retry_job(
    pool: &PgPool,
    step_run_id: Uuid,
    retry_attempt: i32,
    scheduled_at: DateTime<Utc>,
) -> Result<RetryJob> {
    let job = sqlx::query_as::<_, RetryJob>(
        "INSERT INTO retry_jobs (step_run_id, retry_attempt, scheduled_at) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(step_run_id)
    .bind(retry_attempt)
    .bind(scheduled_at)
    .fetch_one(pool)
    .await
    .context("failed to insert retry job")?;

    Ok(job)
}

/// All pending jobs whose scheduled time has passed, oldest first.
pub async fn get_due_jobs(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<RetryJob>> {
    let jobs = sqlx::query_as::<_, RetryJob>(
        "SELECT * FROM retry_jobs \
         WHERE status = 'pending' AND scheduled_at <= $1 \
         ORDER BY scheduled_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to fetch due retry jobs")?;

    Ok(jobs)
}

/// List jobs for a step, oldest first.
pub async fn list_for_step(pool: &PgPool, step_run_id: Uuid) -> Result<Vec<RetryJob>> {
    let jobs = sqlx::query_as::<_, RetryJob>(
        "SELECT * FROM retry_jobs WHERE step_run_id = $1 ORDER BY created_at ASC",
    )
    .bind(step_run_id)
    .fetch_all(pool)
    .await
    .context("failed to list retry jobs for step")?;

    Ok(jobs)
}

/// Claim a pending job for processing. Zero rows means another worker got
/// there first (or the job is no longer pending).
pub async fn claim_job(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE retry_jobs SET status = 'processing' \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to claim retry job")?;

    Ok(result.rows_affected())
}

/// Finish a job in a terminal status, stamping `processed_at`.
pub async fn finish_job(pool: &PgPool, id: Uuid, status: RetryStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE retry_jobs SET status = $2, processed_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(status)
    .execute(pool)
    .await
    .context("failed to finish retry job")?;

    Ok(result.rows_affected())
}
