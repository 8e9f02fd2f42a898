//! Query functions for the `export_jobs` and `git_sync_jobs` tables.
//!
//! Both follow the same job pattern: pending -> processing ->
//! completed|failed, with a retry counter that can requeue a failed job
//! back to pending.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExportJob, GitSyncJob};

// ---------------------------------------------------------------------------
// Export jobs
// ---------------------------------------------------------------------------

/// Insert a pending export job for a project.
pub async fn insert_export_job(
    pool: &PgPool,
    project_id: Uuid,
    tenant_id: Uuid,
) -> Result<ExportJob> {
    let job = sqlx::query_as::<_, ExportJob>(
        "INSERT INTO export_jobs (project_id, tenant_id) \
         VALUES ($1, $2) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(tenant_id)
    .fetch_one(pool)
    .await
    .context("failed to insert export job")?;

    Ok(job)
}

/// Fetch an export job, scoped to a tenant.
pub async fn get_export_job(pool: &PgPool, id: Uuid, tenant_id: Uuid) -> Result<Option<ExportJob>> {
    let job = sqlx::query_as::<_, ExportJob>(
        "SELECT * FROM export_jobs WHERE id = $1 AND tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch export job")?;

    Ok(job)
}

/// Fetch an export job without tenant scoping (background processing).
pub async fn get_export_job_unscoped(pool: &PgPool, id: Uuid) -> Result<Option<ExportJob>> {
    let job = sqlx::query_as::<_, ExportJob>("SELECT * FROM export_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch export job")?;

    Ok(job)
}

/// Claim a pending export job: `pending -> processing`, stamping
/// `started_at`.
pub async fn start_export_job(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE export_jobs \
         SET status = 'processing', started_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to start export job")?;

    Ok(result.rows_affected())
}

/// Complete an export job with its download handle.
pub async fn complete_export_job(
    pool: &PgPool,
    id: Uuid,
    file_path: &str,
    download_url: &str,
    expires_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE export_jobs \
         SET status = 'completed', file_path = $2, download_url = $3, \
             expires_at = $4, completed_at = now() \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(file_path)
    .bind(download_url)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("failed to complete export job")?;

    Ok(result.rows_affected())
}

/// Fail an export job with an error message.
pub async fn fail_export_job(pool: &PgPool, id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE export_jobs \
         SET status = 'failed', error_message = $2, completed_at = now() \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await
    .context("failed to fail export job")?;

    Ok(result.rows_affected())
}

/// Requeue a failed export job: back to `pending`, one retry consumed,
/// result fields cleared. Zero rows means the retry budget is spent.
pub async fn requeue_export_job(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE export_jobs \
         SET status = 'pending', retry_count = retry_count + 1, \
             file_path = NULL, download_url = NULL, expires_at = NULL, \
             error_message = NULL, started_at = NULL, completed_at = NULL \
         WHERE id = $1 AND status = 'failed' AND retry_count < max_retries",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to requeue export job")?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Git sync jobs
// ---------------------------------------------------------------------------

/// Insert a pending git-sync job for an artifact.
pub async fn insert_git_sync_job(
    pool: &PgPool,
    artifact_id: Uuid,
    tenant_id: Uuid,
    repository_url: &str,
    branch: &str,
    commit_message: &str,
) -> Result<GitSyncJob> {
    let job = sqlx::query_as::<_, GitSyncJob>(
        "INSERT INTO git_sync_jobs \
             (artifact_id, tenant_id, repository_url, branch, commit_message) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(artifact_id)
    .bind(tenant_id)
    .bind(repository_url)
    .bind(branch)
    .bind(commit_message)
    .fetch_one(pool)
    .await
    .context("failed to insert git sync job")?;

    Ok(job)
}

/// Fetch a git-sync job, scoped to a tenant.
pub async fn get_git_sync_job(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<GitSyncJob>> {
    let job = sqlx::query_as::<_, GitSyncJob>(
        "SELECT * FROM git_sync_jobs WHERE id = $1 AND tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch git sync job")?;

    Ok(job)
}

/// Fetch a git-sync job without tenant scoping (background processing).
pub async fn get_git_sync_job_unscoped(pool: &PgPool, id: Uuid) -> Result<Option<GitSyncJob>> {
    let job = sqlx::query_as::<_, GitSyncJob>("SELECT * FROM git_sync_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch git sync job")?;

    Ok(job)
}

/// Claim a pending git-sync job: `pending -> processing`.
pub async fn start_git_sync_job(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE git_sync_jobs \
         SET status = 'processing', started_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to start git sync job")?;

    Ok(result.rows_affected())
}

/// Complete a git-sync job with the pushed commit SHA.
pub async fn complete_git_sync_job(pool: &PgPool, id: Uuid, commit_sha: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE git_sync_jobs \
         SET status = 'completed', commit_sha = $2, completed_at = now() \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(commit_sha)
    .execute(pool)
    .await
    .context("failed to complete git sync job")?;

    Ok(result.rows_affected())
}

/// Fail a git-sync job with an error message.
pub async fn fail_git_sync_job(pool: &PgPool, id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE git_sync_jobs \
         SET status = 'failed', error_message = $2, completed_at = now() \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await
    .context("failed to fail git sync job")?;

    Ok(result.rows_affected())
}

/// Requeue a failed git-sync job, clearing its result fields.
pub async fn requeue_git_sync_job(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE git_sync_jobs \
         SET status = 'pending', retry_count = retry_count + 1, \
             commit_sha = NULL, error_message = NULL, \
             started_at = NULL, completed_at = NULL \
         WHERE id = $1 AND status = 'failed' AND retry_count < max_retries",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to requeue git sync job")?;

    Ok(result.rows_affected())
}
