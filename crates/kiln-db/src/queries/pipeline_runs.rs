//! Query functions for the `pipeline_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PauseReason, PipelineRun, PipelineStatus};

/// Insert a new pipeline run. The run starts in the given status (usually
/// `running`) at the given step.
pub async fn insert_run(
    pool: &PgPool,
    task_id: Uuid,
    tenant_id: Uuid,
    status: PipelineStatus,
    current_step: i32,
) -> Result<PipelineRun> {
    let run = sqlx::query_as::<_, PipelineRun>(
        "INSERT INTO pipeline_runs (task_id, tenant_id, status, current_step, started_at) \
         VALUES ($1, $2, $3, $4, now()) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(tenant_id)
    .bind(status)
    .bind(current_step)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline run")?;

    Ok(run)
}

/// Fetch a single run by ID (unscoped; callers enforce tenant checks so
/// they can distinguish 403 from 404).
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<PipelineRun>> {
    let run = sqlx::query_as::<_, PipelineRun>("SELECT * FROM pipeline_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pipeline run")?;

    Ok(run)
}

/// List runs for a task, newest first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<PipelineRun>> {
    let runs = sqlx::query_as::<_, PipelineRun>(
        "SELECT * FROM pipeline_runs WHERE task_id = $1 ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for task")?;

    Ok(runs)
}

/// Paginated tenant-scoped run listing with an optional status filter,
/// newest first.
pub async fn list_runs_for_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
    status: Option<PipelineStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<PipelineRun>> {
    let runs = sqlx::query_as::<_, PipelineRun>(
        "SELECT * FROM pipeline_runs \
         WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at DESC \
         LIMIT $3 OFFSET $4",
    )
    .bind(tenant_id)
    .bind(status.map(|s| s.to_string()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list runs for tenant")?;

    Ok(runs)
}

/// Count runs for the tenant listing (same filter as [`list_runs_for_tenant`]).
pub async fn count_runs_for_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
    status: Option<PipelineStatus>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pipeline_runs \
         WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)",
    )
    .bind(tenant_id)
    .bind(status.map(|s| s.to_string()))
    .fetch_one(pool)
    .await
    .context("failed to count runs for tenant")?;

    Ok(row.0)
}

/// Execute an optimistic status transition, stamping `completed_at` and the
/// error message when provided. Returns the affected row count.
pub async fn transition_run_status(
    pool: &PgPool,
    id: Uuid,
    from: PipelineStatus,
    to: PipelineStatus,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = $3, \
             completed_at = COALESCE($4, completed_at), \
             error_message = COALESCE($5, error_message), \
             updated_at = now() \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(completed_at)
    .bind(error_message)
    .execute(pool)
    .await
    .context("failed to transition pipeline run status")?;

    Ok(result.rows_affected())
}

/// Cancellation is allowed from any non-terminal status; record the
/// transition in one statement so the guard and the write are atomic.
pub async fn cancel_run(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = 'cancelled', completed_at = now(), updated_at = now() \
         WHERE id = $1 AND status IN ('running', 'paused')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to cancel pipeline run")?;

    Ok(result.rows_affected())
}

/// Pause a run under the given reason in one atomic statement.
///
/// Idempotent per reason (jsonb containment check keeps the list a set).
/// `paused_at` is stamped only on the first pause; `pause_expires_at` is
/// set when provided and not already present. Returns the updated row, or
/// `None` when the run is missing or already terminal.
pub async fn add_pause_reason(
    pool: &PgPool,
    id: Uuid,
    reason: PauseReason,
    pause_expires_at: Option<DateTime<Utc>>,
) -> Result<Option<PipelineRun>> {
    let run = sqlx::query_as::<_, PipelineRun>(
        "UPDATE pipeline_runs \
         SET status = 'paused', \
             pause_reasons = CASE \
                 WHEN pause_reasons @> to_jsonb($2::text) THEN pause_reasons \
                 ELSE pause_reasons || to_jsonb($2::text) \
             END, \
             paused_at = COALESCE(paused_at, now()), \
             pause_expires_at = COALESCE($3, pause_expires_at), \
             updated_at = now() \
         WHERE id = $1 AND status IN ('running', 'paused') \
         RETURNING *",
    )
    .bind(id)
    .bind(reason.to_string())
    .bind(pause_expires_at)
    .fetch_optional(pool)
    .await
    .context("failed to add pause reason")?;

    Ok(run)
}

/// Remove a pause reason in one atomic statement.
///
/// When the last reason goes, the run flips back to `running` and
/// `paused_at` is cleared, preserving the `paused <=> |reasons| >= 1`
/// invariant. Returns the updated row, or `None` when the run is not
/// paused or the reason was not present.
pub async fn remove_pause_reason(
    pool: &PgPool,
    id: Uuid,
    reason: PauseReason,
) -> Result<Option<PipelineRun>> {
    let run = sqlx::query_as::<_, PipelineRun>(
        "UPDATE pipeline_runs \
         SET pause_reasons = pause_reasons - $2::text, \
             status = CASE \
                 WHEN pause_reasons - $2::text = '[]'::jsonb THEN 'running' \
                 ELSE status \
             END, \
             paused_at = CASE \
                 WHEN pause_reasons - $2::text = '[]'::jsonb THEN NULL \
                 ELSE paused_at \
             END, \
             updated_at = now() \
         WHERE id = $1 AND status = 'paused' \
           AND pause_reasons @> to_jsonb($2::text) \
         RETURNING *",
    )
    .bind(id)
    .bind(reason.to_string())
    .fetch_optional(pool)
    .await
    .context("failed to remove pause reason")?;

    Ok(run)
}

/// Resume a paused run whose pause reasons are all cleared. Zero rows
/// means the run is not paused or still has blocking reasons.
pub async fn resume_run(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = 'running', paused_at = NULL, updated_at = now() \
         WHERE id = $1 AND status = 'paused' AND pause_reasons = '[]'::jsonb",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resume pipeline run")?;

    Ok(result.rows_affected())
}

/// Advance `current_step` by one, capped at the final step.
pub async fn advance_current_step(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET current_step = current_step + 1, updated_at = now() \
         WHERE id = $1 AND current_step < 4",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to advance current step")?;

    Ok(result.rows_affected())
}

