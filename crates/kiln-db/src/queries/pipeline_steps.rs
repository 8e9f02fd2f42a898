//! Query functions for the `pipeline_step_runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PipelineStepRun, StepType};

/// Insert a new step row in `pending` status.
pub async fn insert_step(
    pool: &PgPool,
    pipeline_run_id: Uuid,
    step_number: i32,
    step_name: &str,
    step_type: StepType,
    max_retries: i32,
) -> Result<PipelineStepRun> {
    let step = sqlx::query_as::<_, PipelineStepRun>(
        "INSERT INTO pipeline_step_runs \
             (pipeline_run_id, step_number, step_name, step_type, max_retries) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(pipeline_run_id)
    .bind(step_number)
    .bind(step_name)
    .bind(step_type)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline step run")?;

    Ok(step)
}

/// Fetch a single step by ID.
pub async fn get_step(pool: &PgPool, id: Uuid) -> Result<Option<PipelineStepRun>> {
    let step =
        sqlx::query_as::<_, PipelineStepRun>("SELECT * FROM pipeline_step_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch pipeline step run")?;

    Ok(step)
}

/// Fetch the step at a given position within a run.
pub async fn get_step_by_number(
    pool: &PgPool,
    pipeline_run_id: Uuid,
    step_number: i32,
) -> Result<Option<PipelineStepRun>> {
    let step = sqlx::query_as::<_, PipelineStepRun>(
        "SELECT * FROM pipeline_step_runs \
         WHERE pipeline_run_id = $1 AND step_number = $2",
    )
    .bind(pipeline_run_id)
    .bind(step_number)
    .fetch_optional(pool)
    .await
    .context("failed to fetch step by number")?;

    Ok(step)
}

/// List all steps for a run in execution order.
pub async fn list_steps_for_run(pool: &PgPool, pipeline_run_id: Uuid) -> Result<Vec<PipelineStepRun>> {
    let steps = sqlx::query_as::<_, PipelineStepRun>(
        "SELECT * FROM pipeline_step_runs \
         WHERE pipeline_run_id = $1 \
         ORDER BY step_number ASC",
    )
    .bind(pipeline_run_id)
    .fetch_all(pool)
    .await
    .context("failed to list steps for run")?;

    Ok(steps)
}

/// Freeze the input snapshot. The `IS NULL` guard makes the write
/// first-attempt-only: retries see zero rows affected and keep the
/// original snapshot.
pub async fn freeze_input_snapshot(
    pool: &PgPool,
    id: Uuid,
    snapshot: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs SET input_snapshot = $2 \
         WHERE id = $1 AND input_snapshot IS NULL",
    )
    .bind(id)
    .bind(snapshot)
    .execute(pool)
    .await
    .context("failed to freeze input snapshot")?;

    Ok(result.rows_affected())
}

/// Start a pending step: `pending -> running`, stamping `started_at`.
pub async fn start_step(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs \
         SET status = 'running', started_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to start step")?;

    Ok(result.rows_affected())
}

/// Re-start a failed step for a retry: `failed -> running`, consuming one
/// unit of retry budget. Zero rows means the step is not retryable.
pub async fn begin_retry(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs \
         SET status = 'running', started_at = now(), \
             retry_count = retry_count + 1, \
             error_message = NULL, completed_at = NULL \
         WHERE id = $1 AND status = 'failed' AND retry_count < max_retries",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to begin step retry")?;

    Ok(result.rows_affected())
}

/// Complete a running step, storing its output.
pub async fn complete_step(pool: &PgPool, id: Uuid, output: &serde_json::Value) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs \
         SET status = 'completed', completed_at = now(), output = $2 \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .bind(output)
    .execute(pool)
    .await
    .context("failed to complete step")?;

    Ok(result.rows_affected())
}

/// Fail a running step, recording the error message.
pub async fn fail_step(pool: &PgPool, id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs \
         SET status = 'failed', completed_at = now(), error_message = $2 \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await
    .context("failed to fail step")?;

    Ok(result.rows_affected())
}

/// Cancel one step if it has not reached a terminal state.
pub async fn cancel_step(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs \
         SET status = 'cancelled', completed_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to cancel step")?;

    Ok(result.rows_affected())
}

/// Cancel a step whose retry was abandoned because its run left the
/// `running` state. Unlike [`cancel_step`], this also catches a step
/// sitting in `failed` awaiting a retry that will never happen.
pub async fn cancel_abandoned_step(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs \
         SET status = 'cancelled', completed_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running', 'failed')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to cancel abandoned step")?;

    Ok(result.rows_affected())
}

/// Cancel every non-terminal step of a run in one statement. Completed,
/// failed, and invalidated steps are preserved. Returns how many steps
/// were cancelled.
pub async fn cancel_open_steps_for_run(pool: &PgPool, pipeline_run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pipeline_step_runs \
         SET status = 'cancelled', completed_at = now() \
         WHERE pipeline_run_id = $1 AND status IN ('pending', 'running')",
    )
    .bind(pipeline_run_id)
    .execute(pool)
    .await
    .context("failed to cancel open steps for run")?;

    Ok(result.rows_affected())
}
