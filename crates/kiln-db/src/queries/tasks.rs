//! Query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row in `draft` status.
pub async fn insert_task(
    pool: &PgPool,
    project_id: Uuid,
    tenant_id: Uuid,
    title: &str,
    input_spec: &serde_json::Value,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (project_id, tenant_id, title, input_spec) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(tenant_id)
    .bind(title)
    .bind(input_spec)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID, scoped to a tenant.
///
/// Returns `None` both when the task does not exist and when it belongs to
/// another tenant, so callers cannot distinguish the two.
pub async fn get_task(pool: &PgPool, id: Uuid, tenant_id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a project, newest first.
pub async fn list_tasks_for_project(
    pool: &PgPool,
    project_id: Uuid,
    tenant_id: Uuid,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE project_id = $1 AND tenant_id = $2 \
         ORDER BY created_at DESC",
    )
    .bind(project_id)
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

/// Execute an optimistic status transition. Returns the affected row count;
/// zero means the task is missing or its status no longer matches `from`.
pub async fn transition_task_status(
    pool: &PgPool,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $3, updated_at = now() \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}
