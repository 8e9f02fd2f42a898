//! Query functions for the `artifacts` table.
//!
//! Version allocation runs against an explicit connection so it can share a
//! transaction with the insert; a transaction-scoped advisory lock keyed by
//! `(task_id, artifact_type)` serializes concurrent creates for the same
//! group.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{Artifact, ArtifactStatus, ArtifactType};

/// Fields for a new artifact row.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub task_id: Uuid,
    pub pipeline_run_id: Uuid,
    pub step_run_id: Uuid,
    pub artifact_type: ArtifactType,
    pub status: ArtifactStatus,
    pub version: i32,
    pub content: serde_json::Value,
}

/// Current max version for a `(task, type)` group, holding the group's
/// allocation lock for the remainder of the transaction. Returns 0 for
/// an empty group.
pub async fn max_version_locked(
    conn: &mut PgConnection,
    task_id: Uuid,
    artifact_type: ArtifactType,
) -> Result<i32> {
    // Row locks cannot cover a group with no rows yet, so allocation
    // serializes on a transaction-scoped advisory lock keyed by the
    // (task, type) pair instead.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text || ':' || $2, 0))")
        .bind(task_id)
        .bind(artifact_type)
        .execute(&mut *conn)
        .await
        .context("failed to take artifact version lock")?;

    let row: (Option<i32>,) = sqlx::query_as(
        "SELECT MAX(version) FROM artifacts \
         WHERE task_id = $1 AND artifact_type = $2",
    )
    .bind(task_id)
    .bind(artifact_type)
    .fetch_one(conn)
    .await
    .context("failed to read max artifact version")?;

    Ok(row.0.unwrap_or(0))
}

/// Insert an artifact row (normally inside the same transaction that
/// allocated its version).
pub async fn insert_artifact(conn: &mut PgConnection, new: &NewArtifact) -> Result<Artifact> {
    let approved_at = if new.status == ArtifactStatus::Approved {
        Some(chrono::Utc::now())
    } else {
        None
    };

    let artifact = sqlx::query_as::<_, Artifact>(
        "INSERT INTO artifacts \
             (task_id, pipeline_run_id, step_run_id, artifact_type, status, \
              version, content, approved_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.pipeline_run_id)
    .bind(new.step_run_id)
    .bind(new.artifact_type)
    .bind(new.status)
    .bind(new.version)
    .bind(&new.content)
    .bind(approved_at)
    .fetch_one(conn)
    .await
    .context("failed to insert artifact")?;

    Ok(artifact)
}

/// Fetch a single artifact by ID.
pub async fn get_artifact(pool: &PgPool, id: Uuid) -> Result<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch artifact")?;

    Ok(artifact)
}

/// Fetch the latest (max-version) artifact of a `(task, type)` group.
pub async fn get_latest(
    pool: &PgPool,
    task_id: Uuid,
    artifact_type: ArtifactType,
) -> Result<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts \
         WHERE task_id = $1 AND artifact_type = $2 \
         ORDER BY version DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(artifact_type)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest artifact")?;

    Ok(artifact)
}

/// List artifacts produced by a step, oldest first.
pub async fn list_for_step(pool: &PgPool, step_run_id: Uuid) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts WHERE step_run_id = $1 ORDER BY created_at ASC",
    )
    .bind(step_run_id)
    .fetch_all(pool)
    .await
    .context("failed to list artifacts for step")?;

    Ok(artifacts)
}

/// List all artifacts for a task, grouped by type then version.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts WHERE task_id = $1 \
         ORDER BY artifact_type ASC, version ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list artifacts for task")?;

    Ok(artifacts)
}

/// Approve a draft artifact. Zero rows means it was not in `draft`.
pub async fn approve_artifact(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE artifacts SET status = 'approved', approved_at = now() \
         WHERE id = $1 AND status = 'draft'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to approve artifact")?;

    Ok(result.rows_affected())
}

/// Reject a draft artifact, merging the given extras (rejection feedback)
/// into `extra_data`. Zero rows means it was not in `draft`.
pub async fn reject_artifact(
    pool: &PgPool,
    id: Uuid,
    extra_data: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE artifacts \
         SET status = 'rejected', rejected_at = now(), \
             extra_data = COALESCE(extra_data, '{}'::jsonb) || $2 \
         WHERE id = $1 AND status = 'draft'",
    )
    .bind(id)
    .bind(extra_data)
    .execute(pool)
    .await
    .context("failed to reject artifact")?;

    Ok(result.rows_affected())
}

/// Mark an artifact superseded, optionally pointing at its replacement.
pub async fn supersede_artifact(
    pool: &PgPool,
    id: Uuid,
    superseded_by: Option<Uuid>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE artifacts \
         SET status = 'superseded', superseded_by = COALESCE($2, superseded_by) \
         WHERE id = $1 AND status <> 'superseded'",
    )
    .bind(id)
    .bind(superseded_by)
    .execute(pool)
    .await
    .context("failed to supersede artifact")?;

    Ok(result.rows_affected())
}
