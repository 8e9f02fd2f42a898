//! Query functions for the `dead_letter_events` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::DeadLetterEvent;

/// Insert a dead-letter record for a step that exhausted its retries.
pub async fn insert_dead_letter(
    pool: &PgPool,
    pipeline_run_id: Uuid,
    step_run_id: Uuid,
    failure_reason: &str,
    retry_count: i32,
    context: &serde_json::Value,
) -> Result<DeadLetterEvent> {
    let event = sqlx::query_as::<_, DeadLetterEvent>(
        "INSERT INTO dead_letter_events \
             (pipeline_run_id, step_run_id, failure_reason, retry_count, context) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(pipeline_run_id)
    .bind(step_run_id)
    .bind(failure_reason)
    .bind(retry_count)
    .bind(context)
    .fetch_one(pool)
    .await
    .context("failed to insert dead letter event")?;

    Ok(event)
}

/// Fetch a single dead-letter event by ID.
pub async fn get_dead_letter(pool: &PgPool, id: Uuid) -> Result<Option<DeadLetterEvent>> {
    let event =
        sqlx::query_as::<_, DeadLetterEvent>("SELECT * FROM dead_letter_events WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch dead letter event")?;

    Ok(event)
}

/// List dead letters for a pipeline run, oldest first.
pub async fn list_for_run(pool: &PgPool, pipeline_run_id: Uuid) -> Result<Vec<DeadLetterEvent>> {
    let events = sqlx::query_as::<_, DeadLetterEvent>(
        "SELECT * FROM dead_letter_events \
         WHERE pipeline_run_id = $1 \
         ORDER BY created_at ASC",
    )
    .bind(pipeline_run_id)
    .fetch_all(pool)
    .await
    .context("failed to list dead letters for run")?;

    Ok(events)
}

/// Unresolved dead letters for a tenant (joined through the owning run),
/// oldest first. This is the manual-triage queue.
pub async fn list_unresolved_for_tenant(
    pool: &PgPool,
    tenant_id: Uuid,
) -> Result<Vec<DeadLetterEvent>> {
    let events = sqlx::query_as::<_, DeadLetterEvent>(
        "SELECT d.* FROM dead_letter_events d \
         JOIN pipeline_runs r ON r.id = d.pipeline_run_id \
         WHERE r.tenant_id = $1 AND NOT d.resolved \
         ORDER BY d.created_at ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("failed to list unresolved dead letters")?;

    Ok(events)
}

/// Mark a dead letter resolved with optional operator notes. Zero rows
/// means it was already resolved (or missing).
pub async fn resolve_dead_letter(pool: &PgPool, id: Uuid, notes: Option<&str>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE dead_letter_events \
         SET resolved = TRUE, resolved_at = now(), resolution_notes = $2 \
         WHERE id = $1 AND NOT resolved",
    )
    .bind(id)
    .bind(notes)
    .execute(pool)
    .await
    .context("failed to resolve dead letter event")?;

    Ok(result.rows_affected())
}
