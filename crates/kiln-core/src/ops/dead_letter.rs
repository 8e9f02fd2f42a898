//! Dead-letter triage.
//!
//! Resolution notes are the one mutation allowed against a pipeline in a
//! terminal state.

use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::DeadLetterEvent;
use kiln_db::queries::{dead_letters as dlq_db, pipeline_runs as run_db};

use crate::error::{OpError, OpResult};

/// The tenant's manual-triage queue, oldest first.
pub async fn list_unresolved(pool: &PgPool, tenant_id: Uuid) -> OpResult<Vec<DeadLetterEvent>> {
    Ok(dlq_db::list_unresolved_for_tenant(pool, tenant_id).await?)
}

/// Mark a dead letter resolved with optional operator notes.
///
/// Idempotent: resolving an already-resolved event returns it unchanged.
pub async fn resolve(
    pool: &PgPool,
    dead_letter_id: Uuid,
    tenant_id: Uuid,
    notes: Option<&str>,
) -> OpResult<DeadLetterEvent> {
    let event = dlq_db::get_dead_letter(pool, dead_letter_id)
        .await?
        .ok_or(OpError::DeadLetterNotFound)?;

    let run = run_db::get_run(pool, event.pipeline_run_id)
        .await?
        .ok_or(OpError::DeadLetterNotFound)?;
    if run.tenant_id != tenant_id {
        return Err(OpError::DeadLetterNotFound);
    }

    dlq_db::resolve_dead_letter(pool, event.id, notes).await?;

    let event = dlq_db::get_dead_letter(pool, event.id)
        .await?
        .ok_or(OpError::DeadLetterNotFound)?;

    Ok(event)
}
