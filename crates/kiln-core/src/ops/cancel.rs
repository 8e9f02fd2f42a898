//! Pipeline cancellation.
//!
//! Terminal: the run flips to `cancelled` and every step that has not
//! finished is cancelled with it. Completed, failed, and invalidated
//! steps (and their artifacts) are preserved. The retry worker observes
//! the cancelled status before re-executing anything.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{PipelineStatus, StepStatus};
use kiln_db::queries::{pipeline_runs as run_db, pipeline_steps as step_db};

use crate::audit::{AuditSink, log_best_effort};
use crate::error::{OpError, OpResult};
use crate::events::{EventHub, TenantEvent};

/// Result of a cancellation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancelOutcome {
    pub pipeline_run_id: Uuid,
    pub previous_status: PipelineStatus,
    pub new_status: PipelineStatus,
    /// Steps that had already completed and were preserved.
    pub steps_completed: usize,
    /// Steps transitioned to `cancelled` by this call.
    pub steps_cancelled: usize,
}

/// Cancel a running or paused pipeline run.
pub async fn cancel_pipeline(
    pool: &PgPool,
    audit: &dyn AuditSink,
    hub: &EventHub,
    pipeline_run_id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
    reason: Option<&str>,
) -> OpResult<CancelOutcome> {
    let run = run_db::get_run(pool, pipeline_run_id)
        .await?
        .ok_or(OpError::PipelineNotFound)?;

    if run.tenant_id != tenant_id {
        return Err(OpError::Unauthorized);
    }

    if run.status.is_terminal() {
        return Err(OpError::CannotCancelCompleted(run.status.to_string()));
    }

    let previous_status = run.status;

    if run_db::cancel_run(pool, run.id).await? == 0 {
        // Someone else finished or cancelled it first.
        let current = run_db::get_run(pool, run.id)
            .await?
            .ok_or(OpError::PipelineNotFound)?;
        return Err(OpError::CannotCancelCompleted(current.status.to_string()));
    }

    let steps_cancelled = step_db::cancel_open_steps_for_run(pool, run.id).await? as usize;
    let steps_completed = step_db::list_steps_for_run(pool, run.id)
        .await?
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();

    log_best_effort(
        audit,
        "pipeline_cancelled",
        tenant_id,
        Some(user_id),
        "pipeline_run",
        &run.id.to_string(),
        json!({
            "task_id": run.task_id,
            "reason": reason,
            "previous_status": previous_status,
            "steps_cancelled": steps_cancelled,
        }),
    )
    .await;

    hub.publish(
        tenant_id,
        TenantEvent::new(
            "pipeline:cancelled",
            json!({
                "pipeline_run_id": run.id,
                "task_id": run.task_id,
                "previous_status": previous_status,
            }),
        ),
    );

    tracing::info!(
        run_id = %run.id,
        previous_status = %previous_status,
        steps_cancelled,
        "pipeline cancelled"
    );

    Ok(CancelOutcome {
        pipeline_run_id: run.id,
        previous_status,
        new_status: PipelineStatus::Cancelled,
        steps_completed,
        steps_cancelled,
    })
}
