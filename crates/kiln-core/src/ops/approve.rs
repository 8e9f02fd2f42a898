//! Artifact approval, with paused-run resume linkage.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{Artifact, ArtifactStatus, PauseReason, PipelineStatus};
use kiln_db::queries::{artifacts as artifact_db, pipeline_runs as run_db, tasks as task_db};

use crate::audit::{AuditSink, log_best_effort};
use crate::dispatcher::{Dispatcher, Work};
use crate::error::{OpError, OpResult};
use crate::events::{EventHub, TenantEvent};
use crate::state::PipelineStateMachine;

/// What approval did.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub artifact: Artifact,
    /// The owning run, when it was paused awaiting this approval.
    pub pipeline_run_id: Option<Uuid>,
    /// True when clearing the approval gate resumed the run.
    pub pipeline_resumed: bool,
}

/// Approve a draft artifact.
///
/// When the owning run is paused on `AWAITING_USER_APPROVAL`, the reason
/// is cleared; if it was the last one the run resumes and (given a
/// dispatcher) is re-enqueued so the executor picks it back up.
pub async fn approve_artifact(
    pool: &PgPool,
    audit: &dyn AuditSink,
    hub: &EventHub,
    dispatcher: Option<&Dispatcher>,
    artifact_id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
) -> OpResult<ApprovalOutcome> {
    let artifact = artifact_db::get_artifact(pool, artifact_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    // Tenant isolation through task ownership; cross-tenant artifacts do
    // not exist as far as the caller can tell.
    task_db::get_task(pool, artifact.task_id, tenant_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    match artifact.status {
        ArtifactStatus::Draft => {}
        ArtifactStatus::Approved => return Err(OpError::AlreadyApproved),
        ArtifactStatus::Rejected => return Err(OpError::CannotApproveRejected),
        ArtifactStatus::Superseded => return Err(OpError::CannotApproveSuperseded),
    }

    if artifact_db::approve_artifact(pool, artifact.id).await? == 0 {
        // Raced with another mutation; report the state we now see.
        let current = artifact_db::get_artifact(pool, artifact.id)
            .await?
            .ok_or(OpError::ArtifactNotFound)?;
        return Err(match current.status {
            ArtifactStatus::Approved => OpError::AlreadyApproved,
            ArtifactStatus::Rejected => OpError::CannotApproveRejected,
            _ => OpError::CannotApproveSuperseded,
        });
    }

    // Resume linkage: clear the approval gate on the owning run.
    let mut pipeline_run_id = None;
    let mut pipeline_resumed = false;
    if let Some(run) = run_db::get_run(pool, artifact.pipeline_run_id).await? {
        if run.status == PipelineStatus::Paused
            && run.pause_reasons.contains(&PauseReason::AwaitingUserApproval)
        {
            let (run, resumed) = PipelineStateMachine::clear_pause_reason(
                pool,
                run.id,
                PauseReason::AwaitingUserApproval,
            )
            .await?;
            pipeline_run_id = Some(run.id);
            pipeline_resumed = resumed;

            if resumed {
                if let Some(dispatcher) = dispatcher {
                    dispatcher.enqueue(Work::DriveRun { run_id: run.id })?;
                }
            }
        }
    }

    let artifact = artifact_db::get_artifact(pool, artifact.id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    log_best_effort(
        audit,
        "artifact_approved",
        tenant_id,
        Some(user_id),
        "artifact",
        &artifact.id.to_string(),
        json!({
            "task_id": artifact.task_id,
            "artifact_type": artifact.artifact_type,
            "version": artifact.version,
            "pipeline_resumed": pipeline_resumed,
            "pipeline_run_id": pipeline_run_id,
        }),
    )
    .await;

    if pipeline_resumed {
        if let Some(run_id) = pipeline_run_id {
            log_best_effort(
                audit,
                "pipeline_resumed",
                tenant_id,
                Some(user_id),
                "pipeline_run",
                &run_id.to_string(),
                json!({
                    "task_id": artifact.task_id,
                    "artifact_id": artifact.id,
                    "reason": "artifact_approved",
                }),
            )
            .await;
        }
    }

    hub.publish(
        tenant_id,
        TenantEvent::new(
            "artifact:approved",
            json!({
                "artifact_id": artifact.id,
                "artifact_type": artifact.artifact_type,
                "status": artifact.status,
                "pipeline_run_id": pipeline_run_id,
                "pipeline_resumed": pipeline_resumed,
                "task_id": artifact.task_id,
            }),
        ),
    );

    Ok(ApprovalOutcome {
        artifact,
        pipeline_run_id,
        pipeline_resumed,
    })
}
