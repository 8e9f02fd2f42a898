//! Artifact rejection, optionally forking a regeneration run.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{Artifact, ArtifactStatus, PipelineStatus};
use kiln_db::queries::{artifacts as artifact_db, pipeline_runs as run_db, tasks as task_db};

use crate::audit::{AuditSink, log_best_effort};
use crate::dispatcher::{Dispatcher, Work};
use crate::error::{OpError, OpResult};
use crate::events::{EventHub, TenantEvent};

/// What rejection did.
#[derive(Debug, Clone)]
pub struct RejectionOutcome {
    pub artifact: Artifact,
    /// The forked regeneration run, when requested.
    pub new_pipeline_run_id: Option<Uuid>,
}

/// Reject a draft artifact, storing the reviewer's feedback. With
/// `regenerate`, a fresh run is forked for the same task (starting over
/// at step 1) and handed to the dispatcher.
pub async fn reject_artifact(
    pool: &PgPool,
    audit: &dyn AuditSink,
    hub: &EventHub,
    dispatcher: Option<&Dispatcher>,
    artifact_id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
    feedback: Option<&str>,
    regenerate: bool,
) -> OpResult<RejectionOutcome> {
    let artifact = artifact_db::get_artifact(pool, artifact_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    task_db::get_task(pool, artifact.task_id, tenant_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    match artifact.status {
        ArtifactStatus::Draft => {}
        ArtifactStatus::Rejected => return Err(OpError::AlreadyRejected),
        ArtifactStatus::Approved => return Err(OpError::CannotRejectApproved),
        ArtifactStatus::Superseded => return Err(OpError::CannotRejectSuperseded),
    }

    let extra = match feedback {
        Some(feedback) => json!({ "rejection_feedback": feedback }),
        None => json!({}),
    };
    if artifact_db::reject_artifact(pool, artifact.id, &extra).await? == 0 {
        let current = artifact_db::get_artifact(pool, artifact.id)
            .await?
            .ok_or(OpError::ArtifactNotFound)?;
        return Err(match current.status {
            ArtifactStatus::Rejected => OpError::AlreadyRejected,
            ArtifactStatus::Approved => OpError::CannotRejectApproved,
            _ => OpError::CannotRejectSuperseded,
        });
    }

    let mut new_pipeline_run_id = None;
    if regenerate {
        let run = run_db::insert_run(
            pool,
            artifact.task_id,
            tenant_id,
            PipelineStatus::Running,
            1,
        )
        .await?;
        new_pipeline_run_id = Some(run.id);

        if let Some(dispatcher) = dispatcher {
            dispatcher.enqueue(Work::DriveRun { run_id: run.id })?;
        }
    }

    let artifact = artifact_db::get_artifact(pool, artifact.id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    let mut metadata = json!({
        "task_id": artifact.task_id,
        "artifact_type": artifact.artifact_type,
        "version": artifact.version,
        "feedback": feedback,
        "regenerate": regenerate,
    });
    if let Some(run_id) = new_pipeline_run_id {
        metadata["new_pipeline_run_id"] = json!(run_id);
    }

    log_best_effort(
        audit,
        "artifact_rejected",
        tenant_id,
        Some(user_id),
        "artifact",
        &artifact.id.to_string(),
        metadata,
    )
    .await;

    hub.publish(
        tenant_id,
        TenantEvent::new(
            "artifact:rejected",
            json!({
                "artifact_id": artifact.id,
                "artifact_type": artifact.artifact_type,
                "status": artifact.status,
                "new_pipeline_run_id": new_pipeline_run_id,
                "task_id": artifact.task_id,
            }),
        ),
    );

    Ok(RejectionOutcome {
        artifact,
        new_pipeline_run_id,
    })
}
