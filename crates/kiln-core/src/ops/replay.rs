//! Pipeline replay: fork a new run from an existing one.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::PipelineStatus;
use kiln_db::queries::{pipeline_runs as run_db, pipeline_steps as step_db};

use crate::audit::{AuditSink, log_best_effort};
use crate::dispatcher::{Dispatcher, Work};
use crate::error::{OpError, OpResult};

/// Replay request.
#[derive(Debug, Clone)]
pub struct ReplayCommand {
    pub pipeline_run_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    /// Step of the source run to start from; defaults to the beginning.
    pub from_step_id: Option<Uuid>,
    /// Recorded for downstream policy; the fork itself copies nothing.
    pub preserve_approved_artifacts: bool,
}

/// The forked run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplayOutcome {
    pub new_pipeline_run_id: Uuid,
    pub status: PipelineStatus,
    /// Uppercased step name, or `STEP_1` when starting over.
    pub started_from_step: String,
}

/// Fork a new run for the same task, starting from the given source step
/// (or from step 1 when none resolves).
pub async fn replay_pipeline(
    pool: &PgPool,
    audit: &dyn AuditSink,
    dispatcher: Option<&Dispatcher>,
    command: &ReplayCommand,
) -> OpResult<ReplayOutcome> {
    let source = run_db::get_run(pool, command.pipeline_run_id)
        .await?
        .ok_or(OpError::PipelineRunNotFound(command.pipeline_run_id))?;

    // Cross-tenant replays look like a missing run.
    if source.tenant_id != command.tenant_id {
        return Err(OpError::PipelineRunNotFound(command.pipeline_run_id));
    }

    // Resolve the starting step against the source run; anything that
    // does not resolve falls back to a full replay.
    let (start_number, started_from_step) = match command.from_step_id {
        Some(step_id) => match step_db::get_step(pool, step_id).await? {
            Some(step) if step.pipeline_run_id == source.id => {
                (step.step_number, step.step_name.to_uppercase())
            }
            _ => (1, "STEP_1".to_owned()),
        },
        None => (1, "STEP_1".to_owned()),
    };

    let new_run = run_db::insert_run(
        pool,
        source.task_id,
        command.tenant_id,
        PipelineStatus::Running,
        start_number,
    )
    .await?;

    log_best_effort(
        audit,
        "pipeline_replayed",
        command.tenant_id,
        Some(command.user_id),
        "pipeline_run",
        &new_run.id.to_string(),
        json!({
            "source_pipeline_run_id": source.id,
            "task_id": source.task_id,
            "started_from_step": started_from_step,
            "from_step_id": command.from_step_id,
            "preserve_approved_artifacts": command.preserve_approved_artifacts,
        }),
    )
    .await;

    if let Some(dispatcher) = dispatcher {
        dispatcher.enqueue(Work::DriveRun {
            run_id: new_run.id,
        })?;
    }

    tracing::info!(
        source_run_id = %source.id,
        new_run_id = %new_run.id,
        started_from_step = %started_from_step,
        "pipeline replayed"
    );

    Ok(ReplayOutcome {
        new_pipeline_run_id: new_run.id,
        status: new_run.status,
        started_from_step,
    })
}
