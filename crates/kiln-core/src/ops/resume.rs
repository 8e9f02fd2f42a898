//! Manual pipeline resume.
//!
//! Valid only for a paused run whose pause reasons have all been
//! resolved. Resuming does not itself execute steps; callers re-enqueue
//! the run so the executor (or the retry worker) drives progress.

use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{PipelineRun, PipelineStatus};
use kiln_db::queries::pipeline_runs as run_db;

use crate::error::{OpError, OpResult};

/// Resume a paused run. Returns the refreshed run on success.
pub async fn resume_pipeline(
    pool: &PgPool,
    pipeline_run_id: Uuid,
    tenant_id: Uuid,
) -> OpResult<PipelineRun> {
    let run = run_db::get_run(pool, pipeline_run_id)
        .await?
        .ok_or(OpError::PipelineNotFound)?;

    if run.tenant_id != tenant_id {
        return Err(OpError::Unauthorized);
    }

    if run.status != PipelineStatus::Paused {
        return Err(OpError::NotPaused(run.status.to_string()));
    }

    if !run.can_resume() {
        return Err(OpError::CannotResume {
            reasons: run.pause_reasons.iter().map(ToString::to_string).collect(),
        });
    }

    if run_db::resume_run(pool, run.id).await? == 0 {
        // Raced with a pause or another resume; report what we now see.
        let current = run_db::get_run(pool, run.id)
            .await?
            .ok_or(OpError::PipelineNotFound)?;
        if current.status != PipelineStatus::Paused {
            return Err(OpError::NotPaused(current.status.to_string()));
        }
        return Err(OpError::CannotResume {
            reasons: current
                .pause_reasons
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
    }

    let run = run_db::get_run(pool, run.id)
        .await?
        .ok_or(OpError::PipelineNotFound)?;

    tracing::info!(run_id = %run.id, "pipeline resumed");
    Ok(run)
}
