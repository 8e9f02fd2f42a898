//! Convenience dispatch helpers that wrap the state machines with
//! semantic names.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::PipelineStatus;

use super::PipelineStateMachine;

/// Complete a run: transition `running -> completed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn complete_run(pool: &PgPool, run_id: Uuid) -> Result<()> {
    PipelineStateMachine::transition(
        pool,
        run_id,
        PipelineStatus::Running,
        PipelineStatus::Completed,
        None,
    )
    .await
}

/// Fail a running run with an error message.
///
/// Sets `completed_at` to the current timestamp.
pub async fn fail_run(pool: &PgPool, run_id: Uuid, error_message: &str) -> Result<()> {
    PipelineStateMachine::transition(
        pool,
        run_id,
        PipelineStatus::Running,
        PipelineStatus::Failed,
        Some(error_message),
    )
    .await
}

/// Fail a paused run with an error message (retries exhausted while the
/// run sat paused).
pub async fn fail_paused_run(pool: &PgPool, run_id: Uuid, error_message: &str) -> Result<()> {
    PipelineStateMachine::transition(
        pool,
        run_id,
        PipelineStatus::Paused,
        PipelineStatus::Failed,
        Some(error_message),
    )
    .await
}

/// Fail a run regardless of whether it is currently running or paused.
pub async fn fail_run_any(pool: &PgPool, run_id: Uuid, error_message: &str) -> Result<()> {
    if fail_run(pool, run_id, error_message).await.is_ok() {
        return Ok(());
    }
    fail_paused_run(pool, run_id, error_message).await
}
