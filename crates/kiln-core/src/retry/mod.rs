//! Retry machinery: backoff scheduling, the shared step-failure handler,
//! and the background worker that re-executes due retries.

pub mod scheduler;
pub mod worker;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{DeadLetterEvent, PipelineStepRun, RetryJob, TaskStatus};
use kiln_db::queries::{dead_letters as dlq_db, pipeline_runs as run_db, pipeline_steps as step_db, tasks as task_db};

use crate::audit::{AuditSink, log_best_effort};
use crate::state::dispatch;

pub use scheduler::RetryScheduler;
pub use worker::{RetryWorker, RetryWorkerConfig, spawn_retry_worker};

/// What became of a failed step.
#[derive(Debug)]
pub enum StepFailureOutcome {
    /// A retry job was persisted; the worker will pick it up when due.
    RetryScheduled(RetryJob),
    /// Retries are exhausted: a dead letter exists and the pipeline (and
    /// its task) are failed.
    DeadLettered(DeadLetterEvent),
}

/// Record a step failure and route it: schedule the next retry while
/// budget remains, otherwise dead-letter the step and fail the run.
///
/// The step must currently be `running`; `retry_count` is left as the
/// number of retries already consumed (the worker increments it when it
/// actually re-executes).
pub async fn handle_step_failure(
    pool: &PgPool,
    audit: &dyn AuditSink,
    step_id: Uuid,
    error_message: &str,
) -> Result<StepFailureOutcome> {
    crate::state::StepStateMachine::fail(pool, step_id, error_message).await?;

    let step = step_db::get_step(pool, step_id)
        .await?
        .with_context(|| format!("step {step_id} disappeared after failing"))?;

    if step.is_retryable() {
        let job = RetryScheduler::schedule_retry(pool, step.id, step.retry_count).await?;
        tracing::info!(
            step_id = %step.id,
            retry_count = step.retry_count,
            scheduled_at = %job.scheduled_at,
            "scheduled step retry"
        );
        return Ok(StepFailureOutcome::RetryScheduled(job));
    }

    let event = dead_letter_step(pool, audit, &step, error_message).await?;
    Ok(StepFailureOutcome::DeadLettered(event))
}

/// Dead-letter an exhausted step and drive the run and task to `failed`.
pub async fn dead_letter_step(
    pool: &PgPool,
    audit: &dyn AuditSink,
    step: &PipelineStepRun,
    error_message: &str,
) -> Result<DeadLetterEvent> {
    let event = dlq_db::insert_dead_letter(
        pool,
        step.pipeline_run_id,
        step.id,
        "Retries exhausted",
        step.retry_count,
        &json!({
            "step_type": step.step_type,
            "step_number": step.step_number,
            "max_retries": step.max_retries,
            "last_error": error_message,
        }),
    )
    .await?;

    tracing::error!(
        step_id = %step.id,
        pipeline_run_id = %step.pipeline_run_id,
        retry_count = step.retry_count,
        "retries exhausted, dead-lettered step"
    );

    let run = run_db::get_run(pool, step.pipeline_run_id)
        .await?
        .with_context(|| format!("pipeline run {} not found", step.pipeline_run_id))?;

    if !run.status.is_terminal() {
        dispatch::fail_run_any(pool, run.id, error_message).await?;
        // Best-effort: the task may already sit in a terminal state if an
        // earlier run finished it.
        let _ =
            task_db::transition_task_status(pool, run.task_id, TaskStatus::Running, TaskStatus::Failed)
                .await?;

        log_best_effort(
            audit,
            "pipeline_failed",
            run.tenant_id,
            None,
            "pipeline_run",
            &run.id.to_string(),
            json!({
                "task_id": run.task_id,
                "error_message": error_message,
                "failed_step": step.step_number,
                "dead_letter_event_id": event.id,
            }),
        )
        .await;
    }

    Ok(event)
}
