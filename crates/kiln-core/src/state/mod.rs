//! Pipeline and step state machines.
//!
//! Validates and executes state transitions, enforcing the allowed
//! transition graphs, optimistic locking, timestamp management, and the
//! pause-reason invariant (`paused` iff at least one reason is present).

pub mod dispatch;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{PauseReason, PipelineRun, PipelineStatus, StepStatus};
use kiln_db::queries::pipeline_runs as run_db;
use kiln_db::queries::pipeline_steps as step_db;

/// How long an insufficient-credit pause stays open before operators are
/// expected to intervene. Informational only; nothing auto-expires it.
pub const PAUSE_WINDOW_DAYS: i64 = 7;

/// The pipeline-run state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// running -> paused     (a pause reason was added)
/// paused  -> running    (the last pause reason was cleared)
/// running -> completed
/// running -> failed
/// paused  -> failed
/// running -> cancelled
/// paused  -> cancelled
/// paused  -> cancelled_due_to_inactivity  (external sweeper)
/// ```
pub struct PipelineStateMachine;

impl PipelineStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: PipelineStatus, to: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (from, to),
            (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Failed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                | (Paused, CancelledDueToInactivity)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Sets `completed_at` when entering a terminal status and records the
    /// error message on `failed`. Returns an error if the transition is
    /// not valid, the run does not exist, or the stored status no longer
    /// matches `from` (lost race).
    pub async fn transition(
        pool: &PgPool,
        run_id: Uuid,
        from: PipelineStatus,
        to: PipelineStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid pipeline transition: {} -> {} for run {}",
                from,
                to,
                run_id
            );
        }

        let completed_at: Option<DateTime<Utc>> = to.is_terminal().then(Utc::now);

        let rows = run_db::transition_run_status(pool, run_id, from, to, completed_at, error_message)
            .await
            .with_context(|| {
                format!("failed to transition run {} from {} to {}", run_id, from, to)
            })?;

        if rows == 0 {
            let run = run_db::get_run(pool, run_id).await?;
            match run {
                None => bail!("pipeline run {} not found", run_id),
                Some(r) => bail!(
                    "optimistic lock failed: run {} has status {}, expected {}",
                    run_id,
                    r.status,
                    from
                ),
            }
        }

        Ok(())
    }

    /// Pause a run under the given reason.
    ///
    /// Idempotent per reason. `expires_at` is stored only when no expiry
    /// is already set. Returns the updated run, or an error if the run is
    /// missing or terminal.
    pub async fn pause(
        pool: &PgPool,
        run_id: Uuid,
        reason: PauseReason,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PipelineRun> {
        let run = run_db::add_pause_reason(pool, run_id, reason, expires_at)
            .await?
            .with_context(|| format!("cannot pause run {run_id}: not found or terminal"))?;
        Ok(run)
    }

    /// Pause for insufficient credits with the standard 7-day window.
    pub async fn pause_for_insufficient_credit(
        pool: &PgPool,
        run_id: Uuid,
    ) -> Result<PipelineRun> {
        let expires = Utc::now() + Duration::days(PAUSE_WINDOW_DAYS);
        Self::pause(pool, run_id, PauseReason::InsufficientCredit, Some(expires)).await
    }

    /// Clear one pause reason.
    ///
    /// Returns `(run, resumed)`. `resumed` is true when the cleared reason
    /// was the last one and the run flipped back to `running`. When the
    /// reason was not present (or the run is not paused) the stored row is
    /// returned unchanged with `resumed = false`.
    pub async fn clear_pause_reason(
        pool: &PgPool,
        run_id: Uuid,
        reason: PauseReason,
    ) -> Result<(PipelineRun, bool)> {
        if let Some(run) = run_db::remove_pause_reason(pool, run_id, reason).await? {
            let resumed = run.status == PipelineStatus::Running;
            return Ok((run, resumed));
        }

        let run = run_db::get_run(pool, run_id)
            .await?
            .with_context(|| format!("pipeline run {run_id} not found"))?;
        Ok((run, false))
    }
}

/// The step state machine.
///
/// ```text
/// pending -> running
/// running -> completed
/// running -> failed
/// failed  -> running     (retry; consumes one unit of retry budget)
/// pending -> cancelled
/// running -> cancelled
/// ```
pub struct StepStateMachine;

impl StepStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: StepStatus, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (from, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Running)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Failed, Cancelled)
                | (Completed, Invalidated)
        )
    }

    /// Start a pending step, stamping `started_at`.
    pub async fn start(pool: &PgPool, step_id: Uuid) -> Result<()> {
        let rows = step_db::start_step(pool, step_id).await?;
        if rows == 0 {
            bail!("cannot start step {}: not pending", step_id);
        }
        Ok(())
    }

    /// Re-start a failed step for a retry, incrementing `retry_count`.
    ///
    /// Fails when the step is not in `failed` or its retry budget is
    /// exhausted, so `retry_count <= max_retries` holds at every
    /// observable state.
    pub async fn begin_retry(pool: &PgPool, step_id: Uuid) -> Result<()> {
        let rows = step_db::begin_retry(pool, step_id).await?;
        if rows == 0 {
            bail!("cannot retry step {}: not failed or retries exhausted", step_id);
        }
        Ok(())
    }

    /// Complete a running step with its output.
    pub async fn complete(pool: &PgPool, step_id: Uuid, output: &serde_json::Value) -> Result<()> {
        let rows = step_db::complete_step(pool, step_id, output).await?;
        if rows == 0 {
            bail!("cannot complete step {}: not running", step_id);
        }
        Ok(())
    }

    /// Fail a running step with an error message.
    pub async fn fail(pool: &PgPool, step_id: Uuid, error_message: &str) -> Result<()> {
        let rows = step_db::fail_step(pool, step_id, error_message).await?;
        if rows == 0 {
            bail!("cannot fail step {}: not running", step_id);
        }
        Ok(())
    }

    /// Cancel a step if it has not reached a terminal state. Quietly does
    /// nothing when the step is already terminal (cancellation races are
    /// expected).
    pub async fn cancel_if_open(pool: &PgPool, step_id: Uuid) -> Result<bool> {
        let rows = step_db::cancel_step(pool, step_id).await?;
        Ok(rows > 0)
    }

    /// Cancel a step whose scheduled retry is being abandoned because the
    /// run left the `running` state. Also covers the `failed` state the
    /// step sits in while awaiting its retry.
    pub async fn cancel_abandoned(pool: &PgPool, step_id: Uuid) -> Result<bool> {
        let rows = step_db::cancel_abandoned_step(pool, step_id).await?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_graph_edges() {
        use PipelineStatus::*;
        assert!(PipelineStateMachine::is_valid_transition(Running, Paused));
        assert!(PipelineStateMachine::is_valid_transition(Paused, Running));
        assert!(PipelineStateMachine::is_valid_transition(Running, Completed));
        assert!(PipelineStateMachine::is_valid_transition(Paused, Cancelled));
        assert!(PipelineStateMachine::is_valid_transition(
            Paused,
            CancelledDueToInactivity
        ));

        // Terminal states have no outgoing edges.
        assert!(!PipelineStateMachine::is_valid_transition(Completed, Running));
        assert!(!PipelineStateMachine::is_valid_transition(Cancelled, Running));
        assert!(!PipelineStateMachine::is_valid_transition(Failed, Running));
        // No direct running -> cancelled_due_to_inactivity.
        assert!(!PipelineStateMachine::is_valid_transition(
            Running,
            CancelledDueToInactivity
        ));
    }

    #[test]
    fn step_graph_edges() {
        use StepStatus::*;
        assert!(StepStateMachine::is_valid_transition(Pending, Running));
        assert!(StepStateMachine::is_valid_transition(Running, Completed));
        assert!(StepStateMachine::is_valid_transition(Running, Failed));
        assert!(StepStateMachine::is_valid_transition(Failed, Running));
        assert!(StepStateMachine::is_valid_transition(Pending, Cancelled));
        assert!(StepStateMachine::is_valid_transition(Completed, Invalidated));

        assert!(!StepStateMachine::is_valid_transition(Completed, Running));
        assert!(!StepStateMachine::is_valid_transition(Cancelled, Running));
        assert!(!StepStateMachine::is_valid_transition(Pending, Completed));
    }
}
