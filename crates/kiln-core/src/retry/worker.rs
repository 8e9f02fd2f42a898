//! Background retry worker.
//!
//! Polls for due retry jobs and re-executes their steps from the stored
//! input snapshot. The loop never propagates errors: a bad job is marked
//! failed and the poll continues. Cancellations are observed before any
//! re-execution, and successful retries hand the run back to the
//! executor so the remaining steps keep flowing.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use kiln_db::models::{PipelineRun, PipelineStepRun, RetryJob, RetryStatus, StepStatus};
use kiln_db::queries::agent_runs::{self, NewAgentRun};
use kiln_db::queries::{pipeline_runs as run_db, pipeline_steps as step_db, retry_jobs as retry_db};

use crate::artifacts::ArtifactDraft;
use crate::billing::{BillingError, CreditRequest, retry_idempotency_key, step_idempotency_key};
use crate::error::OpError;
use crate::events::TenantEvent;
use crate::executor::{PipelineExecutor, artifact_status_for};
use crate::ops::billing_unavailable::{self, BillingRetryPolicy, BillingUnavailableCommand};
use crate::retry::{StepFailureOutcome, handle_step_failure};
use crate::state::{PipelineStateMachine, StepStateMachine};
use crate::steps;

/// Configuration for the retry worker.
#[derive(Debug, Clone)]
pub struct RetryWorkerConfig {
    /// How often to poll for due jobs.
    pub poll_interval: Duration,
    /// Backoff policy for deferred billing retries.
    pub billing_policy: BillingRetryPolicy,
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            billing_policy: BillingRetryPolicy::default(),
        }
    }
}

/// Polls due retry jobs and re-executes failed steps.
pub struct RetryWorker {
    executor: PipelineExecutor,
    config: RetryWorkerConfig,
}

impl RetryWorker {
    pub fn new(executor: PipelineExecutor, config: RetryWorkerConfig) -> Self {
        Self { executor, config }
    }

    /// Run the poll loop until cancelled. Per-tick errors are logged and
    /// swallowed; the loop itself never fails.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "retry worker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "error processing retry jobs");
                    }
                }
            }
        }

        tracing::info!("retry worker stopped");
    }

    /// One poll: process every due job in `scheduled_at` order. Returns
    /// how many jobs were picked up.
    pub async fn tick(&self) -> Result<usize> {
        let due = retry_db::get_due_jobs(&self.executor.pool, Utc::now()).await?;
        let count = due.len();

        if count > 0 {
            tracing::info!(count, "found due retry jobs");
        }

        for job in due {
            let job_id = job.id;
            if let Err(e) = self.process_job(job).await {
                tracing::error!(job_id = %job_id, error = %e, "error processing retry job");
                let _ =
                    retry_db::finish_job(&self.executor.pool, job_id, RetryStatus::Failed).await;
            }
        }

        Ok(count)
    }

    async fn process_job(&self, job: RetryJob) -> Result<()> {
        let pool = &self.executor.pool;

        // Claim first; a second worker (or an overlapping tick) loses the
        // race and skips the job.
        if retry_db::claim_job(pool, job.id).await? == 0 {
            return Ok(());
        }

        tracing::info!(job_id = %job.id, step_id = %job.step_run_id, "processing retry job");

        let Some(step) = step_db::get_step(pool, job.step_run_id).await? else {
            tracing::error!(job_id = %job.id, step_id = %job.step_run_id, "step run not found");
            retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
            return Ok(());
        };

        let Some(run) = run_db::get_run(pool, step.pipeline_run_id).await? else {
            tracing::error!(job_id = %job.id, run_id = %step.pipeline_run_id, "pipeline run not found");
            retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
            return Ok(());
        };

        // Cancellation must be observed before re-executing.
        if run.status.is_terminal() {
            tracing::info!(
                job_id = %job.id,
                run_id = %run.id,
                status = %run.status,
                "run is terminal, skipping retry"
            );
            StepStateMachine::cancel_abandoned(pool, step.id).await?;
            retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
            return Ok(());
        }

        match step.status {
            StepStatus::Failed => self.retry_step(&job, step, run).await,
            // A completed step with a retry job is a deferred billing
            // call: the work stands, only the consume needs replaying.
            StepStatus::Completed => self.retry_billing(&job, &step, &run).await,
            other => {
                tracing::warn!(
                    job_id = %job.id,
                    step_id = %step.id,
                    status = %other,
                    "retry job points at a step that is neither failed nor completed"
                );
                retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
                Ok(())
            }
        }
    }

    /// Re-execute a failed step from its frozen input snapshot.
    async fn retry_step(
        &self,
        job: &RetryJob,
        step: PipelineStepRun,
        run: PipelineRun,
    ) -> Result<()> {
        let pool = &self.executor.pool;

        // failed -> running, consuming one unit of retry budget.
        if step_db::begin_retry(pool, step.id).await? == 0 {
            tracing::warn!(
                job_id = %job.id,
                step_id = %step.id,
                "step no longer retryable, dropping job"
            );
            retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
            return Ok(());
        }

        let step = step_db::get_step(pool, step.id)
            .await?
            .with_context(|| format!("step {} disappeared mid-retry", step.id))?;

        // Retries always replay the frozen snapshot, never the current
        // task state.
        let Some(snapshot) = step.input_snapshot.clone() else {
            bail!("step {} has no input snapshot to retry from", step.id);
        };

        let agent_type = steps::agent_for(step.step_type);
        let outcome = match self.executor.agents.execute(agent_type, &snapshot).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("{} failed: {e:#}", step.step_name);
                tracing::warn!(
                    job_id = %job.id,
                    step_id = %step.id,
                    error = %e,
                    "agent execution failed on retry"
                );
                let routed =
                    handle_step_failure(pool, self.executor.audit.as_ref(), step.id, &message)
                        .await?;
                if matches!(routed, StepFailureOutcome::DeadLettered(_)) {
                    self.executor.hub.publish(
                        run.tenant_id,
                        TenantEvent::new(
                            "pipeline:failed",
                            json!({
                                "pipeline_run_id": run.id,
                                "task_id": run.task_id,
                                "detail": message,
                            }),
                        ),
                    );
                }
                retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
                return Ok(());
            }
        };

        let actual_cost = outcome.estimated_cost_credits.to_i64().unwrap_or_default();

        agent_runs::insert_agent_run(
            pool,
            &NewAgentRun {
                step_run_id: step.id,
                pipeline_run_id: run.id,
                agent_type,
                model: self.executor.agents.model().to_owned(),
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
                estimated_cost_credits: actual_cost,
                actual_cost_credits: actual_cost,
                completed_at: Some(Utc::now()),
            },
        )
        .await?;

        self.executor
            .artifacts
            .create_artifact(ArtifactDraft {
                task_id: run.task_id,
                pipeline_run_id: run.id,
                step_run_id: step.id,
                artifact_type: steps::artifact_type_for(step.step_type),
                status: artifact_status_for(step.step_type),
                content_text: serde_json::to_string_pretty(&outcome.output)
                    .unwrap_or_else(|_| outcome.output.to_string()),
                metadata: json!({
                    "step_name": step.step_name,
                    "step_number": step.step_number,
                    "agent_type": agent_type,
                    "retry_count": step.retry_count,
                }),
            })
            .await?;

        StepStateMachine::complete(pool, step.id, &outcome.output).await?;

        // Bill with the retry-suffixed key so this attempt is debited at
        // most once even if two workers raced here.
        let key = retry_idempotency_key(run.id, step.id, step.retry_count);
        let paused = self
            .consume_for_step(&run, &step, Decimal::from(actual_cost), key)
            .await?;

        if run.current_step == step.step_number && step.step_number < steps::STEP_COUNT {
            run_db::advance_current_step(pool, run.id).await?;
        }

        retry_db::finish_job(pool, job.id, RetryStatus::Completed).await?;
        tracing::info!(
            job_id = %job.id,
            step_id = %step.id,
            retry_count = step.retry_count,
            "retry succeeded"
        );

        // The step is done; let the executor carry the run forward unless
        // billing just paused it.
        if !paused {
            if let Err(e) = self.executor.drive(run.id).await {
                match e {
                    OpError::Internal(e) => return Err(e),
                    other => tracing::warn!(
                        run_id = %run.id,
                        error = %other,
                        "could not continue run after retry"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Replay a deferred consume for a step whose work already stands.
    async fn retry_billing(
        &self,
        job: &RetryJob,
        step: &PipelineStepRun,
        run: &PipelineRun,
    ) -> Result<()> {
        let pool = &self.executor.pool;

        let Some(agent_run) = agent_runs::latest_for_step(pool, step.id).await? else {
            tracing::error!(
                job_id = %job.id,
                step_id = %step.id,
                "no agent run behind deferred billing job"
            );
            retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
            return Ok(());
        };

        // The original attempt's key: replays return the original
        // transaction if the earlier call actually landed.
        let key = if step.retry_count == 0 {
            step_idempotency_key(run.id, step.id)
        } else {
            retry_idempotency_key(run.id, step.id, step.retry_count)
        };

        let amount = Decimal::from(agent_run.actual_cost_credits);
        let request = CreditRequest::new(run.tenant_id, amount, key.clone())
            .with_reference("pipeline_step", step.id.to_string())
            .with_metadata(json!({
                "pipeline_run_id": run.id,
                "step_id": step.id,
                "billing_retry_attempt": job.retry_attempt,
            }));

        match self.executor.billing.consume_credits(&request).await {
            Ok(_) => {
                retry_db::finish_job(pool, job.id, RetryStatus::Completed).await?;
                tracing::info!(job_id = %job.id, step_id = %step.id, "deferred billing settled");
                // The run stopped at this step waiting on billing; pick it
                // back up now that the consume landed.
                self.continue_run_after_billing(run, step).await?;
            }
            Err(BillingError::InsufficientCredits(message)) => {
                tracing::warn!(job_id = %job.id, %message, "insufficient credits on deferred billing");
                PipelineStateMachine::pause_for_insufficient_credit(pool, run.id).await?;
                retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
            }
            Err(BillingError::Unavailable(message)) => {
                tracing::error!(job_id = %job.id, %message, "billing still unavailable");
                let rescheduled = billing_unavailable::handle(
                    pool,
                    self.executor.audit.as_ref(),
                    &self.config.billing_policy,
                    &BillingUnavailableCommand {
                        step_run_id: step.id,
                        tenant_id: run.tenant_id,
                        amount,
                        idempotency_key: key,
                        retry_attempt: job.retry_attempt,
                        error_message: Some(message),
                    },
                )
                .await;
                retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
                if let Err(e) = rescheduled {
                    // Retries exhausted (or scheduling failed): the step's
                    // work stands, the discrepancy is left to operators,
                    // and the run must not stay wedged behind it.
                    tracing::error!(
                        job_id = %job.id,
                        error = %e,
                        "giving up on deferred billing, continuing run"
                    );
                    self.continue_run_after_billing(run, step).await?;
                }
            }
            Err(BillingError::Api { status, message }) => {
                // Permanent rejection: same operator-facing discrepancy as
                // exhaustion; the run keeps going.
                tracing::error!(job_id = %job.id, status, %message, "billing rejected deferred consume");
                retry_db::finish_job(pool, job.id, RetryStatus::Failed).await?;
                self.continue_run_after_billing(run, step).await?;
            }
        }

        Ok(())
    }

    /// A deferred consume reached a final outcome: advance past the step
    /// whose billing held the run up, then hand it back to the executor.
    async fn continue_run_after_billing(
        &self,
        run: &PipelineRun,
        step: &PipelineStepRun,
    ) -> Result<()> {
        if run.current_step == step.step_number && step.step_number < steps::STEP_COUNT {
            run_db::advance_current_step(&self.executor.pool, run.id).await?;
        }

        if let Err(e) = self.executor.drive(run.id).await {
            match e {
                OpError::Internal(e) => return Err(e),
                other => tracing::warn!(
                    run_id = %run.id,
                    error = %other,
                    "could not continue run after deferred billing"
                ),
            }
        }

        Ok(())
    }

    /// Consume credits for a just-completed step. Returns `true` when the
    /// run was paused for insufficient credits.
    async fn consume_for_step(
        &self,
        run: &PipelineRun,
        step: &PipelineStepRun,
        amount: Decimal,
        key: String,
    ) -> Result<bool> {
        let pool = &self.executor.pool;
        let request = CreditRequest::new(run.tenant_id, amount, key.clone())
            .with_reference("pipeline_step_retry", step.id.to_string())
            .with_metadata(json!({
                "pipeline_run_id": run.id,
                "step_id": step.id,
                "step_type": step.step_type,
                "retry_count": step.retry_count,
            }));

        match self.executor.billing.consume_credits(&request).await {
            Ok(_) => Ok(false),
            Err(BillingError::InsufficientCredits(message)) => {
                tracing::warn!(run_id = %run.id, %message, "insufficient credits on retry");
                PipelineStateMachine::pause_for_insufficient_credit(pool, run.id).await?;
                Ok(true)
            }
            Err(BillingError::Unavailable(message)) => {
                tracing::error!(run_id = %run.id, %message, "billing unavailable on retry");
                let deferred = billing_unavailable::handle(
                    pool,
                    self.executor.audit.as_ref(),
                    &self.config.billing_policy,
                    &BillingUnavailableCommand {
                        step_run_id: step.id,
                        tenant_id: run.tenant_id,
                        amount,
                        idempotency_key: key,
                        retry_attempt: 0,
                        error_message: Some(message),
                    },
                )
                .await;
                if let Err(e) = deferred {
                    tracing::error!(run_id = %run.id, error = %e, "failed to defer billing");
                }
                Ok(false)
            }
            Err(BillingError::Api { status, message }) => {
                tracing::error!(run_id = %run.id, status, %message, "billing rejected retry consume");
                Ok(false)
            }
        }
    }
}

/// Convenience: spawn the worker on the runtime, returning the token that
/// stops it.
pub fn spawn_retry_worker(
    executor: PipelineExecutor,
    config: RetryWorkerConfig,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        RetryWorker::new(executor, config).run(token).await;
    });
    (cancel, handle)
}
