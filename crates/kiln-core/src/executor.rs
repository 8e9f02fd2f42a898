//! Pipeline executor: drives one run end-to-end.
//!
//! Steps execute strictly in order. Each one freezes its input snapshot
//! on first execution, invokes the bound agent, records an agent run and
//! a versioned artifact, bills the tenant with an idempotent key, and
//! advances the run. Failures never escape: an agent error becomes a
//! `failed` step plus a scheduled retry (or a dead letter), billing
//! shortfalls pause the run, and billing outages defer to the retry
//! queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{
    ArtifactStatus, PipelineRun, PipelineStatus, StepStatus, StepType, Task, TaskStatus,
};
use kiln_db::queries::agent_runs::{self, NewAgentRun};
use kiln_db::queries::{pipeline_runs as run_db, pipeline_steps as step_db, tasks as task_db};

use crate::agent::AgentExecutor;
use crate::artifacts::{ArtifactDraft, ArtifactService};
use crate::audit::{AuditSink, log_best_effort};
use crate::billing::{BillingClient, BillingError, CreditRequest, retry_idempotency_key, step_idempotency_key};
use crate::error::{OpError, OpResult};
use crate::events::{EventHub, TenantEvent};
use crate::ops::billing_unavailable::{self, BillingRetryPolicy, BillingUnavailableCommand};
use crate::retry::{StepFailureOutcome, handle_step_failure};
use crate::state::{PipelineStateMachine, StepStateMachine, dispatch};
use crate::steps::{self, STEP_COUNT, STEPS};

/// Default retry budget for new steps.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Orchestrates pipeline runs. Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct PipelineExecutor {
    pub pool: PgPool,
    pub agents: Arc<dyn AgentExecutor>,
    pub billing: Arc<dyn BillingClient>,
    pub artifacts: ArtifactService,
    pub audit: Arc<dyn AuditSink>,
    pub hub: Arc<EventHub>,
}

impl PipelineExecutor {
    /// Execute the full pipeline for a queued task.
    ///
    /// Transitions the task to `running`, creates the run and its four
    /// pending steps, then drives them in order. Returns the run ID as
    /// soon as it exists in the caller's view -- but note this function
    /// runs the whole loop; background dispatch happens a layer up.
    pub async fn execute(&self, task_id: Uuid, tenant_id: Uuid) -> OpResult<Uuid> {
        let task = task_db::get_task(&self.pool, task_id, tenant_id)
            .await?
            .ok_or(OpError::TaskNotFound)?;

        if task.status != TaskStatus::Queued {
            return Err(OpError::InvalidTaskStatus(task.status.to_string()));
        }

        let rows =
            task_db::transition_task_status(&self.pool, task.id, TaskStatus::Queued, TaskStatus::Running)
                .await?;
        if rows == 0 {
            // Another dispatcher got here first.
            return Err(OpError::InvalidTaskStatus("running".to_owned()));
        }

        let run = run_db::insert_run(&self.pool, task.id, tenant_id, PipelineStatus::Running, 1)
            .await?;

        log_best_effort(
            self.audit.as_ref(),
            "pipeline_started",
            tenant_id,
            None,
            "pipeline_run",
            &run.id.to_string(),
            json!({ "task_id": task.id, "task_title": task.title }),
        )
        .await;

        for spec in &STEPS {
            step_db::insert_step(
                &self.pool,
                run.id,
                spec.number,
                spec.name,
                spec.step_type,
                DEFAULT_MAX_RETRIES,
            )
            .await?;
        }

        self.hub.publish(
            tenant_id,
            TenantEvent::new(
                "pipeline:started",
                json!({ "pipeline_run_id": run.id, "task_id": task.id }),
            ),
        );

        let run_id = run.id;
        self.run_loop(run, task).await?;
        Ok(run_id)
    }

    /// Continue an existing run from its current step.
    ///
    /// Used for forks (regenerate, replay) and resumed runs. Creates any
    /// step rows the run is missing, then enters the normal loop. A run
    /// that is not `running` is left untouched.
    pub async fn drive(&self, run_id: Uuid) -> OpResult<()> {
        let run = run_db::get_run(&self.pool, run_id)
            .await?
            .ok_or(OpError::PipelineRunNotFound(run_id))?;

        if run.status != PipelineStatus::Running {
            tracing::info!(
                run_id = %run_id,
                status = %run.status,
                "drive called on a run that is not running; nothing to do"
            );
            return Ok(());
        }

        let task = task_db::get_task(&self.pool, run.task_id, run.tenant_id)
            .await?
            .ok_or(OpError::TaskNotFound)?;

        let existing = step_db::list_steps_for_run(&self.pool, run.id).await?;
        for spec in &STEPS {
            if !existing.iter().any(|s| s.step_number == spec.number) {
                step_db::insert_step(
                    &self.pool,
                    run.id,
                    spec.number,
                    spec.name,
                    spec.step_type,
                    DEFAULT_MAX_RETRIES,
                )
                .await?;
            }
        }

        self.run_loop(run, task).await?;
        Ok(())
    }

    /// The per-step protocol. Exits (without error) whenever the run
    /// leaves the `running` state or a step hands control to the retry
    /// queue.
    async fn run_loop(&self, run: PipelineRun, task: Task) -> Result<()> {
        let mut context = initial_context(&task);

        // Fold in anything earlier steps already produced (replays and
        // resumed runs enter mid-sequence).
        for step in step_db::list_steps_for_run(&self.pool, run.id).await? {
            if step.status == StepStatus::Completed {
                if let Some(output) = &step.output {
                    merge_context(&mut context, output);
                }
            }
        }

        for number in run.current_step..=STEP_COUNT {
            // Fresh-load the run: cancellation and pauses from other
            // tasks must be observed before starting the next step.
            let current = run_db::get_run(&self.pool, run.id)
                .await?
                .with_context(|| format!("pipeline run {} disappeared", run.id))?;

            match current.status {
                PipelineStatus::Running => {}
                PipelineStatus::Cancelled | PipelineStatus::CancelledDueToInactivity => {
                    if let Some(step) =
                        step_db::get_step_by_number(&self.pool, run.id, number).await?
                    {
                        StepStateMachine::cancel_if_open(&self.pool, step.id).await?;
                    }
                    tracing::info!(run_id = %run.id, "run cancelled, aborting loop");
                    return Ok(());
                }
                _ => {
                    tracing::info!(
                        run_id = %run.id,
                        status = %current.status,
                        "run left the running state, aborting loop"
                    );
                    return Ok(());
                }
            }

            let step = step_db::get_step_by_number(&self.pool, run.id, number)
                .await?
                .with_context(|| format!("run {} has no step {number}", run.id))?;

            match step.status {
                StepStatus::Pending => {}
                StepStatus::Completed => {
                    if let Some(output) = &step.output {
                        merge_context(&mut context, output);
                    }
                    continue;
                }
                // A failed step belongs to the retry worker now; anything
                // else terminal means this run cannot make progress here.
                _ => {
                    tracing::info!(
                        run_id = %run.id,
                        step_number = number,
                        status = %step.status,
                        "step not pending, leaving run to the retry worker"
                    );
                    return Ok(());
                }
            }

            // Freeze the snapshot on first execution only; zero rows
            // means an earlier attempt already wrote it.
            step_db::freeze_input_snapshot(&self.pool, step.id, &context).await?;
            let step = step_db::get_step(&self.pool, step.id)
                .await?
                .with_context(|| format!("step {} disappeared", step.id))?;
            let snapshot = step.input_snapshot.clone().unwrap_or_else(|| context.clone());

            StepStateMachine::start(&self.pool, step.id).await?;

            let agent_type = steps::agent_for(step.step_type);
            let outcome = match self.agents.execute(agent_type, &snapshot).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("{} failed: {e:#}", step.step_name);
                    tracing::warn!(
                        run_id = %run.id,
                        step_id = %step.id,
                        error = %e,
                        "agent execution failed"
                    );
                    let routed =
                        handle_step_failure(&self.pool, self.audit.as_ref(), step.id, &message)
                            .await?;
                    if matches!(routed, StepFailureOutcome::DeadLettered(_)) {
                        self.publish_run_event(&run, "pipeline:failed", &message);
                    }
                    return Ok(());
                }
            };

            let actual_cost = outcome
                .estimated_cost_credits
                .to_i64()
                .unwrap_or_default();

            agent_runs::insert_agent_run(
                &self.pool,
                &NewAgentRun {
                    step_run_id: step.id,
                    pipeline_run_id: run.id,
                    agent_type,
                    model: self.agents.model().to_owned(),
                    prompt_tokens: outcome.prompt_tokens,
                    completion_tokens: outcome.completion_tokens,
                    estimated_cost_credits: actual_cost,
                    actual_cost_credits: actual_cost,
                    completed_at: Some(chrono::Utc::now()),
                },
            )
            .await?;

            self.artifacts
                .create_artifact(ArtifactDraft {
                    task_id: task.id,
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
                    }),
                })
                .await?;

            StepStateMachine::complete(&self.pool, step.id, &outcome.output).await?;
            merge_context(&mut context, &outcome.output);

            // Bill the step. First attempts use `{run}:{step}`; a step
            // that somehow carries retry budget already consumed gets the
            // retry-suffixed key so replays stay at-most-once per attempt.
            let key = if step.retry_count == 0 {
                step_idempotency_key(run.id, step.id)
            } else {
                retry_idempotency_key(run.id, step.id, step.retry_count)
            };
            let request = CreditRequest::new(run.tenant_id, Decimal::from(actual_cost), key.clone())
                .with_reference("pipeline_step", step.id.to_string())
                .with_metadata(json!({
                    "pipeline_run_id": run.id,
                    "step_id": step.id,
                    "step_type": step.step_type,
                }));

            match self.billing.consume_credits(&request).await {
                Ok(_) => {}
                Err(BillingError::InsufficientCredits(message)) => {
                    tracing::warn!(run_id = %run.id, %message, "insufficient credits, pausing run");
                    PipelineStateMachine::pause_for_insufficient_credit(&self.pool, run.id)
                        .await?;
                    self.publish_run_event(&run, "pipeline:paused", "INSUFFICIENT_CREDIT");
                    return Ok(());
                }
                Err(BillingError::Unavailable(message)) => {
                    tracing::error!(run_id = %run.id, %message, "billing unavailable, deferring");
                    let deferred = billing_unavailable::handle(
                        &self.pool,
                        self.audit.as_ref(),
                        &BillingRetryPolicy::default(),
                        &BillingUnavailableCommand {
                            step_run_id: step.id,
                            tenant_id: run.tenant_id,
                            amount: Decimal::from(actual_cost),
                            idempotency_key: key,
                            retry_attempt: 0,
                            error_message: Some(message),
                        },
                    )
                    .await;
                    if let Err(e) = deferred {
                        tracing::error!(
                            run_id = %run.id,
                            error = %e,
                            "failed to schedule billing retry"
                        );
                    }
                    return Ok(());
                }
                Err(BillingError::Api { status, message }) => {
                    // Permanent billing rejection; the step's work stands
                    // and the discrepancy is left to operators.
                    tracing::error!(
                        run_id = %run.id,
                        status,
                        %message,
                        "billing rejected consume, continuing"
                    );
                }
            }

            if number < STEP_COUNT {
                run_db::advance_current_step(&self.pool, run.id).await?;
            }
        }

        self.finish_run(&run, &task).await
    }

    /// Terminal behavior: all four steps completed while the run stayed
    /// `running`.
    async fn finish_run(&self, run: &PipelineRun, task: &Task) -> Result<()> {
        let current = run_db::get_run(&self.pool, run.id)
            .await?
            .with_context(|| format!("pipeline run {} disappeared", run.id))?;
        if current.status != PipelineStatus::Running {
            return Ok(());
        }

        dispatch::complete_run(&self.pool, run.id).await?;
        task_db::transition_task_status(&self.pool, task.id, TaskStatus::Running, TaskStatus::Completed)
            .await?;

        log_best_effort(
            self.audit.as_ref(),
            "pipeline_completed",
            run.tenant_id,
            None,
            "pipeline_run",
            &run.id.to_string(),
            json!({ "task_id": task.id, "total_steps": STEP_COUNT }),
        )
        .await;

        self.publish_run_event(run, "pipeline:completed", "completed");
        tracing::info!(run_id = %run.id, task_id = %task.id, "pipeline completed");
        Ok(())
    }

    fn publish_run_event(&self, run: &PipelineRun, event: &str, detail: &str) {
        self.hub.publish(
            run.tenant_id,
            TenantEvent::new(
                event,
                json!({
                    "pipeline_run_id": run.id,
                    "task_id": run.task_id,
                    "detail": detail,
                }),
            ),
        );
    }
}

/// The artifact produced by ANALYSIS is auto-approved (there is no
/// user-facing gate for it); everything else lands as a draft.
pub fn artifact_status_for(step_type: StepType) -> ArtifactStatus {
    match step_type {
        StepType::Analysis => ArtifactStatus::Approved,
        _ => ArtifactStatus::Draft,
    }
}

/// Seed the running context from the task's input spec.
fn initial_context(task: &Task) -> serde_json::Value {
    match &task.input_spec {
        serde_json::Value::Object(_) => task.input_spec.clone(),
        other => json!({ "input_spec": other }),
    }
}

/// Shallow-merge a step output into the accumulated context.
fn merge_context(context: &mut serde_json::Value, output: &serde_json::Value) {
    if let (Some(dst), Some(src)) = (context.as_object_mut(), output.as_object()) {
        for (key, value) in src {
            dst.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_artifacts_are_auto_approved() {
        assert_eq!(
            artifact_status_for(StepType::Analysis),
            ArtifactStatus::Approved
        );
        assert_eq!(
            artifact_status_for(StepType::UserStories),
            ArtifactStatus::Draft
        );
        assert_eq!(
            artifact_status_for(StepType::TestCases),
            ArtifactStatus::Draft
        );
    }

    #[test]
    fn context_merge_is_shallow_and_last_wins() {
        let mut ctx = json!({ "requirement": "Build API", "a": 1 });
        merge_context(&mut ctx, &json!({ "a": 2, "stories": [1, 2] }));
        assert_eq!(ctx["a"], 2);
        assert_eq!(ctx["requirement"], "Build API");
        assert_eq!(ctx["stories"], json!([1, 2]));
    }

    #[test]
    fn non_object_input_spec_is_wrapped() {
        let task = Task {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            title: "t".into(),
            input_spec: json!("just a string"),
            status: TaskStatus::Queued,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let ctx = initial_context(&task);
        assert_eq!(ctx["input_spec"], json!("just a string"));
    }
}
