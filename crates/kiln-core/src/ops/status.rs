//! Read-side aggregation: pipeline status, step detail, tenant listing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{
    AgentType, ArtifactStatus, ArtifactType, PauseReason, PipelineStatus, StepStatus, StepType,
};
use kiln_db::queries::{
    agent_runs, artifacts as artifact_db, pipeline_runs as run_db, pipeline_steps as step_db,
};

use crate::error::{OpError, OpResult};

/// Compact artifact view embedded in step summaries.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub id: Uuid,
    pub artifact_type: ArtifactType,
    pub status: ArtifactStatus,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

/// One step of a run, as shown in the pipeline view.
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub id: Uuid,
    pub step_number: i32,
    pub step_type: StepType,
    pub status: StepStatus,
    pub retry_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifact: Option<ArtifactSummary>,
}

/// Full state of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatusView {
    pub pipeline_run_id: Uuid,
    pub task_id: Uuid,
    pub tenant_id: Uuid,
    pub status: PipelineStatus,
    pub current_step: i32,
    pub pause_reasons: Vec<PauseReason>,
    pub total_credits_consumed: i64,
    pub steps: Vec<StepSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Agent-run details on the step view.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRunView {
    pub id: Uuid,
    pub agent_type: AgentType,
    pub model: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub estimated_cost_credits: i64,
    pub actual_cost_credits: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Detailed state of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepDetailView {
    pub step_id: Uuid,
    pub pipeline_run_id: Uuid,
    pub step_number: i32,
    pub step_type: StepType,
    pub status: StepStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_snapshot: Option<serde_json::Value>,
    pub agent_run: Option<AgentRunView>,
    pub artifact: Option<ArtifactSummary>,
}

/// One row of the tenant pipeline listing.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineListItem {
    pub pipeline_run_id: Uuid,
    pub task_id: Uuid,
    pub status: PipelineStatus,
    pub current_step: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Paginated tenant listing.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineList {
    pub items: Vec<PipelineListItem>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Full pipeline state: run + steps + per-step artifact + credits.
pub async fn pipeline_status(
    pool: &PgPool,
    pipeline_run_id: Uuid,
    tenant_id: Uuid,
) -> OpResult<PipelineStatusView> {
    let run = run_db::get_run(pool, pipeline_run_id)
        .await?
        .ok_or(OpError::PipelineNotFound)?;

    if run.tenant_id != tenant_id {
        return Err(OpError::Unauthorized);
    }

    let steps = step_db::list_steps_for_run(pool, run.id).await?;
    let total_credits_consumed = agent_runs::total_credits_for_run(pool, run.id).await?;

    let mut summaries = Vec::with_capacity(steps.len());
    for step in steps {
        let artifact = artifact_db::list_for_step(pool, step.id)
            .await?
            .into_iter()
            .next_back()
            .map(|a| ArtifactSummary {
                id: a.id,
                artifact_type: a.artifact_type,
                status: a.status,
                version: a.version,
                created_at: a.created_at,
            });

        summaries.push(StepSummary {
            id: step.id,
            step_number: step.step_number,
            step_type: step.step_type,
            status: step.status,
            retry_count: step.retry_count,
            started_at: step.started_at,
            completed_at: step.completed_at,
            artifact,
        });
    }

    Ok(PipelineStatusView {
        pipeline_run_id: run.id,
        task_id: run.task_id,
        tenant_id: run.tenant_id,
        status: run.status,
        current_step: run.current_step,
        pause_reasons: run.pause_reasons.0.clone(),
        total_credits_consumed,
        steps: summaries,
        created_at: run.created_at,
        updated_at: run.updated_at,
        paused_at: run.paused_at,
        pause_expires_at: run.pause_expires_at,
        completed_at: run.completed_at,
    })
}

/// Step detail: the step, its latest agent run, its artifact, and the
/// frozen input snapshot.
pub async fn step_details(
    pool: &PgPool,
    pipeline_run_id: Uuid,
    step_id: Uuid,
    tenant_id: Uuid,
) -> OpResult<StepDetailView> {
    let run = run_db::get_run(pool, pipeline_run_id)
        .await?
        .ok_or(OpError::PipelineNotFound)?;

    if run.tenant_id != tenant_id {
        return Err(OpError::Unauthorized);
    }

    let step = step_db::get_step(pool, step_id)
        .await?
        .filter(|s| s.pipeline_run_id == pipeline_run_id)
        .ok_or(OpError::StepRunNotFound(step_id))?;

    let agent_run = agent_runs::latest_for_step(pool, step.id)
        .await?
        .map(|a| AgentRunView {
            id: a.id,
            agent_type: a.agent_type,
            model: a.model,
            prompt_tokens: a.prompt_tokens,
            completion_tokens: a.completion_tokens,
            estimated_cost_credits: a.estimated_cost_credits,
            actual_cost_credits: a.actual_cost_credits,
            started_at: a.created_at,
            completed_at: a.completed_at,
        });

    let artifact = artifact_db::list_for_step(pool, step.id)
        .await?
        .into_iter()
        .next_back()
        .map(|a| ArtifactSummary {
            id: a.id,
            artifact_type: a.artifact_type,
            status: a.status,
            version: a.version,
            created_at: a.created_at,
        });

    Ok(StepDetailView {
        step_id: step.id,
        pipeline_run_id: step.pipeline_run_id,
        step_number: step.step_number,
        step_type: step.step_type,
        status: step.status,
        retry_count: step.retry_count,
        max_retries: step.max_retries,
        started_at: step.started_at,
        completed_at: step.completed_at,
        input_snapshot: step.input_snapshot,
        agent_run,
        artifact,
    })
}

/// Paginated tenant listing with an optional status filter string.
pub async fn list_pipelines(
    pool: &PgPool,
    tenant_id: Uuid,
    status_filter: Option<&str>,
    limit: i64,
    offset: i64,
) -> OpResult<PipelineList> {
    let status = match status_filter {
        Some(raw) => Some(
            PipelineStatus::from_str(raw).map_err(|_| OpError::InvalidStatus(raw.to_owned()))?,
        ),
        None => None,
    };

    let limit = limit.clamp(1, 100);
    let offset = offset.max(0);

    let total = run_db::count_runs_for_tenant(pool, tenant_id, status).await?;
    let runs = run_db::list_runs_for_tenant(pool, tenant_id, status, limit, offset).await?;

    Ok(PipelineList {
        items: runs
            .into_iter()
            .map(|run| PipelineListItem {
                pipeline_run_id: run.id,
                task_id: run.task_id,
                status: run.status,
                current_step: run.current_step,
                created_at: run.created_at,
                updated_at: run.updated_at,
            })
            .collect(),
        total,
        limit,
        offset,
    })
}
