//! Query functions for the `agent_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentRun, AgentType};

/// Fields for a new agent-run row.
#[derive(Debug, Clone)]
pub struct NewAgentRun {
    pub step_run_id: Uuid,
    pub pipeline_run_id: Uuid,
    pub agent_type: AgentType,
    pub model: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub estimated_cost_credits: i64,
    pub actual_cost_credits: i64,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Insert a completed agent-run record.
pub async fn insert_agent_run(pool: &PgPool, new: &NewAgentRun) -> Result<AgentRun> {
    let run = sqlx::query_as::<_, AgentRun>(
        "INSERT INTO agent_runs \
             (step_run_id, pipeline_run_id, agent_type, model, prompt_tokens, \
              completion_tokens, estimated_cost_credits, actual_cost_credits, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.step_run_id)
    .bind(new.pipeline_run_id)
    .bind(new.agent_type)
    .bind(&new.model)
    .bind(new.prompt_tokens)
    .bind(new.completion_tokens)
    .bind(new.estimated_cost_credits)
    .bind(new.actual_cost_credits)
    .bind(new.completed_at)
    .fetch_one(pool)
    .await
    .context("failed to insert agent run")?;

    Ok(run)
}

/// List agent runs for a step, oldest first.
pub async fn list_for_step(pool: &PgPool, step_run_id: Uuid) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE step_run_id = $1 ORDER BY created_at ASC",
    )
    .bind(step_run_id)
    .fetch_all(pool)
    .await
    .context("failed to list agent runs for step")?;

    Ok(runs)
}

/// Fetch the most recent agent run for a step, if any.
pub async fn latest_for_step(pool: &PgPool, step_run_id: Uuid) -> Result<Option<AgentRun>> {
    let run = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE step_run_id = $1 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(step_run_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest agent run for step")?;

    Ok(run)
}

/// Total credits actually billed across all agent runs of a pipeline run.
pub async fn total_credits_for_run(pool: &PgPool, pipeline_run_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(actual_cost_credits), 0) \
         FROM agent_runs WHERE pipeline_run_id = $1",
    )
    .bind(pipeline_run_id)
    .fetch_one(pool)
    .await
    .context("failed to sum credits for run")?;

    Ok(row.0)
}
