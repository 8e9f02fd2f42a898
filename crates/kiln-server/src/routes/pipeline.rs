//! Pipeline control-plane handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiln_db::models::{DeadLetterEvent, PipelineStatus, TaskStatus};
use kiln_db::queries::tasks as task_db;
use kiln_core::dispatcher::Work;
use kiln_core::error::OpError;
use kiln_core::ops;
use kiln_core::ops::replay::ReplayCommand;
use kiln_core::ops::status::{PipelineList, PipelineStatusView, StepDetailView};
use kiln_core::ops::validate::ValidationOutcome;

use crate::auth::AuthContext;
use crate::error::AppError;
use crate::state::AppState;

/// Pre-flight validation.
pub async fn validate(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(task_id): Path<Uuid>,
) -> Result<Json<ValidationOutcome>, AppError> {
    let outcome = ops::validate::validate(
        &state.pool,
        state.billing.as_ref(),
        task_id,
        claims.tenant_id,
    )
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct RunPipelineResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub message: &'static str,
}

/// Validate, then start the pipeline in the background (202).
pub async fn run(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(task_id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunPipelineResponse>), AppError> {
    let validation = ops::validate::validate(
        &state.pool,
        state.billing.as_ref(),
        task_id,
        claims.tenant_id,
    )
    .await?;

    if !validation.eligible {
        return Err(AppError::bad_request(
            "INSUFFICIENT_CREDIT",
            validation
                .reason
                .unwrap_or_else(|| "Pipeline cannot start".to_owned()),
        ));
    }

    // A draft task is queued on the way through; an already-queued task
    // is dispatched as-is.
    let task = ops::tasks::get_task(&state.pool, task_id, claims.tenant_id).await?;
    match task.status {
        TaskStatus::Draft => {
            task_db::transition_task_status(
                &state.pool,
                task.id,
                TaskStatus::Draft,
                TaskStatus::Queued,
            )
            .await
            .map_err(OpError::from)?;
        }
        TaskStatus::Queued => {}
        other => return Err(OpError::InvalidTaskStatus(other.to_string()).into()),
    }

    state
        .dispatcher
        .enqueue(Work::ExecuteTask {
            task_id: task.id,
            tenant_id: claims.tenant_id,
        })
        .map_err(OpError::from)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RunPipelineResponse {
            task_id: task.id,
            status: TaskStatus::Queued,
            message: "Pipeline execution initiated",
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Paginated tenant listing.
pub async fn list(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Query(params): Query<ListParams>,
) -> Result<Json<PipelineList>, AppError> {
    let list = ops::status::list_pipelines(
        &state.pool,
        claims.tenant_id,
        params.status.as_deref(),
        params.limit,
        params.offset,
    )
    .await?;
    Ok(Json(list))
}

/// Full run state.
pub async fn status(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(run_id): Path<Uuid>,
) -> Result<Json<PipelineStatusView>, AppError> {
    let view = ops::status::pipeline_status(&state.pool, run_id, claims.tenant_id).await?;
    Ok(Json(view))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub pipeline_run_id: Uuid,
    pub previous_status: PipelineStatus,
    pub new_status: PipelineStatus,
    pub steps_completed: usize,
    pub steps_cancelled: usize,
    pub message: &'static str,
}

pub async fn cancel(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(run_id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<CancelResponse>, AppError> {
    let reason = body.as_ref().and_then(|b| b.reason.clone());
    let outcome = ops::cancel::cancel_pipeline(
        &state.pool,
        state.audit.as_ref(),
        &state.hub,
        run_id,
        claims.tenant_id,
        claims.user_id,
        reason.as_deref(),
    )
    .await?;

    Ok(Json(CancelResponse {
        pipeline_run_id: outcome.pipeline_run_id,
        previous_status: outcome.previous_status,
        new_status: outcome.new_status,
        steps_completed: outcome.steps_completed,
        steps_cancelled: outcome.steps_cancelled,
        message: "Pipeline cancelled",
    }))
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub pipeline_run_id: Uuid,
    pub status: PipelineStatus,
    pub current_step: i32,
    pub message: &'static str,
}

pub async fn resume(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ResumeResponse>, AppError> {
    let run = ops::resume::resume_pipeline(&state.pool, run_id, claims.tenant_id).await?;

    // Resume itself mutates no steps; the executor drives progress.
    state
        .dispatcher
        .enqueue(Work::DriveRun { run_id: run.id })
        .map_err(OpError::from)?;

    Ok(Json(ResumeResponse {
        pipeline_run_id: run.id,
        status: run.status,
        current_step: run.current_step,
        message: "Pipeline resumed successfully",
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayBody {
    #[serde(default)]
    pub from_step_id: Option<Uuid>,
    #[serde(default = "default_preserve")]
    pub preserve_approved_artifacts: bool,
}

fn default_preserve() -> bool {
    true
}

pub async fn replay(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(run_id): Path<Uuid>,
    body: Option<Json<ReplayBody>>,
) -> Result<Json<ops::replay::ReplayOutcome>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let outcome = ops::replay::replay_pipeline(
        &state.pool,
        state.audit.as_ref(),
        Some(&state.dispatcher),
        &ReplayCommand {
            pipeline_run_id: run_id,
            tenant_id: claims.tenant_id,
            user_id: claims.user_id,
            from_step_id: body.from_step_id,
            preserve_approved_artifacts: body.preserve_approved_artifacts,
        },
    )
    .await?;

    Ok(Json(outcome))
}

pub async fn step_details(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path((run_id, step_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<StepDetailView>, AppError> {
    let view =
        ops::status::step_details(&state.pool, run_id, step_id, claims.tenant_id).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct CompensateBody {
    pub step_run_id: Uuid,
    #[serde(default = "default_compensation_reason")]
    pub reason: String,
}

fn default_compensation_reason() -> String {
    "STEP_INVALIDATED".to_owned()
}

pub async fn compensate(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Json(body): Json<CompensateBody>,
) -> Result<Json<ops::compensate::CompensationOutcome>, AppError> {
    let outcome = ops::compensate::compensate_credits(
        &state.pool,
        state.billing.as_ref(),
        claims.tenant_id,
        body.step_run_id,
        &body.reason,
    )
    .await?;
    Ok(Json(outcome))
}

pub async fn list_dead_letters(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
) -> Result<Json<Vec<DeadLetterEvent>>, AppError> {
    let events = ops::dead_letter::list_unresolved(&state.pool, claims.tenant_id).await?;
    Ok(Json(events))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveBody {
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn resolve_dead_letter(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
    body: Option<Json<ResolveBody>>,
) -> Result<Json<DeadLetterEvent>, AppError> {
    let notes = body.as_ref().and_then(|b| b.notes.clone());
    let event =
        ops::dead_letter::resolve(&state.pool, id, claims.tenant_id, notes.as_deref()).await?;
    Ok(Json(event))
}
