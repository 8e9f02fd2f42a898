//! Export and git-sync job handlers.
//!
//! Creation returns 202 with a pending job; a spawned task processes it
//! and the status endpoints are for polling.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use kiln_db::models::{ExportJob, GitSyncJob};
use kiln_core::jobs;

use crate::auth::AuthContext;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateExportBody {
    pub project_id: Uuid,
}

pub async fn create_export(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Json(body): Json<CreateExportBody>,
) -> Result<(StatusCode, Json<ExportJob>), AppError> {
    let job = jobs::create_export_job(&state.pool, body.project_id, claims.tenant_id).await?;

    let pool = state.pool.clone();
    let sink = state.export_sink.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        if let Err(e) = jobs::process_export_job(&pool, sink.as_ref(), job_id).await {
            tracing::error!(job_id = %job_id, error = %format!("{e:#}"), "export processing failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn export_status(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ExportJob>, AppError> {
    let job = jobs::get_export_job(&state.pool, id, claims.tenant_id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct CreateGitSyncBody {
    pub artifact_id: Uuid,
    pub repository_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

fn default_branch() -> String {
    "main".to_owned()
}

fn default_commit_message() -> String {
    "Sync approved artifact".to_owned()
}

pub async fn create_git_sync(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Json(body): Json<CreateGitSyncBody>,
) -> Result<(StatusCode, Json<GitSyncJob>), AppError> {
    let job = jobs::create_git_sync_job(
        &state.pool,
        body.artifact_id,
        claims.tenant_id,
        &body.repository_url,
        &body.branch,
        &body.commit_message,
    )
    .await?;

    let pool = state.pool.clone();
    let pusher = state.git_pusher.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        if let Err(e) = jobs::process_git_sync_job(&pool, pusher.as_ref(), job_id).await {
            tracing::error!(job_id = %job_id, error = %format!("{e:#}"), "git sync processing failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn git_sync_status(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<GitSyncJob>, AppError> {
    let job = jobs::get_git_sync_job(&state.pool, id, claims.tenant_id).await?;
    Ok(Json(job))
}
