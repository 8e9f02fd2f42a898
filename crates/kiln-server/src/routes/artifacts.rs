//! Artifact workflow handlers.

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiln_db::models::{Artifact, ArtifactStatus};
use kiln_db::queries::{artifacts as artifact_db, tasks as task_db};
use kiln_core::error::OpError;
use kiln_core::ops;

use crate::auth::AuthContext;
use crate::error::AppError;
use crate::state::AppState;

pub async fn get_by_id(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Artifact>, AppError> {
    let artifact = artifact_db::get_artifact(&state.pool, id)
        .await
        .map_err(OpError::from)?
        .ok_or(OpError::ArtifactNotFound)?;

    // Opaque across tenants.
    task_db::get_task(&state.pool, artifact.task_id, claims.tenant_id)
        .await
        .map_err(OpError::from)?
        .ok_or(OpError::ArtifactNotFound)?;

    Ok(Json(artifact))
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub id: Uuid,
    pub status: ArtifactStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub pipeline_run_id: Option<Uuid>,
    pub pipeline_resumed: bool,
}

pub async fn approve(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ApproveResponse>, AppError> {
    let outcome = ops::approve::approve_artifact(
        &state.pool,
        state.audit.as_ref(),
        &state.hub,
        Some(&state.dispatcher),
        id,
        claims.tenant_id,
        claims.user_id,
    )
    .await?;

    Ok(Json(ApproveResponse {
        id: outcome.artifact.id,
        status: outcome.artifact.status,
        approved_at: outcome.artifact.approved_at,
        pipeline_run_id: outcome.pipeline_run_id,
        pipeline_resumed: outcome.pipeline_resumed,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub regenerate: bool,
}

#[derive(Debug, Serialize)]
pub struct RejectResponse {
    pub id: Uuid,
    pub status: ArtifactStatus,
    pub rejected_at: Option<DateTime<Utc>>,
    pub new_pipeline_run_id: Option<Uuid>,
}

pub async fn reject(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
    body: Option<Json<RejectBody>>,
) -> Result<Json<RejectResponse>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let outcome = ops::reject::reject_artifact(
        &state.pool,
        state.audit.as_ref(),
        &state.hub,
        Some(&state.dispatcher),
        id,
        claims.tenant_id,
        claims.user_id,
        body.feedback.as_deref(),
        body.regenerate,
    )
    .await?;

    Ok(Json(RejectResponse {
        id: outcome.artifact.id,
        status: outcome.artifact.status,
        rejected_at: outcome.artifact.rejected_at,
        new_pipeline_run_id: outcome.new_pipeline_run_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub id: Uuid,
    pub status: ArtifactStatus,
}

pub async fn archive(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ArchiveResponse>, AppError> {
    let artifact = ops::archive::archive_artifact(&state.pool, id, claims.tenant_id).await?;
    Ok(Json(ArchiveResponse {
        id: artifact.id,
        status: artifact.status,
    }))
}
