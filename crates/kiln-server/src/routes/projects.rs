//! Project and task-creation handlers.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use kiln_db::models::{Project, ProjectStatus, Task};
use kiln_core::ops;

use crate::auth::AuthContext;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateProjectBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Json(body): Json<CreateProjectBody>,
) -> Result<Json<Project>, AppError> {
    let project = ops::projects::create_project(
        &state.pool,
        state.audit.as_ref(),
        claims.tenant_id,
        claims.user_id,
        &body.name,
        body.description.as_deref(),
    )
    .await?;
    Ok(Json(project))
}

pub async fn list(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
) -> Result<Json<Vec<Project>>, AppError> {
    let projects = ops::projects::list_projects(&state.pool, claims.tenant_id).await?;
    Ok(Json(projects))
}

pub async fn get_by_id(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Project>, AppError> {
    let project = ops::projects::get_project(&state.pool, id, claims.tenant_id).await?;
    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateProjectBody>,
) -> Result<Json<Project>, AppError> {
    let status = match body.status.as_deref() {
        Some(raw) => Some(raw.parse::<ProjectStatus>().map_err(|_| {
            AppError::bad_request("INVALID_STATUS", format!("invalid project status: {raw}"))
        })?),
        None => None,
    };

    let project = ops::projects::update_project(
        &state.pool,
        state.audit.as_ref(),
        id,
        claims.tenant_id,
        claims.user_id,
        body.name.as_deref(),
        body.description.as_deref(),
        status,
    )
    .await?;
    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub title: String,
    pub input_spec: serde_json::Value,
}

pub async fn create_task(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<Task>, AppError> {
    let task = ops::tasks::create_task(
        &state.pool,
        state.audit.as_ref(),
        project_id,
        claims.tenant_id,
        claims.user_id,
        &body.title,
        body.input_spec,
    )
    .await?;
    Ok(Json(task))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = ops::tasks::list_tasks(&state.pool, project_id, claims.tenant_id).await?;
    Ok(Json(tasks))
}
