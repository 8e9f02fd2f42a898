//! Task handlers.

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;
use uuid::Uuid;

use kiln_db::models::{Task, TaskStatus};
use kiln_core::ops;

use crate::auth::AuthContext;
use crate::error::AppError;
use crate::state::AppState;

pub async fn get_by_id(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    let task = ops::tasks::get_task(&state.pool, id, claims.tenant_id).await?;
    Ok(Json(task))
}

#[derive(Debug, Serialize)]
pub struct QueueTaskResponse {
    pub id: Uuid,
    pub status: TaskStatus,
    pub message: &'static str,
}

/// Draft -> queued, then hand the pipeline to the background dispatcher.
pub async fn queue(
    State(state): State<AppState>,
    AuthContext(claims): AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<QueueTaskResponse>, AppError> {
    let task =
        ops::queue_task::queue_task(&state.pool, &state.dispatcher, id, claims.tenant_id).await?;

    Ok(Json(QueueTaskResponse {
        id: task.id,
        status: task.status,
        message: "Task queued for execution",
    }))
}
