//! Project management operations.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{Project, ProjectStatus};
use kiln_db::queries::projects as project_db;

use crate::audit::{AuditSink, log_best_effort};
use crate::error::{OpError, OpResult};

/// Create a project for the caller's tenant.
pub async fn create_project(
    pool: &PgPool,
    audit: &dyn AuditSink,
    tenant_id: Uuid,
    user_id: Uuid,
    name: &str,
    description: Option<&str>,
) -> OpResult<Project> {
    let name = name.trim();
    if name.is_empty() {
        return Err(OpError::InvalidInput("project name cannot be empty".into()));
    }

    let project = project_db::insert_project(pool, tenant_id, name, description).await?;

    log_best_effort(
        audit,
        "project_created",
        tenant_id,
        Some(user_id),
        "project",
        &project.id.to_string(),
        json!({ "name": project.name }),
    )
    .await;

    Ok(project)
}

/// Fetch one project.
pub async fn get_project(pool: &PgPool, project_id: Uuid, tenant_id: Uuid) -> OpResult<Project> {
    project_db::get_project(pool, project_id, tenant_id)
        .await?
        .ok_or(OpError::ProjectNotFound)
}

/// All projects for the tenant, newest first.
pub async fn list_projects(pool: &PgPool, tenant_id: Uuid) -> OpResult<Vec<Project>> {
    Ok(project_db::list_projects(pool, tenant_id).await?)
}

/// Update a project's name, description, or status.
pub async fn update_project(
    pool: &PgPool,
    audit: &dyn AuditSink,
    project_id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
    status: Option<ProjectStatus>,
) -> OpResult<Project> {
    if let Some(name) = name {
        if name.trim().is_empty() {
            return Err(OpError::InvalidInput("project name cannot be empty".into()));
        }
    }

    let project = project_db::update_project(
        pool,
        project_id,
        tenant_id,
        name.map(str::trim),
        description,
        status,
    )
    .await?
    .ok_or(OpError::ProjectNotFound)?;

    log_best_effort(
        audit,
        "project_updated",
        tenant_id,
        Some(user_id),
        "project",
        &project.id.to_string(),
        json!({
            "name": project.name,
            "status": project.status,
        }),
    )
    .await;

    Ok(project)
}
