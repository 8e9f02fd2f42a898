//! Query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Project, ProjectStatus};

/// Insert a new project row. Returns the inserted project with
/// server-generated defaults (id, status, timestamps).
pub async fn insert_project(
    pool: &PgPool,
    tenant_id: Uuid,
    name: &str,
    description: Option<&str>,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (tenant_id, name, description) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(tenant_id)
    .bind(name)
    .bind(description)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by ID, scoped to a tenant.
pub async fn get_project(pool: &PgPool, id: Uuid, tenant_id: Uuid) -> Result<Option<Project>> {
    let project =
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects for a tenant, newest first.
pub async fn list_projects(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE tenant_id = $1 ORDER BY created_at DESC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("failed to list projects")?;

    Ok(projects)
}

/// Update a project's mutable fields. `None` fields are left untouched.
pub async fn update_project(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
    status: Option<ProjectStatus>,
) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>(
        "UPDATE projects \
         SET name = COALESCE($3, name), \
             description = COALESCE($4, description), \
             status = COALESCE($5, status), \
             updated_at = now() \
         WHERE id = $1 AND tenant_id = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(name)
    .bind(description)
    .bind(status)
    .fetch_optional(pool)
    .await
    .context("failed to update project")?;

    Ok(project)
}
