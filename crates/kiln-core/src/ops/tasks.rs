//! Task management operations, including input-spec validation.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{ProjectStatus, Task};
use kiln_db::queries::{projects as project_db, tasks as task_db};

use crate::audit::{AuditSink, log_best_effort};
use crate::error::{OpError, OpResult};

/// Validate a task input spec: a non-empty JSON object whose keys are
/// non-blank strings. (Values may be any JSON type.)
pub fn validate_input_spec(input_spec: &serde_json::Value) -> OpResult<()> {
    let Some(object) = input_spec.as_object() else {
        return Err(OpError::InvalidInputSpec(
            "input_spec must be a JSON object".into(),
        ));
    };

    if object.is_empty() {
        return Err(OpError::InvalidInputSpec("input_spec cannot be empty".into()));
    }

    for key in object.keys() {
        if key.trim().is_empty() {
            return Err(OpError::InvalidInputSpec(format!(
                "invalid key {key:?}: keys must be non-empty strings"
            )));
        }
    }

    Ok(())
}

/// Create a draft task in an active project.
pub async fn create_task(
    pool: &PgPool,
    audit: &dyn AuditSink,
    project_id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
    title: &str,
    input_spec: serde_json::Value,
) -> OpResult<Task> {
    let project = project_db::get_project(pool, project_id, tenant_id)
        .await?
        .ok_or(OpError::ProjectNotFound)?;

    // Archived projects accept no new work.
    if project.status != ProjectStatus::Active {
        return Err(OpError::ProjectNotActive);
    }

    let title = title.trim();
    if title.is_empty() {
        return Err(OpError::InvalidInput("task title cannot be empty".into()));
    }

    validate_input_spec(&input_spec)?;

    let task = task_db::insert_task(pool, project.id, tenant_id, title, &input_spec).await?;

    log_best_effort(
        audit,
        "task_created",
        tenant_id,
        Some(user_id),
        "task",
        &task.id.to_string(),
        json!({ "project_id": project.id, "title": task.title }),
    )
    .await;

    Ok(task)
}

/// Fetch one task.
pub async fn get_task(pool: &PgPool, task_id: Uuid, tenant_id: Uuid) -> OpResult<Task> {
    task_db::get_task(pool, task_id, tenant_id)
        .await?
        .ok_or(OpError::TaskNotFound)
}

/// All tasks in a project, newest first.
pub async fn list_tasks(pool: &PgPool, project_id: Uuid, tenant_id: Uuid) -> OpResult<Vec<Task>> {
    project_db::get_project(pool, project_id, tenant_id)
        .await?
        .ok_or(OpError::ProjectNotFound)?;

    Ok(task_db::list_tasks_for_project(pool, project_id, tenant_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_plain_object_specs() {
        assert!(validate_input_spec(&json!({ "requirement": "Build API" })).is_ok());
        assert!(
            validate_input_spec(&json!({
                "requirement": "Build API",
                "count": 3,
                "flags": [true, false],
                "nested": { "a": null },
            }))
            .is_ok()
        );
    }

    #[test]
    fn rejects_non_objects() {
        for bad in [json!([1, 2]), json!("spec"), json!(42), json!(null)] {
            let err = validate_input_spec(&bad).unwrap_err();
            assert_eq!(err.code(), "INVALID_INPUT_SPEC");
        }
    }

    #[test]
    fn rejects_empty_object() {
        let err = validate_input_spec(&json!({})).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT_SPEC");
    }

    #[test]
    fn rejects_blank_keys() {
        let err = validate_input_spec(&json!({ "  ": 1 })).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT_SPEC");
    }
}
