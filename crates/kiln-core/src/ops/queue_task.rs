//! Queue a draft task and hand it to the background dispatcher.

use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{Task, TaskStatus};
use kiln_db::queries::tasks as task_db;

use crate::dispatcher::{Dispatcher, Work};
use crate::error::{OpError, OpResult};

/// Transition a draft task to `queued` and enqueue its pipeline
/// execution. The response returns as soon as the work is enqueued; the
/// executor runs in the background with its own transaction scope.
pub async fn queue_task(
    pool: &PgPool,
    dispatcher: &Dispatcher,
    task_id: Uuid,
    tenant_id: Uuid,
) -> OpResult<Task> {
    let task = task_db::get_task(pool, task_id, tenant_id)
        .await?
        .ok_or(OpError::TaskNotFound)?;

    if task.status != TaskStatus::Draft {
        return Err(OpError::InvalidTaskStatus(task.status.to_string()));
    }

    let rows =
        task_db::transition_task_status(pool, task.id, TaskStatus::Draft, TaskStatus::Queued)
            .await?;
    if rows == 0 {
        // Lost a race with another queue call.
        let current = task_db::get_task(pool, task_id, tenant_id)
            .await?
            .ok_or(OpError::TaskNotFound)?;
        return Err(OpError::InvalidTaskStatus(current.status.to_string()));
    }

    dispatcher.enqueue(Work::ExecuteTask {
        task_id: task.id,
        tenant_id,
    })?;

    let task = task_db::get_task(pool, task_id, tenant_id)
        .await?
        .ok_or(OpError::TaskNotFound)?;

    Ok(task)
}
