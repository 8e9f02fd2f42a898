//! Archiving (superseding) old artifact versions.

use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{Artifact, ArtifactStatus};
use kiln_db::queries::{artifacts as artifact_db, tasks as task_db};

use crate::error::{OpError, OpResult};

/// Mark a non-latest artifact version as superseded.
///
/// The latest version of a `(task, type)` group can never be archived;
/// there is always exactly one live head per group.
pub async fn archive_artifact(
    pool: &PgPool,
    artifact_id: Uuid,
    tenant_id: Uuid,
) -> OpResult<Artifact> {
    let artifact = artifact_db::get_artifact(pool, artifact_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    task_db::get_task(pool, artifact.task_id, tenant_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    if artifact.status == ArtifactStatus::Superseded {
        return Err(OpError::AlreadyArchived);
    }

    let latest = artifact_db::get_latest(pool, artifact.task_id, artifact.artifact_type).await?;
    if latest.is_some_and(|l| l.id == artifact.id) {
        return Err(OpError::CannotArchiveLatest);
    }

    if artifact_db::supersede_artifact(pool, artifact.id, None).await? == 0 {
        return Err(OpError::AlreadyArchived);
    }

    let artifact = artifact_db::get_artifact(pool, artifact.id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    Ok(artifact)
}
