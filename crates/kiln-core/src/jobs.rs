//! Export and git-sync job lifecycles.
//!
//! Both follow the async job pattern: a pending row is created at request
//! time, a background task claims and processes it, and failures either
//! requeue (retry budget permitting) or stick as `failed`. The actual
//! ZIP/git mechanics live behind the sink traits; the engine only owns
//! the scheduling and state machine.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{Artifact, ArtifactStatus, ExportJob, GitSyncJob, Project};
use kiln_db::queries::{
    artifacts as artifact_db, jobs as job_db, projects as project_db, tasks as task_db,
};

use crate::error::{OpError, OpResult};

/// How long export download links stay valid.
pub const EXPORT_LINK_TTL_HOURS: i64 = 24;

/// A produced export bundle.
#[derive(Debug, Clone)]
pub struct ExportHandle {
    pub file_path: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Packages a project's artifacts for download.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn export_project(
        &self,
        project: &Project,
        artifacts: &[Artifact],
    ) -> Result<ExportHandle>;
}

/// Pushes one artifact to a git remote, returning the commit SHA.
#[async_trait]
pub trait GitPusher: Send + Sync {
    async fn push_artifact(&self, job: &GitSyncJob, artifact: &Artifact) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Export jobs
// ---------------------------------------------------------------------------

/// Create a pending export job for a project.
pub async fn create_export_job(
    pool: &PgPool,
    project_id: Uuid,
    tenant_id: Uuid,
) -> OpResult<ExportJob> {
    let project = project_db::get_project(pool, project_id, tenant_id)
        .await?
        .ok_or(OpError::ProjectNotFound)?;

    Ok(job_db::insert_export_job(pool, project.id, tenant_id).await?)
}

/// Export job status for polling.
pub async fn get_export_job(pool: &PgPool, job_id: Uuid, tenant_id: Uuid) -> OpResult<ExportJob> {
    job_db::get_export_job(pool, job_id, tenant_id)
        .await?
        .ok_or(OpError::ExportJobNotFound)
}

/// Process one export job: claim it, gather the project's artifacts,
/// hand them to the sink, and record the result. Failures requeue while
/// retry budget remains.
pub async fn process_export_job(pool: &PgPool, sink: &dyn ExportSink, job_id: Uuid) -> Result<()> {
    if job_db::start_export_job(pool, job_id).await? == 0 {
        tracing::debug!(job_id = %job_id, "export job not pending, skipping");
        return Ok(());
    }

    let Some(job) = job_db::get_export_job_unscoped(pool, job_id).await? else {
        return Ok(());
    };

    let result = export_project_artifacts(pool, sink, &job).await;
    match result {
        Ok(handle) => {
            job_db::complete_export_job(
                pool,
                job.id,
                &handle.file_path,
                &handle.download_url,
                handle.expires_at,
            )
            .await?;
            tracing::info!(job_id = %job.id, url = %handle.download_url, "export completed");
        }
        Err(e) => {
            let message = format!("{e:#}");
            tracing::warn!(job_id = %job.id, error = %message, "export failed");
            job_db::fail_export_job(pool, job.id, &message).await?;
            if job.can_retry() {
                job_db::requeue_export_job(pool, job.id).await?;
                tracing::info!(job_id = %job.id, retry_count = job.retry_count + 1, "export requeued");
            }
        }
    }

    Ok(())
}

async fn export_project_artifacts(
    pool: &PgPool,
    sink: &dyn ExportSink,
    job: &ExportJob,
) -> Result<ExportHandle> {
    let project = project_db::get_project(pool, job.project_id, job.tenant_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("project {} not found", job.project_id))?;

    let mut artifacts = Vec::new();
    for task in task_db::list_tasks_for_project(pool, project.id, job.tenant_id).await? {
        artifacts.extend(artifact_db::list_for_task(pool, task.id).await?);
    }

    sink.export_project(&project, &artifacts).await
}

// ---------------------------------------------------------------------------
// Git sync jobs
// ---------------------------------------------------------------------------

/// Create a pending git-sync job for an approved artifact.
pub async fn create_git_sync_job(
    pool: &PgPool,
    artifact_id: Uuid,
    tenant_id: Uuid,
    repository_url: &str,
    branch: &str,
    commit_message: &str,
) -> OpResult<GitSyncJob> {
    let artifact = artifact_db::get_artifact(pool, artifact_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    task_db::get_task(pool, artifact.task_id, tenant_id)
        .await?
        .ok_or(OpError::ArtifactNotFound)?;

    // Only reviewed output leaves the system.
    if artifact.status != ArtifactStatus::Approved {
        return Err(OpError::InvalidInput(
            "only approved artifacts can be synced to git".into(),
        ));
    }

    if repository_url.trim().is_empty() {
        return Err(OpError::InvalidInput("repository_url cannot be empty".into()));
    }

    Ok(job_db::insert_git_sync_job(
        pool,
        artifact.id,
        tenant_id,
        repository_url.trim(),
        branch,
        commit_message,
    )
    .await?)
}

/// Git-sync job status for polling.
pub async fn get_git_sync_job(pool: &PgPool, job_id: Uuid, tenant_id: Uuid) -> OpResult<GitSyncJob> {
    job_db::get_git_sync_job(pool, job_id, tenant_id)
        .await?
        .ok_or(OpError::GitSyncJobNotFound)
}

/// Process one git-sync job through the pusher.
pub async fn process_git_sync_job(
    pool: &PgPool,
    pusher: &dyn GitPusher,
    job_id: Uuid,
) -> Result<()> {
    if job_db::start_git_sync_job(pool, job_id).await? == 0 {
        tracing::debug!(job_id = %job_id, "git sync job not pending, skipping");
        return Ok(());
    }

    let Some(job) = job_db::get_git_sync_job_unscoped(pool, job_id).await? else {
        return Ok(());
    };

    let result = async {
        let artifact = artifact_db::get_artifact(pool, job.artifact_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("artifact {} not found", job.artifact_id))?;
        pusher.push_artifact(&job, &artifact).await
    }
    .await;

    match result {
        Ok(commit_sha) => {
            job_db::complete_git_sync_job(pool, job.id, &commit_sha).await?;
            tracing::info!(job_id = %job.id, commit_sha = %commit_sha, "git sync completed");
        }
        Err(e) => {
            let message = format!("{e:#}");
            tracing::warn!(job_id = %job.id, error = %message, "git sync failed");
            job_db::fail_git_sync_job(pool, job.id, &message).await?;
            if job.can_retry() {
                job_db::requeue_git_sync_job(pool, job.id).await?;
                tracing::info!(job_id = %job.id, retry_count = job.retry_count + 1, "git sync requeued");
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Export sink that writes a JSON manifest of the project's artifacts to
/// the local filesystem and serves it by file path. Stands in for the
/// real bundle storage in local deployments.
pub struct FsExportSink {
    root: std::path::PathBuf,
}

impl FsExportSink {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ExportSink for FsExportSink {
    async fn export_project(
        &self,
        project: &Project,
        artifacts: &[Artifact],
    ) -> Result<ExportHandle> {
        tokio::fs::create_dir_all(&self.root).await?;

        let manifest = serde_json::json!({
            "project_id": project.id,
            "project_name": project.name,
            "exported_at": Utc::now(),
            "artifacts": artifacts,
        });

        let file_name = format!("export_{}_{}.json", project.id, Utc::now().timestamp());
        let path = self.root.join(&file_name);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await?;

        let file_path = path.to_string_lossy().into_owned();
        Ok(ExportHandle {
            download_url: format!("file://{file_path}"),
            file_path,
            expires_at: Utc::now() + Duration::hours(EXPORT_LINK_TTL_HOURS),
        })
    }
}

/// Git pusher that computes a deterministic content hash instead of
/// talking to a remote. Useful for local deployments and tests; the SHA
/// is stable for identical artifact content.
#[derive(Debug, Default)]
pub struct HashingGitPusher;

#[async_trait]
impl GitPusher for HashingGitPusher {
    async fn push_artifact(&self, job: &GitSyncJob, artifact: &Artifact) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(job.repository_url.as_bytes());
        hasher.update(job.branch.as_bytes());
        hasher.update(
            serde_json::to_vec(&artifact.content)
                .unwrap_or_default()
                .as_slice(),
        );
        let digest = hasher.finalize();
        Ok(hex::encode(&digest[..20]))
    }
}
