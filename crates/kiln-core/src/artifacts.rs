//! Artifact creation: versioning and content write-through.
//!
//! Versions are allocated inside a transaction with the `(task, type)`
//! group locked, so concurrent creates cannot both claim the same number.
//! Content goes to a [`ContentStore`] addressed by
//! `{task_id}/{artifact_type}_v{version}`, and the stored row carries a
//! JSON envelope `{text, url, metadata}`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{Artifact, ArtifactStatus, ArtifactType};
use kiln_db::queries::artifacts as artifact_db;

/// Where artifact text lands. Implementations return the address they
/// stored the content under.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(
        &self,
        task_id: Uuid,
        artifact_type: ArtifactType,
        version: i32,
        content: &str,
    ) -> Result<String>;
}

/// Filesystem-backed content store:
/// `{root}/{task_id}/{artifact_type}_v{version}.txt`.
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn put(
        &self,
        task_id: Uuid,
        artifact_type: ArtifactType,
        version: i32,
        content: &str,
    ) -> Result<String> {
        let dir = self.root.join(task_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create artifact directory {}", dir.display()))?;

        let path = dir.join(format!("{artifact_type}_v{version}.txt"));
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write artifact content to {}", path.display()))?;

        Ok(path.to_string_lossy().into_owned())
    }
}

/// Inputs for one artifact write.
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    pub task_id: Uuid,
    pub pipeline_run_id: Uuid,
    pub step_run_id: Uuid,
    pub artifact_type: ArtifactType,
    pub status: ArtifactStatus,
    /// The step output serialized for human review.
    pub content_text: String,
    pub metadata: serde_json::Value,
}

/// Versioned artifact write-through.
#[derive(Clone)]
pub struct ArtifactService {
    pool: PgPool,
    store: Arc<dyn ContentStore>,
}

impl ArtifactService {
    pub fn new(pool: PgPool, store: Arc<dyn ContentStore>) -> Self {
        Self { pool, store }
    }

    /// Create an artifact at the next version of its `(task, type)` group.
    ///
    /// The max-version read locks the group for the rest of the
    /// transaction, so two concurrent creates serialize and the versions
    /// stay contiguous.
    pub async fn create_artifact(&self, draft: ArtifactDraft) -> Result<Artifact> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin artifact transaction")?;

        let version =
            artifact_db::max_version_locked(&mut *tx, draft.task_id, draft.artifact_type).await?
                + 1;

        let url = self
            .store
            .put(
                draft.task_id,
                draft.artifact_type,
                version,
                &draft.content_text,
            )
            .await?;

        let artifact = artifact_db::insert_artifact(
            &mut *tx,
            &artifact_db::NewArtifact {
                task_id: draft.task_id,
                pipeline_run_id: draft.pipeline_run_id,
                step_run_id: draft.step_run_id,
                artifact_type: draft.artifact_type,
                status: draft.status,
                version,
                content: serde_json::json!({
                    "text": draft.content_text,
                    "url": url,
                    "metadata": draft.metadata,
                }),
            },
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit artifact transaction")?;

        Ok(artifact)
    }
}
