//! Error taxonomy shared by every use-case operation.
//!
//! Each variant carries a stable machine-readable code; the HTTP layer
//! maps codes to statuses and renders `{"error": {"code", "message"}}`
//! bodies. Infrastructure failures fold into `Internal` and surface as
//! 500s without leaking detail.

use uuid::Uuid;

/// Result alias used by every use-case operation.
pub type OpResult<T> = Result<T, OpError>;

/// The full error surface of the control plane.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    // -- client errors ----------------------------------------------------
    #[error("{0}")]
    InvalidInput(String),

    #[error("input_spec validation failed: {0}")]
    InvalidInputSpec(String),

    #[error("Task not found")]
    TaskNotFound,

    #[error("Project not found")]
    ProjectNotFound,

    #[error("Project is not active")]
    ProjectNotActive,

    #[error("Artifact not found")]
    ArtifactNotFound,

    #[error("Artifact is already approved")]
    AlreadyApproved,

    #[error("Cannot approve a rejected artifact")]
    CannotApproveRejected,

    #[error("Cannot approve a superseded artifact")]
    CannotApproveSuperseded,

    #[error("Artifact is already rejected")]
    AlreadyRejected,

    #[error("Cannot reject an approved artifact")]
    CannotRejectApproved,

    #[error("Cannot reject a superseded artifact")]
    CannotRejectSuperseded,

    #[error("Artifact is already archived")]
    AlreadyArchived,

    #[error("Cannot archive the latest version of an artifact")]
    CannotArchiveLatest,

    #[error("invalid artifact type: {0}")]
    InvalidArtifactType(String),

    #[error("Cannot cancel a pipeline in terminal status {0}")]
    CannotCancelCompleted(String),

    #[error("Pipeline is not paused (current status: {0})")]
    NotPaused(String),

    #[error("Pipeline has unresolved pause reasons: {}", reasons.join(", "))]
    CannotResume { reasons: Vec<String> },

    #[error("invalid status filter: {0}")]
    InvalidStatus(String),

    #[error("Task must be in 'draft' status, currently '{0}'")]
    InvalidTaskStatus(String),

    #[error("Not authorized to access this resource")]
    Unauthorized,

    #[error("Pipeline not found")]
    PipelineNotFound,

    #[error("Pipeline run {0} not found")]
    PipelineRunNotFound(Uuid),

    #[error("Export job not found")]
    ExportJobNotFound,

    #[error("Git sync job not found")]
    GitSyncJobNotFound,

    #[error("Dead letter event not found")]
    DeadLetterNotFound,

    // -- external-dependency errors ---------------------------------------
    #[error("Billing service is currently unavailable")]
    BillingServiceUnavailable,

    #[error("Failed to check credit balance: {0}")]
    BalanceCheckFailed(String),

    // -- operational errors ------------------------------------------------
    #[error("Maximum retry attempts ({0}) exceeded for billing operation")]
    MaxRetriesExceeded(u32),

    #[error("Failed to schedule billing retry: {0}")]
    RetryJobCreationFailed(String),

    #[error("Step run {0} not found")]
    StepRunNotFound(Uuid),

    #[error("No agent runs found for step {0}")]
    NoAgentRunsFound(Uuid),

    #[error("Failed to compensate credits: {0}")]
    CompensationError(String),

    // -- everything else ---------------------------------------------------
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OpError {
    /// Stable machine-readable code for the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidInputSpec(_) => "INVALID_INPUT_SPEC",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::ProjectNotFound => "PROJECT_NOT_FOUND",
            Self::ProjectNotActive => "PROJECT_NOT_ACTIVE",
            Self::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            Self::AlreadyApproved => "ALREADY_APPROVED",
            Self::CannotApproveRejected => "CANNOT_APPROVE_REJECTED",
            Self::CannotApproveSuperseded => "CANNOT_APPROVE_SUPERSEDED",
            Self::AlreadyRejected => "ALREADY_REJECTED",
            Self::CannotRejectApproved => "CANNOT_REJECT_APPROVED",
            Self::CannotRejectSuperseded => "CANNOT_REJECT_SUPERSEDED",
            Self::AlreadyArchived => "ALREADY_ARCHIVED",
            Self::CannotArchiveLatest => "CANNOT_ARCHIVE_LATEST",
            Self::InvalidArtifactType(_) => "INVALID_ARTIFACT_TYPE",
            Self::CannotCancelCompleted(_) => "CANNOT_CANCEL_COMPLETED",
            Self::NotPaused(_) => "NOT_PAUSED",
            Self::CannotResume { .. } => "CANNOT_RESUME",
            Self::InvalidStatus(_) => "INVALID_STATUS",
            Self::InvalidTaskStatus(_) => "INVALID_TASK_STATUS",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::PipelineNotFound => "PIPELINE_NOT_FOUND",
            Self::PipelineRunNotFound(_) => "PIPELINE_RUN_NOT_FOUND",
            Self::ExportJobNotFound => "EXPORT_JOB_NOT_FOUND",
            Self::GitSyncJobNotFound => "GIT_SYNC_JOB_NOT_FOUND",
            Self::DeadLetterNotFound => "DEAD_LETTER_NOT_FOUND",
            Self::BillingServiceUnavailable => "BILLING_SERVICE_UNAVAILABLE",
            Self::BalanceCheckFailed(_) => "BALANCE_CHECK_FAILED",
            Self::MaxRetriesExceeded(_) => "MAX_RETRIES_EXCEEDED",
            Self::RetryJobCreationFailed(_) => "RETRY_JOB_CREATION_FAILED",
            Self::StepRunNotFound(_) => "STEP_RUN_NOT_FOUND",
            Self::NoAgentRunsFound(_) => "NO_AGENT_RUNS_FOUND",
            Self::CompensationError(_) => "COMPENSATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
