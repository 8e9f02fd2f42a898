use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum value from its text form.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    /// Human-readable name of the enum being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------

/// Status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Archived,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for ProjectStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(ParseEnumError::new("project status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// Transitions run one way: `draft -> queued -> running -> completed|failed`.
/// `draft -> queued` is user-initiated; the rest are engine-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Queued,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Paused,
    Completed,
    Cancelled,
    CancelledDueToInactivity,
    Failed,
}

impl PipelineStatus {
    /// Whether this status is terminal. A run in a terminal state is
    /// immutable except for resolution notes on linked dead-letter events.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::CancelledDueToInactivity | Self::Failed
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::CancelledDueToInactivity => "cancelled_due_to_inactivity",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PipelineStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "cancelled_due_to_inactivity" => Ok(Self::CancelledDueToInactivity),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("pipeline status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a pipeline step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Invalidated,
    Cancelled,
}

impl StepStatus {
    /// Whether this status is terminal. Cancellation of a pipeline only
    /// touches non-terminal steps (`pending`, `running`).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Invalidated | Self::Cancelled
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Invalidated => "invalidated",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "invalidated" => Ok(Self::Invalidated),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("step status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Type of a pipeline step. Steps run in this order, one per step number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Analysis,
    UserStories,
    CodeSkeleton,
    TestCases,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Analysis => "ANALYSIS",
            Self::UserStories => "USER_STORIES",
            Self::CodeSkeleton => "CODE_SKELETON",
            Self::TestCases => "TEST_CASES",
        };
        f.write_str(s)
    }
}

impl FromStr for StepType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ANALYSIS" => Ok(Self::Analysis),
            "USER_STORIES" => Ok(Self::UserStories),
            "CODE_SKELETON" => Ok(Self::CodeSkeleton),
            "TEST_CASES" => Ok(Self::TestCases),
            other => Err(ParseEnumError::new("step type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Type of AI agent invoked for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    Architect,
    Pm,
    Engineer,
    Qa,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Architect => "ARCHITECT",
            Self::Pm => "PM",
            Self::Engineer => "ENGINEER",
            Self::Qa => "QA",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ARCHITECT" => Ok(Self::Architect),
            "PM" => Ok(Self::Pm),
            "ENGINEER" => Ok(Self::Engineer),
            "QA" => Ok(Self::Qa),
            other => Err(ParseEnumError::new("agent type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Type of artifact produced by a pipeline step.
///
/// The canonical set is the four SCREAMING variants. The `FromStr` impl also
/// accepts the historical lowercase aliases `document` (analysis report) and
/// `code` (code files) that older clients may still send; rows are always
/// written with canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    AnalysisReport,
    UserStories,
    CodeFiles,
    TestSuite,
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AnalysisReport => "ANALYSIS_REPORT",
            Self::UserStories => "USER_STORIES",
            Self::CodeFiles => "CODE_FILES",
            Self::TestSuite => "TEST_SUITE",
        };
        f.write_str(s)
    }
}

impl FromStr for ArtifactType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ANALYSIS_REPORT" => Ok(Self::AnalysisReport),
            "USER_STORIES" => Ok(Self::UserStories),
            "CODE_FILES" => Ok(Self::CodeFiles),
            "TEST_SUITE" => Ok(Self::TestSuite),
            // Historical aliases.
            "document" => Ok(Self::AnalysisReport),
            "code" => Ok(Self::CodeFiles),
            other => Err(ParseEnumError::new("artifact type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of an artifact in the approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Approved,
    Rejected,
    Superseded,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

impl FromStr for ArtifactStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "superseded" => Ok(Self::Superseded),
            other => Err(ParseEnumError::new("artifact status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Machine-readable reason why a pipeline run is not progressing.
///
/// Stored as a JSON string list on the run; a run is `paused` iff at least
/// one reason is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    Rejection,
    InsufficientCredit,
    AwaitingUserApproval,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rejection => "REJECTION",
            Self::InsufficientCredit => "INSUFFICIENT_CREDIT",
            Self::AwaitingUserApproval => "AWAITING_USER_APPROVAL",
        };
        f.write_str(s)
    }
}

impl FromStr for PauseReason {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REJECTION" => Ok(Self::Rejection),
            "INSUFFICIENT_CREDIT" => Ok(Self::InsufficientCredit),
            "AWAITING_USER_APPROVAL" => Ok(Self::AwaitingUserApproval),
            other => Err(ParseEnumError::new("pause reason", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a retry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RetryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("retry status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of an async job (exports and git syncs share the lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("job status", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project -- the tenant-scoped container for tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- one specification submitted for pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    /// Arbitrary structured configuration supplied by the caller.
    pub input_spec: serde_json::Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One end-to-end execution of the four-step agent sequence for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub tenant_id: Uuid,
    pub status: PipelineStatus,
    pub pause_reasons: Json<Vec<PauseReason>>,
    pub current_step: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// A paused run may resume only once every pause reason is cleared.
    pub fn can_resume(&self) -> bool {
        self.pause_reasons.is_empty()
    }

    /// Whether the pause window has lapsed. Informational for operators;
    /// nothing in the engine auto-expires a pause.
    pub fn is_pause_expired(&self, now: DateTime<Utc>) -> bool {
        match self.pause_expires_at {
            Some(expires) => now > expires,
            None => false,
        }
    }
}

/// One step within a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineStepRun {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub step_number: i32,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    /// Number of retries already consumed. Never exceeds `max_retries`.
    pub retry_count: i32,
    pub max_retries: i32,
    /// Frozen copy of the merged context seen at first execution.
    /// Written once; retries re-use it verbatim.
    pub input_snapshot: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineStepRun {
    /// A step is retryable iff it failed and has retry budget left.
    pub fn is_retryable(&self) -> bool {
        self.status == StepStatus::Failed && self.retry_count < self.max_retries
    }
}

/// One AI agent invocation, with token usage and credit costs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRun {
    pub id: Uuid,
    pub step_run_id: Uuid,
    pub pipeline_run_id: Uuid,
    pub agent_type: AgentType,
    pub model: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub estimated_cost_credits: i64,
    pub actual_cost_credits: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn total_tokens(&self) -> i32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A versioned step output gated by user approval.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artifact {
    pub id: Uuid,
    pub task_id: Uuid,
    pub pipeline_run_id: Uuid,
    pub step_run_id: Uuid,
    pub artifact_type: ArtifactType,
    pub status: ArtifactStatus,
    /// Monotonically increasing per `(task_id, artifact_type)`.
    pub version: i32,
    pub content: Option<serde_json::Value>,
    /// Carries optional extras such as rejection feedback.
    pub extra_data: Option<serde_json::Value>,
    pub superseded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

/// A scheduled re-execution of a failed step (or a deferred billing call).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RetryJob {
    pub id: Uuid,
    pub step_run_id: Uuid,
    /// 1-indexed attempt this job represents.
    pub retry_attempt: i32,
    pub scheduled_at: DateTime<Utc>,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RetryJob {
    /// Ready iff pending and the scheduled time has passed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == RetryStatus::Pending && self.scheduled_at <= now
    }
}

/// A durable record that a step exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetterEvent {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub step_run_id: Uuid,
    pub failure_reason: String,
    pub retry_count: i32,
    pub context: Option<serde_json::Value>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An async job that packages a project's artifacts for download.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExportJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub tenant_id: Uuid,
    pub status: JobStatus,
    pub file_path: Option<String>,
    pub download_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// An async job that pushes an approved artifact to a git remote.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GitSyncJob {
    pub id: Uuid,
    pub artifact_id: Uuid,
    pub tenant_id: Uuid,
    pub repository_url: String,
    pub branch: String,
    pub commit_message: String,
    pub status: JobStatus,
    pub commit_sha: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GitSyncJob {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub event_type: String,
    pub tenant_id: Uuid,
    /// Null for system-generated events.
    pub user_id: Option<Uuid>,
    pub resource_type: String,
    pub resource_id: String,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_status_display_roundtrip() {
        let variants = [
            PipelineStatus::Running,
            PipelineStatus::Paused,
            PipelineStatus::Completed,
            PipelineStatus::Cancelled,
            PipelineStatus::CancelledDueToInactivity,
            PipelineStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PipelineStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn pipeline_status_terminal_set() {
        assert!(!PipelineStatus::Running.is_terminal());
        assert!(!PipelineStatus::Paused.is_terminal());
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::Cancelled.is_terminal());
        assert!(PipelineStatus::CancelledDueToInactivity.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
    }

    #[test]
    fn step_status_display_roundtrip() {
        let variants = [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Invalidated,
            StepStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: StepStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn step_status_terminal_set() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Invalidated.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
    }

    #[test]
    fn step_type_display_roundtrip() {
        let variants = [
            StepType::Analysis,
            StepType::UserStories,
            StepType::CodeSkeleton,
            StepType::TestCases,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: StepType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_type_display_roundtrip() {
        let variants = [
            AgentType::Architect,
            AgentType::Pm,
            AgentType::Engineer,
            AgentType::Qa,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn artifact_type_accepts_legacy_aliases() {
        assert_eq!(
            "document".parse::<ArtifactType>().unwrap(),
            ArtifactType::AnalysisReport
        );
        assert_eq!(
            "code".parse::<ArtifactType>().unwrap(),
            ArtifactType::CodeFiles
        );
        // Canonical names still round-trip through Display.
        assert_eq!(
            ArtifactType::TestSuite.to_string().parse::<ArtifactType>().unwrap(),
            ArtifactType::TestSuite
        );
    }

    #[test]
    fn artifact_type_rejects_unknown() {
        assert!("blueprint".parse::<ArtifactType>().is_err());
    }

    #[test]
    fn pause_reason_serde_wire_form() {
        let json = serde_json::to_string(&PauseReason::AwaitingUserApproval).unwrap();
        assert_eq!(json, "\"AWAITING_USER_APPROVAL\"");
        let back: PauseReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PauseReason::AwaitingUserApproval);
    }

    #[test]
    fn task_status_invalid() {
        assert!("nope".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn retry_job_readiness() {
        let now = Utc::now();
        let job = RetryJob {
            id: Uuid::new_v4(),
            step_run_id: Uuid::new_v4(),
            retry_attempt: 1,
            scheduled_at: now - chrono::Duration::seconds(1),
            status: RetryStatus::Pending,
            created_at: now,
            processed_at: None,
        };
        assert!(job.is_ready(now));

        let future = RetryJob {
            scheduled_at: now + chrono::Duration::seconds(60),
            ..job.clone()
        };
        assert!(!future.is_ready(now));

        let done = RetryJob {
            status: RetryStatus::Completed,
            ..job
        };
        assert!(!done.is_ready(now));
    }

    #[test]
    fn step_retryable_requires_failed_and_budget() {
        let now = Utc::now();
        let mut step = PipelineStepRun {
            id: Uuid::new_v4(),
            pipeline_run_id: Uuid::new_v4(),
            step_number: 1,
            step_name: "analysis".to_owned(),
            step_type: StepType::Analysis,
            status: StepStatus::Failed,
            retry_count: 0,
            max_retries: 3,
            input_snapshot: None,
            output: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        assert!(step.is_retryable());

        step.retry_count = 3;
        assert!(!step.is_retryable());

        step.retry_count = 0;
        step.status = StepStatus::Completed;
        assert!(!step.is_retryable());
    }
}
