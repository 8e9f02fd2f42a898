//! HTTP error envelope and the code-to-status mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use kiln_core::error::OpError;

/// API error rendered as `{"error": {"code", "message"}}`.
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// 401 for missing or invalid credentials.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: message.into(),
        }
    }

    /// 400 with an explicit code (for route-level validation).
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }
}

impl From<OpError> for AppError {
    fn from(err: OpError) -> Self {
        let status = match &err {
            OpError::TaskNotFound
            | OpError::ProjectNotFound
            | OpError::ArtifactNotFound
            | OpError::PipelineNotFound
            | OpError::PipelineRunNotFound(_)
            | OpError::StepRunNotFound(_)
            | OpError::NoAgentRunsFound(_)
            | OpError::ExportJobNotFound
            | OpError::GitSyncJobNotFound
            | OpError::DeadLetterNotFound => StatusCode::NOT_FOUND,

            OpError::Unauthorized => StatusCode::FORBIDDEN,

            OpError::BillingServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            OpError::BalanceCheckFailed(_)
            | OpError::MaxRetriesExceeded(_)
            | OpError::RetryJobCreationFailed(_)
            | OpError::CompensationError(_) => StatusCode::INTERNAL_SERVER_ERROR,

            OpError::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "internal error");
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "INTERNAL_ERROR",
                    message: "internal server error".to_owned(),
                };
            }

            _ => StatusCode::BAD_REQUEST,
        };

        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}
