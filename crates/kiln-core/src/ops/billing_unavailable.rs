//! Deferred billing on service outage.
//!
//! When the billing peer is down at consume time, the step's work is kept
//! and a retry job is persisted with exponential backoff. Attempts are
//! bounded; exhaustion surfaces `MAX_RETRIES_EXCEEDED` and leaves the
//! discrepancy to operators.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::queries::retry_jobs as retry_db;

use crate::audit::{AuditSink, log_best_effort};
use crate::error::{OpError, OpResult};

/// Backoff policy for deferred billing retries.
#[derive(Debug, Clone)]
pub struct BillingRetryPolicy {
    /// First-retry delay; doubles per attempt.
    pub base_delay_seconds: i64,
    /// Attempt cap (attempts are 0-indexed on entry).
    pub max_retries: i32,
}

impl Default for BillingRetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,
            max_retries: 5,
        }
    }
}

impl BillingRetryPolicy {
    /// `base_delay * 2^retry_attempt` seconds.
    pub fn backoff_seconds(&self, retry_attempt: i32) -> i64 {
        self.base_delay_seconds * (1_i64 << retry_attempt.clamp(0, 32))
    }
}

/// Context of the failed consume.
#[derive(Debug, Clone)]
pub struct BillingUnavailableCommand {
    pub step_run_id: Uuid,
    pub tenant_id: Uuid,
    pub amount: Decimal,
    pub idempotency_key: String,
    /// 0-indexed attempt that just failed.
    pub retry_attempt: i32,
    pub error_message: Option<String>,
}

/// The scheduled billing retry.
#[derive(Debug, Clone)]
pub struct BillingRetryScheduled {
    pub retry_job_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    /// 1-indexed attempt the job represents.
    pub retry_attempt: i32,
}

/// Schedule a billing retry for a step whose consume could not reach the
/// billing service.
pub async fn handle(
    pool: &PgPool,
    audit: &dyn AuditSink,
    policy: &BillingRetryPolicy,
    command: &BillingUnavailableCommand,
) -> OpResult<BillingRetryScheduled> {
    if command.retry_attempt >= policy.max_retries {
        tracing::error!(
            step_id = %command.step_run_id,
            attempt = command.retry_attempt,
            "billing retries exhausted"
        );
        return Err(OpError::MaxRetriesExceeded(policy.max_retries as u32));
    }

    let delay_seconds = policy.backoff_seconds(command.retry_attempt);
    let scheduled_at = Utc::now() + Duration::seconds(delay_seconds);

    tracing::info!(
        step_id = %command.step_run_id,
        attempt = command.retry_attempt + 1,
        scheduled_at = %scheduled_at,
        "scheduling billing retry"
    );

    let job = persist_job(pool, command, scheduled_at)
        .await
        .map_err(|e| OpError::RetryJobCreationFailed(format!("{e:#}")))?;

    log_best_effort(
        audit,
        "billing_unavailable",
        command.tenant_id,
        None,
        "retry_job",
        &job.retry_job_id.to_string(),
        json!({
            "step_run_id": command.step_run_id,
            "amount": command.amount.to_string(),
            "idempotency_key": command.idempotency_key,
            "retry_attempt": command.retry_attempt + 1,
            "scheduled_at": scheduled_at,
            "delay_seconds": delay_seconds,
            "error_message": command.error_message,
        }),
    )
    .await;

    Ok(job)
}

async fn persist_job(
    pool: &PgPool,
    command: &BillingUnavailableCommand,
    scheduled_at: DateTime<Utc>,
) -> Result<BillingRetryScheduled> {
    let job = retry_db::insert_retry_job(
        pool,
        command.step_run_id,
        command.retry_attempt + 1,
        scheduled_at,
    )
    .await?;

    Ok(BillingRetryScheduled {
        retry_job_id: job.id,
        scheduled_at: job.scheduled_at,
        retry_attempt: job.retry_attempt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = BillingRetryPolicy::default();
        assert_eq!(policy.backoff_seconds(0), 60);
        assert_eq!(policy.backoff_seconds(1), 120);
        assert_eq!(policy.backoff_seconds(2), 240);
        assert_eq!(policy.backoff_seconds(4), 960);
    }

    #[test]
    fn custom_base_delay() {
        let policy = BillingRetryPolicy {
            base_delay_seconds: 5,
            max_retries: 3,
        };
        assert_eq!(policy.backoff_seconds(0), 5);
        assert_eq!(policy.backoff_seconds(2), 20);
    }
}
