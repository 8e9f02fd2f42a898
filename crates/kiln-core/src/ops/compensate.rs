//! Credit compensation (refunds) for invalidated steps.
//!
//! Best-effort: billing failures never fail the caller, they just report
//! `refunded = false` and leave the case for manual review. Refunds
//! outside the 15-minute automatic window always escalate to a human.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::queries::{agent_runs, pipeline_runs as run_db, pipeline_steps as step_db};

use crate::billing::{BillingClient, CreditRequest, refund_idempotency_key};
use crate::error::{OpError, OpResult};

/// Automatic refunds apply only this soon after step completion.
pub const AUTO_REFUND_WINDOW_MINUTES: i64 = 15;

/// Result of a compensation attempt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompensationOutcome {
    pub refunded: bool,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub message: String,
}

/// Refund the credits billed for a step, if inside the automatic window.
pub async fn compensate_credits(
    pool: &PgPool,
    billing: &dyn BillingClient,
    tenant_id: Uuid,
    step_run_id: Uuid,
    reason: &str,
) -> OpResult<CompensationOutcome> {
    let step = step_db::get_step(pool, step_run_id)
        .await?
        .ok_or(OpError::StepRunNotFound(step_run_id))?;

    // Tenant isolation through the owning run.
    let run = run_db::get_run(pool, step.pipeline_run_id)
        .await?
        .ok_or(OpError::StepRunNotFound(step_run_id))?;
    if run.tenant_id != tenant_id {
        return Err(OpError::StepRunNotFound(step_run_id));
    }

    let agent_run = agent_runs::latest_for_step(pool, step.id)
        .await?
        .ok_or(OpError::NoAgentRunsFound(step.id))?;
    let amount = Decimal::from(agent_run.actual_cost_credits);

    if let Some(completed_at) = step.completed_at {
        let age = Utc::now() - completed_at;
        if age > Duration::minutes(AUTO_REFUND_WINDOW_MINUTES) {
            tracing::warn!(
                step_id = %step.id,
                age_minutes = age.num_minutes(),
                "refund requested outside automatic window"
            );
            return Ok(CompensationOutcome {
                refunded: false,
                amount,
                transaction_id: None,
                message: "Outside automatic refund window - manual escalation required"
                    .to_owned(),
            });
        }
    }

    let request = CreditRequest::new(
        tenant_id,
        amount,
        refund_idempotency_key(step.pipeline_run_id, step.id),
    )
    .with_reference("pipeline_step_refund", step.id.to_string())
    .with_metadata(json!({
        "original_step_run_id": step.id,
        "pipeline_run_id": step.pipeline_run_id,
        "reason": reason,
        "original_amount": amount.to_string(),
    }));

    match billing.refund_credits(&request).await {
        Ok(transaction) => {
            tracing::info!(step_id = %step.id, %amount, "refunded credits");
            Ok(CompensationOutcome {
                refunded: true,
                amount,
                transaction_id: Some(transaction.transaction_id),
                message: format!("Successfully refunded {amount} credits"),
            })
        }
        Err(e) => {
            // Never fail the caller; log for manual review.
            tracing::error!(step_id = %step.id, error = %e, "refund failed");
            Ok(CompensationOutcome {
                refunded: false,
                amount,
                transaction_id: None,
                message: format!("Refund failed - logged for manual review: {e}"),
            })
        }
    }
}
