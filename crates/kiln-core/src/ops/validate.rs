//! Pre-flight pipeline validation.
//!
//! Confirms the task exists for the caller's tenant and that the tenant's
//! balance covers the estimated pipeline cost. Billing outages and
//! balance-read failures surface as typed errors; a short balance is a
//! normal (ineligible) outcome, not an error.

use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::queries::tasks as task_db;

use crate::billing::{BillingClient, BillingError};
use crate::error::{OpError, OpResult};
use crate::steps;

/// Result of pre-flight validation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationOutcome {
    pub eligible: bool,
    pub estimated_cost: Decimal,
    pub current_balance: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Validate that a pipeline can start for a task.
pub async fn validate(
    pool: &PgPool,
    billing: &dyn BillingClient,
    task_id: Uuid,
    tenant_id: Uuid,
) -> OpResult<ValidationOutcome> {
    // Missing and cross-tenant look identical by design.
    task_db::get_task(pool, task_id, tenant_id)
        .await?
        .ok_or(OpError::TaskNotFound)?;

    let estimated_cost = steps::estimated_pipeline_cost();

    let balance = match billing.get_balance(tenant_id).await {
        Ok(balance) => balance.balance,
        Err(BillingError::Unavailable(_)) => return Err(OpError::BillingServiceUnavailable),
        Err(e) => return Err(OpError::BalanceCheckFailed(e.to_string())),
    };

    // Balance exactly equal to the estimate is eligible.
    if balance >= estimated_cost {
        Ok(ValidationOutcome {
            eligible: true,
            estimated_cost,
            current_balance: balance,
            reason: None,
        })
    } else {
        Ok(ValidationOutcome {
            eligible: false,
            estimated_cost,
            current_balance: balance,
            reason: Some(format!(
                "Insufficient credits. Required: {estimated_cost}, Available: {balance}"
            )),
        })
    }
}
