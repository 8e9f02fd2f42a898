//! Credit billing: the client contract and its adapters.
//!
//! The billing service is a remote peer. Consumes and refunds carry an
//! idempotency key so that replays of the same attempt return the original
//! transaction instead of debiting twice.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use http::{HttpBillingClient, HttpBillingConfig};
pub use memory::MemoryBillingClient;

/// Errors surfaced by billing operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BillingError {
    /// The tenant's balance does not cover the requested amount (402).
    /// A domain outcome, not a failure: callers pause, they do not crash.
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    /// The service did not answer usefully (5xx or transport failure)
    /// after all client-side retries.
    #[error("billing service unavailable: {0}")]
    Unavailable(String),

    /// Any other client error (4xx).
    #[error("billing error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// A consume or refund request.
#[derive(Debug, Clone, Serialize)]
pub struct CreditRequest {
    pub tenant_id: Uuid,
    /// Serialized as a decimal string on the wire.
    pub amount: Decimal,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CreditRequest {
    pub fn new(tenant_id: Uuid, amount: Decimal, idempotency_key: impl Into<String>) -> Self {
        Self {
            tenant_id,
            amount,
            idempotency_key: idempotency_key.into(),
            reference_type: None,
            reference_id: None,
            metadata: None,
        }
    }

    pub fn with_reference(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.reference_type = Some(kind.into());
        self.reference_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A completed consume or refund transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub transaction_id: String,
    pub tenant_id: Uuid,
    /// `"consume"` or `"refund"`.
    pub transaction_type: String,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// A tenant's current balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub tenant_id: Uuid,
    pub balance: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// The billing peer contract.
#[async_trait]
pub trait BillingClient: Send + Sync {
    /// Debit credits. Replaying an idempotency key returns the original
    /// transaction without an additional debit.
    async fn consume_credits(
        &self,
        request: &CreditRequest,
    ) -> Result<CreditTransaction, BillingError>;

    /// Credit back a prior debit. Same idempotency semantics.
    async fn refund_credits(
        &self,
        request: &CreditRequest,
    ) -> Result<CreditTransaction, BillingError>;

    /// Current balance for a tenant.
    async fn get_balance(&self, tenant_id: Uuid) -> Result<Balance, BillingError>;
}

/// Idempotency key for a step's first billing attempt.
pub fn step_idempotency_key(pipeline_run_id: Uuid, step_run_id: Uuid) -> String {
    format!("{pipeline_run_id}:{step_run_id}")
}

/// Idempotency key for the Nth retry of a step (N = retry_count at attempt
/// time).
pub fn retry_idempotency_key(pipeline_run_id: Uuid, step_run_id: Uuid, retry_count: i32) -> String {
    format!("{pipeline_run_id}:{step_run_id}:retry_{retry_count}")
}

/// Idempotency key for a refund of a step's billed cost.
pub fn refund_idempotency_key(pipeline_run_id: Uuid, step_run_id: Uuid) -> String {
    format!("refund:{pipeline_run_id}:{step_run_id}")
}
