//! Audit sink contract.
//!
//! Audit storage is append-only and external to the engine; the engine
//! writes best-effort through this trait and never fails an operation
//! because an audit write failed.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::queries::audit::{self, NewAuditEvent};

/// Append-only audit sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_event(
        &self,
        event_type: &str,
        tenant_id: Uuid,
        user_id: Option<Uuid>,
        resource_type: &str,
        resource_id: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Audit sink backed by the `audit_events` table.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn log_event(
        &self,
        event_type: &str,
        tenant_id: Uuid,
        user_id: Option<Uuid>,
        resource_type: &str,
        resource_id: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        audit::insert_audit_event(
            &self.pool,
            &NewAuditEvent {
                event_type,
                tenant_id,
                user_id,
                resource_type,
                resource_id,
                metadata,
            },
        )
        .await?;
        Ok(())
    }
}

/// Audit sink that only emits tracing events. Used where no durable sink
/// is wired up (tests, local tooling).
#[derive(Debug, Default)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn log_event(
        &self,
        event_type: &str,
        tenant_id: Uuid,
        _user_id: Option<Uuid>,
        resource_type: &str,
        resource_id: &str,
        _metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        tracing::debug!(
            event_type,
            tenant_id = %tenant_id,
            resource = %format!("{resource_type}/{resource_id}"),
            "audit event"
        );
        Ok(())
    }
}

/// Log an audit event, swallowing (but tracing) any sink failure.
pub async fn log_best_effort(
    sink: &dyn AuditSink,
    event_type: &str,
    tenant_id: Uuid,
    user_id: Option<Uuid>,
    resource_type: &str,
    resource_id: &str,
    metadata: serde_json::Value,
) {
    if let Err(e) = sink
        .log_event(
            event_type,
            tenant_id,
            user_id,
            resource_type,
            resource_id,
            metadata,
        )
        .await
    {
        tracing::warn!(
            event_type,
            tenant_id = %tenant_id,
            error = %e,
            "failed to persist audit event (best-effort)"
        );
    }
}
