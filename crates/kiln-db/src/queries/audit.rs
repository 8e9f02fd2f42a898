//! Query functions for the append-only `audit_events` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AuditEvent;

/// Fields for a new audit record.
#[derive(Debug, Clone)]
pub struct NewAuditEvent<'a> {
    pub event_type: &'a str,
    pub tenant_id: Uuid,
    /// `None` for system-generated events.
    pub user_id: Option<Uuid>,
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    pub metadata: serde_json::Value,
}

/// Append one audit record. There is deliberately no update or delete.
pub async fn insert_audit_event(pool: &PgPool, new: &NewAuditEvent<'_>) -> Result<AuditEvent> {
    let event = sqlx::query_as::<_, AuditEvent>(
        "INSERT INTO audit_events \
             (event_type, tenant_id, user_id, resource_type, resource_id, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.event_type)
    .bind(new.tenant_id)
    .bind(new.user_id)
    .bind(new.resource_type)
    .bind(new.resource_id)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert audit event")?;

    Ok(event)
}

/// All events of one type for a tenant, oldest first.
pub async fn list_by_type(
    pool: &PgPool,
    tenant_id: Uuid,
    event_type: &str,
) -> Result<Vec<AuditEvent>> {
    let events = sqlx::query_as::<_, AuditEvent>(
        "SELECT * FROM audit_events \
         WHERE tenant_id = $1 AND event_type = $2 \
         ORDER BY recorded_at ASC, id ASC",
    )
    .bind(tenant_id)
    .bind(event_type)
    .fetch_all(pool)
    .await
    .context("failed to list audit events by type")?;

    Ok(events)
}
