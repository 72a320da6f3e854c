//! Append-only audit events and per-run log records.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Identity attached to audit events. Absent fields are recorded as NULL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    pub oid: Option<String>,
    pub upn: Option<String>,
    pub name: Option<String>,
}

pub async fn log_audit_event(
    pool: &PgPool,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    actor: Option<&Actor>,
    details: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_events
          (event_id, occurred_at, actor_oid, actor_upn, actor_name, action, entity_type, entity_id, details)
        VALUES
          ($1, now(), $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(actor.and_then(|a| a.oid.as_deref()))
    .bind(actor.and_then(|a| a.upn.as_deref()))
    .bind(actor.and_then(|a| a.name.as_deref()))
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(details)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn log_job_run_log(
    pool: &PgPool,
    run_id: Uuid,
    level: &str,
    message: &str,
    context: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_run_logs (run_id, level, message, context)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(run_id)
    .bind(level)
    .bind(message)
    .bind(context)
    .execute(pool)
    .await?;

    Ok(())
}
