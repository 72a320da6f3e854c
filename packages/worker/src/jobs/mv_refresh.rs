//! Materialized view refresh coordinator.
//!
//! Table writes enqueue the views that depend on them; the refresh job
//! drains the queue a bounded number of views at a time, refreshing each in
//! its own autocommit statement so one failing view cannot wedge the rest.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::OnceLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::{log_audit_event, log_job_run_log, Actor};
use crate::config::Config;

const MAX_VIEWS_PER_RUN_CEILING: i64 = 200;

fn mv_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

pub(crate) fn is_valid_mv_name(name: &str) -> bool {
    mv_name_pattern().is_match(name)
}

pub(crate) fn normalize_table_names<I, S>(table_names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = table_names
        .into_iter()
        .map(|name| name.as_ref().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

#[derive(Debug, Serialize)]
pub struct EnqueueResult {
    pub tables: Vec<String>,
    pub queued: usize,
    pub queued_mvs: Vec<String>,
}

/// Queue every view that depends on one of `table_names`; already-queued
/// views are left as-is. Returns the views actually queued.
pub async fn enqueue_impacted_mvs<I, S>(pool: &PgPool, table_names: I) -> Result<EnqueueResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tables = normalize_table_names(table_names);
    if tables.is_empty() {
        return Ok(EnqueueResult {
            tables,
            queued: 0,
            queued_mvs: Vec::new(),
        });
    }

    let queued_mvs: Vec<String> = sqlx::query_scalar(
        r#"
        WITH impacted AS (
          SELECT DISTINCT mv_name
          FROM mv_dependencies
          WHERE table_name = ANY($1)
        ),
        queued AS (
          INSERT INTO mv_refresh_queue (mv_name, dirty_since)
          SELECT mv_name, now()
          FROM impacted
          ON CONFLICT (mv_name) DO NOTHING
          RETURNING mv_name
        )
        SELECT mv_name
        FROM queued
        ORDER BY mv_name
        "#,
    )
    .bind(&tables)
    .fetch_all(pool)
    .await?;

    Ok(EnqueueResult {
        tables,
        queued: queued_mvs.len(),
        queued_mvs,
    })
}

async fn refresh_mv_concurrently(pool: &PgPool, mv_name: &str) -> Result<()> {
    if !is_valid_mv_name(mv_name) {
        bail!("invalid_mv_name:{mv_name}");
    }
    // identifier validated above; quoted to keep it a plain identifier
    let statement = format!("REFRESH MATERIALIZED VIEW CONCURRENTLY \"{mv_name}\"");
    sqlx::query(&statement).execute(pool).await?;
    Ok(())
}

fn max_views_per_run(config: &Config, job_config: &Value) -> i64 {
    job_config
        .get("max_views_per_run")
        .and_then(Value::as_i64)
        .unwrap_or(config.mv_refresh_max_views_per_run)
        .clamp(1, MAX_VIEWS_PER_RUN_CEILING)
}

#[derive(Debug, Serialize)]
pub struct MvRefreshSummary {
    pub max_views_per_run: i64,
    pub pending_seen: usize,
    pub attempted: u64,
    pub refreshed: u64,
    pub failed: u64,
    pub refreshed_mvs: Vec<String>,
    pub failed_mvs: Vec<Value>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn run_mv_refresh(
    pool: &PgPool,
    config: &Config,
    job_config: &Value,
    run_id: Uuid,
    job_id: Uuid,
    actor: Option<&Actor>,
) -> Result<MvRefreshSummary> {
    let max_views_per_run = max_views_per_run(config, job_config);

    let pending: Vec<(String, DateTime<Utc>, i32)> = sqlx::query_as(
        r#"
        SELECT q.mv_name, q.dirty_since, q.attempts
        FROM mv_refresh_queue q
        JOIN (SELECT DISTINCT mv_name FROM mv_dependencies) d ON d.mv_name = q.mv_name
        ORDER BY q.dirty_since ASC, q.mv_name ASC
        LIMIT $1
        "#,
    )
    .bind(max_views_per_run)
    .fetch_all(pool)
    .await?;

    let mut summary = MvRefreshSummary {
        max_views_per_run,
        pending_seen: pending.len(),
        attempted: 0,
        refreshed: 0,
        failed: 0,
        refreshed_mvs: Vec::new(),
        failed_mvs: Vec::new(),
        finished_at: None,
    };

    info!(
        %run_id,
        %job_id,
        pending = summary.pending_seen,
        limit = max_views_per_run,
        "mv refresh run started"
    );
    log_job_run_log(
        pool,
        run_id,
        "INFO",
        "mv_refresh_started",
        json!({
            "job_id": job_id,
            "pending": summary.pending_seen,
            "max_views_per_run": max_views_per_run,
        }),
    )
    .await?;

    for (mv_name, _dirty_since, _attempts) in &pending {
        summary.attempted += 1;
        sqlx::query(
            "UPDATE mv_refresh_queue SET last_attempt_at = now(), attempts = attempts + 1 WHERE mv_name = $1",
        )
        .bind(mv_name)
        .execute(pool)
        .await?;

        match refresh_mv_concurrently(pool, mv_name).await {
            Ok(()) => {
                sqlx::query(
                    r#"
                    INSERT INTO mv_refresh_log (mv_name, last_refreshed_at)
                    VALUES ($1, now())
                    ON CONFLICT (mv_name)
                    DO UPDATE SET last_refreshed_at = EXCLUDED.last_refreshed_at
                    "#,
                )
                .bind(mv_name)
                .execute(pool)
                .await?;
                sqlx::query("DELETE FROM mv_refresh_queue WHERE mv_name = $1")
                    .bind(mv_name)
                    .execute(pool)
                    .await?;
                summary.refreshed += 1;
                summary.refreshed_mvs.push(mv_name.clone());
                info!(mv_name = mv_name.as_str(), "mv refreshed");
            }
            Err(err) => {
                summary.failed += 1;
                summary
                    .failed_mvs
                    .push(json!({"mv_name": mv_name, "error": err.to_string()}));
                warn!(mv_name = mv_name.as_str(), error = %err, "mv refresh failed");
            }
        }
    }

    summary.finished_at = Some(Utc::now());

    log_job_run_log(
        pool,
        run_id,
        if summary.failed == 0 { "INFO" } else { "WARN" },
        "mv_refresh_completed",
        json!({"job_id": job_id, "summary": serde_json::to_value(&summary)?}),
    )
    .await?;
    log_audit_event(
        pool,
        "mv_refresh_completed",
        "job_run",
        &run_id.to_string(),
        actor,
        json!({"job_id": job_id, "summary": serde_json::to_value(&summary)?}),
    )
    .await?;
    info!(
        %run_id,
        %job_id,
        refreshed = summary.refreshed,
        failed = summary.failed,
        "mv refresh run finished"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mv_names_must_be_plain_identifiers() {
        assert!(is_valid_mv_name("mv_inventory_summary"));
        assert!(is_valid_mv_name("_private_view"));
        assert!(!is_valid_mv_name("1view"));
        assert!(!is_valid_mv_name("view; DROP TABLE jobs"));
        assert!(!is_valid_mv_name(""));
        assert!(!is_valid_mv_name("view-name"));
    }

    #[test]
    fn table_names_are_trimmed_sorted_and_deduped() {
        let normalized =
            normalize_table_names(vec![" msgraph_users ", "msgraph_drives", "msgraph_users", ""]);
        assert_eq!(normalized, vec!["msgraph_drives", "msgraph_users"]);
    }

    #[test]
    fn max_views_per_run_is_clamped() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("ENTRA_TENANT_ID", "t");
        std::env::set_var("ENTRA_CLIENT_ID", "c");
        std::env::set_var("ENTRA_CLIENT_SECRET", "s");
        let config = Config::from_env().unwrap();

        assert_eq!(max_views_per_run(&config, &json!({})), 20);
        assert_eq!(max_views_per_run(&config, &json!({"max_views_per_run": 0})), 1);
        assert_eq!(
            max_views_per_run(&config, &json!({"max_views_per_run": 10_000})),
            200
        );
        assert_eq!(max_views_per_run(&config, &json!({"max_views_per_run": 50})), 50);
    }
}
