//! Staged incremental ingest of the tenant collaboration graph.
//!
//! Stages run in a fixed order (overridable per job config), each pinning a
//! pass timestamp at entry, writing batched UPSERTs keyed by the entity's
//! natural key, and reconciling deletions either by sweep (full-list
//! sources) or by upstream tombstones (delta sources).

pub mod batch;
pub mod delta;
pub mod drive_items;
pub mod drives;
pub mod groups;
pub mod identity;
pub mod memberships;
pub mod permissions;
pub mod sites;
pub mod users;

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::common::{log_audit_event, log_job_run_log, Actor};
use crate::config::Config;
use crate::kernel::db::WriteRetryPolicy;
use crate::kernel::graph::GraphClient;

const DEFAULT_STAGE_ORDER: [&str; 7] = [
    "users",
    "groups",
    "group_memberships",
    "sites",
    "drives",
    "drive_items",
    "permissions",
];

/// Per-run knobs, merged from process config and the job's `config` JSON.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub flush_every: usize,
    pub pull_permissions: bool,
    pub sync_group_memberships: bool,
    pub group_memberships_users_only: bool,
    pub stages: Option<Vec<String>>,
    pub skip_stages: HashSet<String>,
    pub permissions_batch_size: i64,
    pub permissions_stale_after_hours: i64,
}

impl IngestOptions {
    pub fn from_job_config(config: &Config, job_config: &Value) -> Self {
        let get_bool = |key: &str, default: bool| {
            job_config.get(key).and_then(Value::as_bool).unwrap_or(default)
        };

        let stages = job_config
            .get("stages")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty());

        let skip_stages = job_config
            .get("skip_stages")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            flush_every: job_config
                .get("flush_every")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(config.flush_every),
            pull_permissions: get_bool("pull_permissions", true),
            sync_group_memberships: get_bool("sync_group_memberships", true),
            group_memberships_users_only: get_bool("group_memberships_users_only", true),
            stages,
            skip_stages,
            permissions_batch_size: job_config
                .get("permissions_batch_size")
                .and_then(Value::as_i64)
                .unwrap_or(config.graph_permissions_batch_size),
            permissions_stale_after_hours: job_config
                .get("permissions_stale_after_hours")
                .and_then(Value::as_i64)
                .unwrap_or(config.graph_permissions_stale_after_hours),
        }
    }
}

/// Shared handles every stage works from.
pub struct StageContext<'a> {
    pub pool: &'a PgPool,
    pub client: &'a GraphClient,
    pub run_id: Uuid,
    pub flush_every: usize,
    pub page_size: u32,
    pub max_concurrency: usize,
    pub retry: WriteRetryPolicy,
}

pub async fn run_graph_ingest(
    pool: &PgPool,
    config: &Config,
    client: &GraphClient,
    job_config: &Value,
    run_id: Uuid,
    job_id: Uuid,
    actor: Option<&Actor>,
) -> Result<()> {
    let started_at = Utc::now();
    let options = IngestOptions::from_job_config(config, job_config);
    let ctx = StageContext {
        pool,
        client,
        run_id,
        flush_every: options.flush_every.max(1),
        page_size: config.graph_page_size,
        max_concurrency: config.graph_max_concurrency.max(1),
        retry: WriteRetryPolicy::from_config(config),
    };

    log_audit_event(
        pool,
        "graph_ingest_started",
        "job_run",
        &run_id.to_string(),
        actor,
        json!({"job_id": job_id}),
    )
    .await?;
    log_job_run_log(
        pool,
        run_id,
        "INFO",
        "graph_ingest_started",
        json!({"job_id": job_id, "started_at": started_at}),
    )
    .await?;

    let stage_order: Vec<String> = options
        .stages
        .clone()
        .unwrap_or_else(|| DEFAULT_STAGE_ORDER.iter().map(|s| s.to_string()).collect());

    let mut stage_summaries: Map<String, Value> = Map::new();
    for stage in &stage_order {
        if options.skip_stages.contains(stage) {
            stage_summaries.insert(stage.clone(), json!({"skipped": true}));
            continue;
        }

        info!(stage = stage.as_str(), %run_id, "ingest stage started");
        log_job_run_log(
            pool,
            run_id,
            "INFO",
            &format!("stage_started:{stage}"),
            json!({"job_id": job_id}),
        )
        .await?;

        let summary = match stage.as_str() {
            "users" => serde_json::to_value(users::ingest_users(&ctx).await?)?,
            "groups" => serde_json::to_value(groups::ingest_groups(&ctx).await?)?,
            "group_memberships" => {
                if options.sync_group_memberships {
                    serde_json::to_value(
                        memberships::ingest_group_memberships(
                            &ctx,
                            options.group_memberships_users_only,
                        )
                        .await?,
                    )?
                } else {
                    json!({"skipped": true, "reason": "sync_group_memberships_disabled"})
                }
            }
            "sites" => serde_json::to_value(sites::ingest_sites(&ctx).await?)?,
            "drives" => serde_json::to_value(drives::ingest_drives(&ctx).await?)?,
            "drive_items" => serde_json::to_value(drive_items::ingest_drive_items(&ctx).await?)?,
            "permissions" => {
                if options.pull_permissions {
                    serde_json::to_value(
                        permissions::scan_permissions(
                            &ctx,
                            options.permissions_batch_size,
                            options.permissions_stale_after_hours,
                        )
                        .await?,
                    )?
                } else {
                    json!({"skipped": true, "reason": "pull_permissions_disabled"})
                }
            }
            _ => json!({"skipped": true, "reason": "unknown_stage"}),
        };
        stage_summaries.insert(stage.clone(), summary);
    }

    let stages = Value::Object(stage_summaries);
    log_job_run_log(
        pool,
        run_id,
        "INFO",
        "graph_ingest_completed",
        json!({"job_id": job_id, "stages": stages, "started_at": started_at}),
    )
    .await?;
    log_audit_event(
        pool,
        "graph_ingest_completed",
        "job_run",
        &run_id.to_string(),
        actor,
        json!({"job_id": job_id, "stages": stages}),
    )
    .await?;

    Ok(())
}

/// Lenient parse of a Graph timestamp; malformed values become NULL rather
/// than failing the row.
pub(crate) fn parse_graph_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn str_value(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("ENTRA_TENANT_ID", "t");
        std::env::set_var("ENTRA_CLIENT_ID", "c");
        std::env::set_var("ENTRA_CLIENT_SECRET", "s");
        Config::from_env().unwrap()
    }

    #[test]
    fn options_default_from_process_config() {
        let config = test_config();
        let options = IngestOptions::from_job_config(&config, &json!({}));
        assert_eq!(options.flush_every, config.flush_every);
        assert!(options.pull_permissions);
        assert!(options.sync_group_memberships);
        assert!(options.group_memberships_users_only);
        assert!(options.stages.is_none());
        assert!(options.skip_stages.is_empty());
    }

    #[test]
    fn options_respect_job_config_overrides() {
        let config = test_config();
        let job_config = json!({
            "flush_every": 100,
            "pull_permissions": false,
            "stages": ["users", "sites"],
            "skip_stages": ["sites"],
            "permissions_batch_size": 10,
        });
        let options = IngestOptions::from_job_config(&config, &job_config);
        assert_eq!(options.flush_every, 100);
        assert!(!options.pull_permissions);
        assert_eq!(
            options.stages.as_deref(),
            Some(&["users".to_string(), "sites".to_string()][..])
        );
        assert!(options.skip_stages.contains("sites"));
        assert_eq!(options.permissions_batch_size, 10);
    }

    #[test]
    fn graph_datetime_parses_rfc3339_and_rejects_garbage() {
        let parsed = parse_graph_datetime(Some(&json!("2024-01-01T00:05:00Z")));
        assert_eq!(parsed.unwrap().to_rfc3339(), "2024-01-01T00:05:00+00:00");
        assert!(parse_graph_datetime(Some(&json!("not a date"))).is_none());
        assert!(parse_graph_datetime(None).is_none());
    }
}
