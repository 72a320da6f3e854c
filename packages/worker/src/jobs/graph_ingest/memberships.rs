//! Group membership edges, synced per group with a per-group sweep.
//!
//! A group whose member listing fails with a Graph status error is skipped
//! and counted; the stage keeps going.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::batch::dedupe_keep_last;
use super::StageContext;
use crate::common::log_job_run_log;
use crate::kernel::db::BULK_PAGE_SIZE;
use crate::kernel::graph::GraphError;

#[derive(Debug, Default, Serialize)]
pub struct MembershipCounters {
    pub groups_processed: u64,
    pub edges_upserted: u64,
    pub dropped_duplicates: u64,
    pub skipped_groups: u64,
    pub users_only: bool,
}

struct MembershipRow {
    group_id: String,
    member_id: String,
    member_type: String,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

/// Member kind from the OData type suffix, e.g.
/// `#microsoft.graph.user` -> `user`.
fn member_type(member: &Value) -> String {
    let odata_type = member
        .get("@odata.type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();
    let stripped = odata_type
        .strip_prefix("#microsoft.graph.")
        .or_else(|| odata_type.strip_prefix('#'))
        .unwrap_or(odata_type);
    if stripped.is_empty() {
        "directoryObject".to_string()
    } else {
        stripped.to_string()
    }
}

async fn flush_memberships(pool: &PgPool, rows: &[MembershipRow]) -> sqlx::Result<()> {
    for chunk in rows.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_group_memberships \
             (group_id, member_id, member_type, synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.group_id)
                .push_bind(&row.member_id)
                .push_bind(&row.member_type)
                .push_bind(row.synced_at)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (group_id, member_id, member_type) DO UPDATE SET \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = NULL, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(pool).await?;
    }
    Ok(())
}

async fn sync_group(
    ctx: &StageContext<'_>,
    group_id: &str,
    synced_at: DateTime<Utc>,
    users_only: bool,
    counters: &mut MembershipCounters,
) -> Result<()> {
    let mut pages = ctx.client.paged(&format!(
        "/groups/{group_id}/members?$select=id,displayName,userPrincipalName,mail&$top=999"
    ));
    let mut batch: Vec<MembershipRow> = Vec::new();

    while let Some(member) = pages.next().await? {
        let Some(member_id) = member.get("id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let mtype = member_type(&member);
        if users_only && mtype != "user" {
            continue;
        }
        batch.push(MembershipRow {
            group_id: group_id.to_string(),
            member_id,
            member_type: mtype,
            synced_at,
            raw_json: member,
        });

        if batch.len() >= ctx.flush_every {
            let (deduped, dropped) = dedupe_keep_last(std::mem::take(&mut batch), |r| {
                (r.group_id.clone(), r.member_id.clone(), r.member_type.clone())
            });
            flush_memberships(ctx.pool, &deduped).await?;
            counters.edges_upserted += deduped.len() as u64;
            counters.dropped_duplicates += dropped as u64;
        }
    }

    if !batch.is_empty() {
        let (deduped, dropped) = dedupe_keep_last(batch, |r| {
            (r.group_id.clone(), r.member_id.clone(), r.member_type.clone())
        });
        flush_memberships(ctx.pool, &deduped).await?;
        counters.edges_upserted += deduped.len() as u64;
        counters.dropped_duplicates += dropped as u64;
    }

    sqlx::query(
        r#"
        UPDATE msgraph_group_memberships
        SET deleted_at = $1
        WHERE group_id = $2 AND synced_at < $1 AND deleted_at IS NULL
        "#,
    )
    .bind(synced_at)
    .bind(group_id)
    .execute(ctx.pool)
    .await?;

    Ok(())
}

pub async fn ingest_group_memberships(
    ctx: &StageContext<'_>,
    users_only: bool,
) -> Result<MembershipCounters> {
    let synced_at = Utc::now();
    let mut counters = MembershipCounters {
        users_only,
        ..Default::default()
    };

    let group_ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM msgraph_groups WHERE deleted_at IS NULL")
            .fetch_all(ctx.pool)
            .await?;

    for group_id in group_ids {
        counters.groups_processed += 1;
        if let Err(err) = sync_group(ctx, &group_id, synced_at, users_only, &mut counters).await {
            match err.downcast_ref::<GraphError>() {
                Some(GraphError::Status { status, .. }) => {
                    counters.skipped_groups += 1;
                    log_job_run_log(
                        ctx.pool,
                        ctx.run_id,
                        "WARN",
                        "group_memberships_skipped",
                        json!({
                            "group_id": group_id,
                            "status_code": status,
                            "error": err.to_string(),
                        }),
                    )
                    .await?;
                }
                _ => return Err(err),
            }
        }
    }

    log_job_run_log(
        ctx.pool,
        ctx.run_id,
        "INFO",
        "group_memberships_ingested",
        json!({
            "synced_at": synced_at,
            "groups_processed": counters.groups_processed,
            "edges_upserted": counters.edges_upserted,
            "dropped_duplicates": counters.dropped_duplicates,
            "skipped_groups": counters.skipped_groups,
            "users_only": counters.users_only,
        }),
    )
    .await?;

    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_type_strips_graph_prefix() {
        assert_eq!(member_type(&json!({"@odata.type": "#microsoft.graph.user"})), "user");
        assert_eq!(
            member_type(&json!({"@odata.type": "#microsoft.graph.servicePrincipal"})),
            "servicePrincipal"
        );
    }

    #[test]
    fn member_type_strips_bare_hash_prefix() {
        assert_eq!(member_type(&json!({"@odata.type": "#custom.member"})), "custom.member");
    }

    #[test]
    fn member_type_defaults_to_directory_object() {
        assert_eq!(member_type(&json!({})), "directoryObject");
        assert_eq!(member_type(&json!({"@odata.type": ""})), "directoryObject");
    }
}
