//! Full-list groups stage, same shape as the users stage.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::batch::dedupe_keep_last;
use super::{parse_graph_datetime, str_value, StageContext};
use crate::common::log_job_run_log;
use crate::kernel::db::BULK_PAGE_SIZE;

const GROUP_SELECT: &str = "id,displayName,mail,mailEnabled,securityEnabled,groupTypes,visibility,isAssignableToRole,createdDateTime";

#[derive(Debug, Default, Serialize)]
pub struct GroupsCounters {
    pub total_seen: u64,
    pub upserted: u64,
    pub dropped_duplicates: u64,
    pub marked_deleted: u64,
}

struct GroupRow {
    id: String,
    display_name: Option<String>,
    mail: Option<String>,
    mail_enabled: Option<bool>,
    security_enabled: Option<bool>,
    group_types: Option<Vec<String>>,
    visibility: Option<String>,
    is_assignable_to_role: Option<bool>,
    created_dt: Option<DateTime<Utc>>,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

impl GroupRow {
    fn from_value(id: String, group: Value, synced_at: DateTime<Utc>) -> Self {
        Self {
            display_name: str_value(&group, "displayName"),
            mail: str_value(&group, "mail"),
            mail_enabled: group.get("mailEnabled").and_then(Value::as_bool),
            security_enabled: group.get("securityEnabled").and_then(Value::as_bool),
            group_types: group.get("groupTypes").and_then(Value::as_array).map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
            visibility: str_value(&group, "visibility"),
            is_assignable_to_role: group.get("isAssignableToRole").and_then(Value::as_bool),
            created_dt: parse_graph_datetime(group.get("createdDateTime")),
            id,
            synced_at,
            raw_json: group,
        }
    }
}

async fn flush_groups(pool: &PgPool, rows: &[GroupRow]) -> sqlx::Result<()> {
    for chunk in rows.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_groups \
             (id, display_name, mail, mail_enabled, security_enabled, group_types, \
              visibility, is_assignable_to_role, created_dt, synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(&row.display_name)
                .push_bind(&row.mail)
                .push_bind(row.mail_enabled)
                .push_bind(row.security_enabled)
                .push_bind(&row.group_types)
                .push_bind(&row.visibility)
                .push_bind(row.is_assignable_to_role)
                .push_bind(row.created_dt)
                .push_bind(row.synced_at)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             display_name = EXCLUDED.display_name, \
             mail = EXCLUDED.mail, \
             mail_enabled = EXCLUDED.mail_enabled, \
             security_enabled = EXCLUDED.security_enabled, \
             group_types = EXCLUDED.group_types, \
             visibility = EXCLUDED.visibility, \
             is_assignable_to_role = EXCLUDED.is_assignable_to_role, \
             created_dt = EXCLUDED.created_dt, \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = NULL, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(pool).await?;
    }
    Ok(())
}

pub async fn ingest_groups(ctx: &StageContext<'_>) -> Result<GroupsCounters> {
    let synced_at = Utc::now();
    let mut counters = GroupsCounters::default();
    let mut batch: Vec<GroupRow> = Vec::new();

    let mut pages = ctx
        .client
        .paged(&format!("/groups?$select={GROUP_SELECT}&$top=999"));
    while let Some(group) = pages.next().await? {
        let Some(id) = group.get("id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        batch.push(GroupRow::from_value(id, group, synced_at));
        counters.total_seen += 1;

        if batch.len() >= ctx.flush_every {
            let (deduped, dropped) = dedupe_keep_last(std::mem::take(&mut batch), |r| r.id.clone());
            flush_groups(ctx.pool, &deduped).await?;
            counters.upserted += deduped.len() as u64;
            counters.dropped_duplicates += dropped as u64;
        }
    }

    if !batch.is_empty() {
        let (deduped, dropped) = dedupe_keep_last(batch, |r| r.id.clone());
        flush_groups(ctx.pool, &deduped).await?;
        counters.upserted += deduped.len() as u64;
        counters.dropped_duplicates += dropped as u64;
    }

    let swept = sqlx::query(
        r#"
        UPDATE msgraph_groups
        SET deleted_at = $1, synced_at = $1
        WHERE synced_at < $1 AND deleted_at IS NULL
        "#,
    )
    .bind(synced_at)
    .execute(ctx.pool)
    .await?;
    counters.marked_deleted = swept.rows_affected();

    log_job_run_log(
        ctx.pool,
        ctx.run_id,
        "INFO",
        "groups_ingested",
        json!({
            "synced_at": synced_at,
            "total_seen": counters.total_seen,
            "upserted": counters.upserted,
            "dropped_duplicates": counters.dropped_duplicates,
            "marked_deleted": counters.marked_deleted,
        }),
    )
    .await?;

    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_row_collects_group_types() {
        let group = json!({
            "id": "g1",
            "displayName": "Engineering",
            "groupTypes": ["Unified", "DynamicMembership"],
            "securityEnabled": false
        });
        let row = GroupRow::from_value("g1".to_string(), group, Utc::now());
        assert_eq!(
            row.group_types.as_deref(),
            Some(&["Unified".to_string(), "DynamicMembership".to_string()][..])
        );
        assert_eq!(row.security_enabled, Some(false));
        assert!(row.mail.is_none());
    }
}
