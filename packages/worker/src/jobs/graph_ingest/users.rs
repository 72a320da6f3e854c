//! Full-list users stage: page `/users`, batch UPSERT, sweep soft-delete.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::batch::dedupe_keep_last;
use super::{parse_graph_datetime, str_value, StageContext};
use crate::common::log_job_run_log;
use crate::kernel::db::BULK_PAGE_SIZE;

const USER_SELECT: &str = "id,displayName,userPrincipalName,mail,accountEnabled,userType,jobTitle,department,officeLocation,usageLocation,createdDateTime";

#[derive(Debug, Default, Serialize)]
pub struct UsersCounters {
    pub total_seen: u64,
    pub upserted: u64,
    pub dropped_duplicates: u64,
    pub marked_deleted: u64,
}

struct UserRow {
    id: String,
    display_name: Option<String>,
    user_principal_name: Option<String>,
    mail: Option<String>,
    account_enabled: Option<bool>,
    user_type: Option<String>,
    job_title: Option<String>,
    department: Option<String>,
    office_location: Option<String>,
    usage_location: Option<String>,
    created_dt: Option<DateTime<Utc>>,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

impl UserRow {
    fn from_value(id: String, user: Value, synced_at: DateTime<Utc>) -> Self {
        Self {
            display_name: str_value(&user, "displayName"),
            user_principal_name: str_value(&user, "userPrincipalName"),
            mail: str_value(&user, "mail"),
            account_enabled: user.get("accountEnabled").and_then(Value::as_bool),
            user_type: str_value(&user, "userType"),
            job_title: str_value(&user, "jobTitle"),
            department: str_value(&user, "department"),
            office_location: str_value(&user, "officeLocation"),
            usage_location: str_value(&user, "usageLocation"),
            created_dt: parse_graph_datetime(user.get("createdDateTime")),
            id,
            synced_at,
            raw_json: user,
        }
    }
}

async fn flush_users(pool: &PgPool, rows: &[UserRow]) -> sqlx::Result<()> {
    for chunk in rows.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_users \
             (id, display_name, user_principal_name, mail, account_enabled, user_type, job_title, \
              department, office_location, usage_location, created_dt, synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(&row.display_name)
                .push_bind(&row.user_principal_name)
                .push_bind(&row.mail)
                .push_bind(row.account_enabled)
                .push_bind(&row.user_type)
                .push_bind(&row.job_title)
                .push_bind(&row.department)
                .push_bind(&row.office_location)
                .push_bind(&row.usage_location)
                .push_bind(row.created_dt)
                .push_bind(row.synced_at)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             display_name = EXCLUDED.display_name, \
             user_principal_name = EXCLUDED.user_principal_name, \
             mail = EXCLUDED.mail, \
             account_enabled = EXCLUDED.account_enabled, \
             user_type = EXCLUDED.user_type, \
             job_title = EXCLUDED.job_title, \
             department = EXCLUDED.department, \
             office_location = EXCLUDED.office_location, \
             usage_location = EXCLUDED.usage_location, \
             created_dt = EXCLUDED.created_dt, \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = NULL, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(pool).await?;
    }
    Ok(())
}

pub async fn ingest_users(ctx: &StageContext<'_>) -> Result<UsersCounters> {
    let synced_at = Utc::now();
    let mut counters = UsersCounters::default();
    let mut batch: Vec<UserRow> = Vec::new();

    let mut pages = ctx
        .client
        .paged(&format!("/users?$select={USER_SELECT}&$top=999"));
    while let Some(user) = pages.next().await? {
        let Some(id) = user.get("id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        batch.push(UserRow::from_value(id, user, synced_at));
        counters.total_seen += 1;

        if batch.len() >= ctx.flush_every {
            let (deduped, dropped) = dedupe_keep_last(std::mem::take(&mut batch), |r| r.id.clone());
            flush_users(ctx.pool, &deduped).await?;
            counters.upserted += deduped.len() as u64;
            counters.dropped_duplicates += dropped as u64;
        }
    }

    if !batch.is_empty() {
        let (deduped, dropped) = dedupe_keep_last(batch, |r| r.id.clone());
        flush_users(ctx.pool, &deduped).await?;
        counters.upserted += deduped.len() as u64;
        counters.dropped_duplicates += dropped as u64;
    }

    let swept = sqlx::query(
        r#"
        UPDATE msgraph_users
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
        "users_ingested",
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
    fn user_row_captures_selected_fields() {
        let user = json!({
            "id": "u1",
            "displayName": "Alice",
            "userPrincipalName": "alice@corp.example.com",
            "mail": "alice@example.com",
            "accountEnabled": true,
            "userType": "Member",
            "createdDateTime": "2023-06-01T12:00:00Z"
        });
        let synced_at = Utc::now();
        let row = UserRow::from_value("u1".to_string(), user, synced_at);
        assert_eq!(row.display_name.as_deref(), Some("Alice"));
        assert_eq!(row.account_enabled, Some(true));
        assert!(row.created_dt.is_some());
        assert!(row.job_title.is_none());
        assert_eq!(row.raw_json.get("id").unwrap(), "u1");
    }
}
