//! Drives stage: site drives plus group- and user-owned drives.
//!
//! The same drive can surface from several endpoints with different fields
//! populated, so within-batch dedup merges duplicates field-wise instead of
//! keeping a single occurrence.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::identity::{resolve_identity, PrincipalType, UserMaps};
use super::{parse_graph_datetime, str_value, StageContext};
use crate::common::log_job_run_log;
use crate::kernel::db::BULK_PAGE_SIZE;
use crate::kernel::graph::GraphError;

const DRIVE_SELECT: &str = "id,name,description,driveType,webUrl,createdDateTime,lastModifiedDateTime,owner,createdBy,lastModifiedBy,quota";

#[derive(Debug, Default, Serialize)]
pub struct DrivesCounters {
    pub sites_processed: u64,
    pub sites_skipped_personal: u64,
    pub sites_skipped_error: u64,
    pub groups_processed: u64,
    pub groups_no_drive: u64,
    pub users_processed: u64,
    pub users_no_drive: u64,
    pub drive_upserts: u64,
    pub dropped_duplicates: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct DriveRow {
    pub id: String,
    pub site_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub drive_type: Option<String>,
    pub web_url: Option<String>,
    pub owner_id: Option<String>,
    pub owner_type: Option<String>,
    pub owner_display_name: Option<String>,
    pub owner_email: Option<String>,
    pub owner_graph_id: Option<String>,
    pub created_by_user_id: Option<String>,
    pub created_by_type: Option<String>,
    pub created_by_display_name: Option<String>,
    pub created_by_email: Option<String>,
    pub created_by_graph_id: Option<String>,
    pub last_modified_by_user_id: Option<String>,
    pub last_modified_by_type: Option<String>,
    pub last_modified_by_display_name: Option<String>,
    pub last_modified_by_email: Option<String>,
    pub last_modified_by_graph_id: Option<String>,
    pub last_modified_dt: Option<DateTime<Utc>>,
    pub quota_total: Option<i64>,
    pub quota_used: Option<i64>,
    pub quota_remaining: Option<i64>,
    pub quota_deleted: Option<i64>,
    pub quota_state: Option<String>,
    pub created_dt: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
    pub raw_json: Value,
}

macro_rules! take_if_some {
    ($dst:expr, $src:expr) => {
        if $src.is_some() {
            $dst = $src;
        }
    };
}

impl DriveRow {
    /// Field-wise merge with a later view of the same drive: non-null wins,
    /// later occurrence wins.
    fn merge_from(&mut self, other: DriveRow) {
        take_if_some!(self.site_id, other.site_id);
        take_if_some!(self.name, other.name);
        take_if_some!(self.description, other.description);
        take_if_some!(self.drive_type, other.drive_type);
        take_if_some!(self.web_url, other.web_url);
        take_if_some!(self.owner_id, other.owner_id);
        take_if_some!(self.owner_type, other.owner_type);
        take_if_some!(self.owner_display_name, other.owner_display_name);
        take_if_some!(self.owner_email, other.owner_email);
        take_if_some!(self.owner_graph_id, other.owner_graph_id);
        take_if_some!(self.created_by_user_id, other.created_by_user_id);
        take_if_some!(self.created_by_type, other.created_by_type);
        take_if_some!(self.created_by_display_name, other.created_by_display_name);
        take_if_some!(self.created_by_email, other.created_by_email);
        take_if_some!(self.created_by_graph_id, other.created_by_graph_id);
        take_if_some!(self.last_modified_by_user_id, other.last_modified_by_user_id);
        take_if_some!(self.last_modified_by_type, other.last_modified_by_type);
        take_if_some!(
            self.last_modified_by_display_name,
            other.last_modified_by_display_name
        );
        take_if_some!(self.last_modified_by_email, other.last_modified_by_email);
        take_if_some!(self.last_modified_by_graph_id, other.last_modified_by_graph_id);
        take_if_some!(self.last_modified_dt, other.last_modified_dt);
        take_if_some!(self.quota_total, other.quota_total);
        take_if_some!(self.quota_used, other.quota_used);
        take_if_some!(self.quota_remaining, other.quota_remaining);
        take_if_some!(self.quota_deleted, other.quota_deleted);
        take_if_some!(self.quota_state, other.quota_state);
        take_if_some!(self.created_dt, other.created_dt);
        self.synced_at = other.synced_at;
        self.raw_json = other.raw_json;
    }
}

/// Merge-dedup drive rows by id, preserving first-occurrence order.
pub(crate) fn dedupe_merge_drives(rows: Vec<DriveRow>) -> (Vec<DriveRow>, usize) {
    if rows.len() < 2 {
        return (rows, 0);
    }
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<DriveRow> = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in rows {
        match index.get(&row.id) {
            Some(&i) => {
                merged[i].merge_from(row);
                dropped += 1;
            }
            None => {
                index.insert(row.id.clone(), merged.len());
                merged.push(row);
            }
        }
    }
    (merged, dropped)
}

pub(crate) fn build_drive_row(
    drive: &Value,
    site_id: Option<&str>,
    owner_hint_id: Option<&str>,
    owner_hint_type: Option<&str>,
    synced_at: DateTime<Utc>,
    users: &UserMaps,
) -> Option<DriveRow> {
    let id = drive.get("id").and_then(Value::as_str)?.to_string();
    let quota = drive.get("quota");
    let quota_i64 = |key: &str| quota.and_then(|q| q.get(key)).and_then(Value::as_i64);

    let owner = resolve_identity(drive.get("owner"), users);
    let mut owner_user_id = owner.user_fk;
    let mut owner_type = Some(owner.principal_type.as_str().to_string());
    let mut owner_graph_id = owner.external_id;

    if let Some(hint_id) = owner_hint_id {
        if owner_graph_id.is_none() {
            owner_graph_id = Some(hint_id.to_string());
        }
        if owner.principal_type == PrincipalType::Unknown {
            if let Some(hint_type) = owner_hint_type {
                owner_type = Some(hint_type.to_string());
            }
        }
        if owner_hint_type == Some("user") && owner_user_id.is_none() {
            owner_user_id = Some(hint_id.to_string());
        }
    }

    let created_by = resolve_identity(drive.get("createdBy"), users);
    let last_modified_by = resolve_identity(drive.get("lastModifiedBy"), users);

    Some(DriveRow {
        site_id: site_id.map(str::to_string),
        name: str_value(drive, "name"),
        description: str_value(drive, "description"),
        drive_type: str_value(drive, "driveType"),
        web_url: str_value(drive, "webUrl"),
        owner_id: owner_user_id.clone().or_else(|| owner_hint_id.map(str::to_string)),
        owner_type,
        owner_display_name: owner.display_name,
        owner_email: owner.email,
        owner_graph_id,
        created_by_user_id: created_by.user_fk,
        created_by_type: Some(created_by.principal_type.as_str().to_string()),
        created_by_display_name: created_by.display_name,
        created_by_email: created_by.email,
        created_by_graph_id: created_by.external_id,
        last_modified_by_user_id: last_modified_by.user_fk,
        last_modified_by_type: Some(last_modified_by.principal_type.as_str().to_string()),
        last_modified_by_display_name: last_modified_by.display_name,
        last_modified_by_email: last_modified_by.email,
        last_modified_by_graph_id: last_modified_by.external_id,
        last_modified_dt: parse_graph_datetime(drive.get("lastModifiedDateTime")),
        quota_total: quota_i64("total"),
        quota_used: quota_i64("used"),
        quota_remaining: quota_i64("remaining"),
        quota_deleted: quota_i64("deleted"),
        quota_state: quota
            .and_then(|q| q.get("state"))
            .and_then(Value::as_str)
            .map(str::to_string),
        created_dt: parse_graph_datetime(drive.get("createdDateTime")),
        synced_at,
        raw_json: drive.clone(),
        id,
    })
}

struct SiteRef {
    id: String,
    hostname: Option<String>,
    web_url: Option<String>,
    raw_json: Option<Value>,
}

/// Personal (OneDrive) sites are excluded from the site-drive walk; they
/// surface through the per-user pass instead.
fn is_personal_site(site: &SiteRef) -> bool {
    let raw = site.raw_json.as_ref();
    if raw
        .and_then(|r| r.get("isPersonalSite"))
        .and_then(Value::as_bool)
        == Some(true)
    {
        return true;
    }
    let hostname = site
        .hostname
        .clone()
        .or_else(|| {
            raw.and_then(|r| r.get("siteCollection"))
                .and_then(|c| c.get("hostname"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
        .to_lowercase();
    let web_url = site
        .web_url
        .clone()
        .or_else(|| {
            raw.and_then(|r| r.get("webUrl"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
        .to_lowercase();
    hostname.ends_with("my.sharepoint.com") || web_url.contains("/personal/")
}

async fn flush_drives(
    pool: &PgPool,
    rows: Vec<DriveRow>,
    counters: &mut DrivesCounters,
) -> sqlx::Result<()> {
    let (deduped, dropped) = dedupe_merge_drives(rows);
    counters.dropped_duplicates += dropped as u64;
    if deduped.is_empty() {
        return Ok(());
    }
    for chunk in deduped.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_drives \
             (id, site_id, name, description, drive_type, web_url, owner_id, owner_type, \
              owner_display_name, owner_email, owner_graph_id, created_by_user_id, created_by_type, \
              created_by_display_name, created_by_email, created_by_graph_id, last_modified_by_user_id, \
              last_modified_by_type, last_modified_by_display_name, last_modified_by_email, \
              last_modified_by_graph_id, last_modified_dt, quota_total, quota_used, quota_remaining, \
              quota_deleted, quota_state, created_dt, synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(&row.site_id)
                .push_bind(&row.name)
                .push_bind(&row.description)
                .push_bind(&row.drive_type)
                .push_bind(&row.web_url)
                .push_bind(&row.owner_id)
                .push_bind(&row.owner_type)
                .push_bind(&row.owner_display_name)
                .push_bind(&row.owner_email)
                .push_bind(&row.owner_graph_id)
                .push_bind(&row.created_by_user_id)
                .push_bind(&row.created_by_type)
                .push_bind(&row.created_by_display_name)
                .push_bind(&row.created_by_email)
                .push_bind(&row.created_by_graph_id)
                .push_bind(&row.last_modified_by_user_id)
                .push_bind(&row.last_modified_by_type)
                .push_bind(&row.last_modified_by_display_name)
                .push_bind(&row.last_modified_by_email)
                .push_bind(&row.last_modified_by_graph_id)
                .push_bind(row.last_modified_dt)
                .push_bind(row.quota_total)
                .push_bind(row.quota_used)
                .push_bind(row.quota_remaining)
                .push_bind(row.quota_deleted)
                .push_bind(&row.quota_state)
                .push_bind(row.created_dt)
                .push_bind(row.synced_at)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             site_id = EXCLUDED.site_id, \
             name = EXCLUDED.name, \
             description = EXCLUDED.description, \
             drive_type = EXCLUDED.drive_type, \
             web_url = EXCLUDED.web_url, \
             owner_id = EXCLUDED.owner_id, \
             owner_type = EXCLUDED.owner_type, \
             owner_display_name = EXCLUDED.owner_display_name, \
             owner_email = EXCLUDED.owner_email, \
             owner_graph_id = EXCLUDED.owner_graph_id, \
             created_by_user_id = EXCLUDED.created_by_user_id, \
             created_by_type = EXCLUDED.created_by_type, \
             created_by_display_name = EXCLUDED.created_by_display_name, \
             created_by_email = EXCLUDED.created_by_email, \
             created_by_graph_id = EXCLUDED.created_by_graph_id, \
             last_modified_by_user_id = EXCLUDED.last_modified_by_user_id, \
             last_modified_by_type = EXCLUDED.last_modified_by_type, \
             last_modified_by_display_name = EXCLUDED.last_modified_by_display_name, \
             last_modified_by_email = EXCLUDED.last_modified_by_email, \
             last_modified_by_graph_id = EXCLUDED.last_modified_by_graph_id, \
             last_modified_dt = EXCLUDED.last_modified_dt, \
             quota_total = EXCLUDED.quota_total, \
             quota_used = EXCLUDED.quota_used, \
             quota_remaining = EXCLUDED.quota_remaining, \
             quota_deleted = EXCLUDED.quota_deleted, \
             quota_state = EXCLUDED.quota_state, \
             created_dt = EXCLUDED.created_dt, \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = NULL, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(pool).await?;
    }
    counters.drive_upserts += deduped.len() as u64;
    Ok(())
}

/// Collect the drives of one owner endpoint. Returns whether any drive was
/// seen; 403/404/410 means "no drive" for group and user owners.
async fn collect_owner_drives(
    ctx: &StageContext<'_>,
    url: String,
    site_id: Option<&str>,
    owner_hint_id: Option<&str>,
    owner_hint_type: Option<&str>,
    synced_at: DateTime<Utc>,
    users: &UserMaps,
    batch: &mut Vec<DriveRow>,
) -> Result<bool> {
    let mut pages = ctx.client.paged(&url);
    let mut has_drive = false;
    while let Some(drive) = pages.next().await? {
        let Some(row) = build_drive_row(
            &drive,
            site_id,
            owner_hint_id,
            owner_hint_type,
            synced_at,
            users,
        ) else {
            continue;
        };
        has_drive = true;
        batch.push(row);
    }
    Ok(has_drive)
}

pub async fn ingest_drives(ctx: &StageContext<'_>) -> Result<DrivesCounters> {
    let synced_at = Utc::now();
    let mut counters = DrivesCounters::default();
    let users = UserMaps::load(ctx.pool).await?;

    let sites: Vec<(String, Option<String>, Option<String>, Option<Value>)> = sqlx::query_as(
        "SELECT id, hostname, web_url, raw_json FROM msgraph_sites WHERE deleted_at IS NULL",
    )
    .fetch_all(ctx.pool)
    .await?;

    let mut batch: Vec<DriveRow> = Vec::new();
    let page_size = ctx.page_size;

    for (id, hostname, web_url, raw_json) in sites {
        counters.sites_processed += 1;
        let site = SiteRef {
            id,
            hostname,
            web_url,
            raw_json,
        };
        if is_personal_site(&site) {
            counters.sites_skipped_personal += 1;
            continue;
        }

        let url = format!(
            "/sites/{}/drives?$top={page_size}&$select={DRIVE_SELECT}",
            site.id
        );
        let result = collect_and_flush_site(ctx, url, &site.id, synced_at, &users, &mut batch, &mut counters).await;
        if let Err(err) = result {
            match err.downcast_ref::<GraphError>() {
                Some(GraphError::Status { status, .. }) => {
                    if !matches!(*status, 403 | 404 | 410) {
                        counters.sites_skipped_error += 1;
                    }
                    log_job_run_log(
                        ctx.pool,
                        ctx.run_id,
                        "WARN",
                        "site_drives_skipped",
                        json!({
                            "site_id": site.id,
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

    let group_ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM msgraph_groups WHERE deleted_at IS NULL")
            .fetch_all(ctx.pool)
            .await?;
    for group_id in group_ids {
        counters.groups_processed += 1;
        let url = format!("/groups/{group_id}/drives?$top={page_size}&$select={DRIVE_SELECT}");
        match collect_owner_drives(
            ctx,
            url,
            None,
            Some(&group_id),
            Some("group"),
            synced_at,
            &users,
            &mut batch,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => counters.groups_no_drive += 1,
            Err(err) => match err.downcast_ref::<GraphError>() {
                Some(GraphError::Status { status, .. }) if matches!(*status, 403 | 404 | 410) => {
                    counters.groups_no_drive += 1;
                    continue;
                }
                _ => return Err(err),
            },
        }

        if batch.len() >= ctx.flush_every {
            flush_drives(ctx.pool, std::mem::take(&mut batch), &mut counters).await?;
        }
    }

    let user_ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM msgraph_users WHERE deleted_at IS NULL")
            .fetch_all(ctx.pool)
            .await?;
    for user_id in user_ids {
        counters.users_processed += 1;
        let url = format!("/users/{user_id}/drives?$top={page_size}&$select={DRIVE_SELECT}");
        match collect_owner_drives(
            ctx,
            url,
            None,
            Some(&user_id),
            Some("user"),
            synced_at,
            &users,
            &mut batch,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => counters.users_no_drive += 1,
            Err(err) => match err.downcast_ref::<GraphError>() {
                Some(GraphError::Status { status, .. }) if matches!(*status, 403 | 404 | 410) => {
                    counters.users_no_drive += 1;
                    continue;
                }
                _ => return Err(err),
            },
        }

        if batch.len() >= ctx.flush_every {
            flush_drives(ctx.pool, std::mem::take(&mut batch), &mut counters).await?;
        }
    }

    if !batch.is_empty() {
        flush_drives(ctx.pool, batch, &mut counters).await?;
    }

    log_job_run_log(
        ctx.pool,
        ctx.run_id,
        "INFO",
        "drives_ingested",
        json!({
            "synced_at": synced_at,
            "sites_processed": counters.sites_processed,
            "sites_skipped_personal": counters.sites_skipped_personal,
            "sites_skipped_error": counters.sites_skipped_error,
            "groups_processed": counters.groups_processed,
            "groups_no_drive": counters.groups_no_drive,
            "users_processed": counters.users_processed,
            "users_no_drive": counters.users_no_drive,
            "drive_upserts": counters.drive_upserts,
            "dropped_duplicates": counters.dropped_duplicates,
        }),
    )
    .await?;

    Ok(counters)
}

/// Site pass flushes inside the page walk so a large site cannot hold the
/// whole listing in memory.
async fn collect_and_flush_site(
    ctx: &StageContext<'_>,
    url: String,
    site_id: &str,
    synced_at: DateTime<Utc>,
    users: &UserMaps,
    batch: &mut Vec<DriveRow>,
    counters: &mut DrivesCounters,
) -> Result<()> {
    let mut pages = ctx.client.paged(&url);
    while let Some(drive) = pages.next().await? {
        let Some(row) = build_drive_row(&drive, Some(site_id), None, None, synced_at, users) else {
            continue;
        };
        batch.push(row);
        if batch.len() >= ctx.flush_every {
            flush_drives(ctx.pool, std::mem::take(batch), counters).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, name: Option<&str>, site: Option<&str>) -> DriveRow {
        DriveRow {
            id: id.to_string(),
            site_id: site.map(str::to_string),
            name: name.map(str::to_string),
            description: None,
            drive_type: None,
            web_url: None,
            owner_id: None,
            owner_type: None,
            owner_display_name: None,
            owner_email: None,
            owner_graph_id: None,
            created_by_user_id: None,
            created_by_type: None,
            created_by_display_name: None,
            created_by_email: None,
            created_by_graph_id: None,
            last_modified_by_user_id: None,
            last_modified_by_type: None,
            last_modified_by_display_name: None,
            last_modified_by_email: None,
            last_modified_by_graph_id: None,
            last_modified_dt: None,
            quota_total: None,
            quota_used: None,
            quota_remaining: None,
            quota_deleted: None,
            quota_state: None,
            created_dt: None,
            synced_at: Utc::now(),
            raw_json: json!({}),
        }
    }

    #[test]
    fn merge_dedup_keeps_last_non_null_per_field() {
        let rows = vec![
            row("d1", Some("From Site"), Some("s1")),
            row("d1", None, None),
            row("d2", Some("Other"), None),
        ];
        let (merged, dropped) = dedupe_merge_drives(rows);
        assert_eq!(dropped, 1);
        assert_eq!(merged.len(), 2);
        // the second d1 view carried no fields, so the site view survives
        assert_eq!(merged[0].name.as_deref(), Some("From Site"));
        assert_eq!(merged[0].site_id.as_deref(), Some("s1"));
    }

    #[test]
    fn merge_dedup_later_non_null_wins() {
        let rows = vec![
            row("d1", Some("Old Name"), None),
            row("d1", Some("New Name"), Some("s9")),
        ];
        let (merged, dropped) = dedupe_merge_drives(rows);
        assert_eq!(dropped, 1);
        assert_eq!(merged[0].name.as_deref(), Some("New Name"));
        assert_eq!(merged[0].site_id.as_deref(), Some("s9"));
    }

    #[test]
    fn owner_hint_fills_unresolved_owner() {
        let users = UserMaps::from_rows(vec![]);
        let drive = json!({"id": "d1", "name": "User Drive"});
        let row =
            build_drive_row(&drive, None, Some("u9"), Some("user"), Utc::now(), &users).unwrap();
        assert_eq!(row.owner_id.as_deref(), Some("u9"));
        assert_eq!(row.owner_type.as_deref(), Some("user"));
        assert_eq!(row.owner_graph_id.as_deref(), Some("u9"));
    }

    #[test]
    fn resolved_owner_beats_hint_type() {
        let users = UserMaps::from_rows(vec![]);
        let drive = json!({
            "id": "d1",
            "owner": {"group": {"id": "g1", "displayName": "Team"}}
        });
        let row =
            build_drive_row(&drive, None, Some("g1"), Some("group"), Utc::now(), &users).unwrap();
        assert_eq!(row.owner_type.as_deref(), Some("group"));
        assert_eq!(row.owner_graph_id.as_deref(), Some("g1"));
        assert!(row.created_by_type.is_some());
    }

    #[test]
    fn personal_sites_detected_by_flag_hostname_and_path() {
        let by_flag = SiteRef {
            id: "s1".into(),
            hostname: None,
            web_url: None,
            raw_json: Some(json!({"isPersonalSite": true})),
        };
        assert!(is_personal_site(&by_flag));

        let by_hostname = SiteRef {
            id: "s2".into(),
            hostname: Some("contoso-my.sharepoint.com".into()),
            web_url: None,
            raw_json: None,
        };
        assert!(is_personal_site(&by_hostname));

        let by_path = SiteRef {
            id: "s3".into(),
            hostname: None,
            web_url: Some("https://contoso-my.sharepoint.com/personal/alice".into()),
            raw_json: None,
        };
        assert!(is_personal_site(&by_path));

        let team = SiteRef {
            id: "s4".into(),
            hostname: Some("contoso.sharepoint.com".into()),
            web_url: Some("https://contoso.sharepoint.com/sites/team".into()),
            raw_json: None,
        };
        assert!(!is_personal_site(&team));
    }
}
