//! Permissions scan: per-item fan-out with set-replacement writes.
//!
//! Stale file items are processed in batches; each item's permission set is
//! fetched concurrently under a bounded pool, then replaced wholesale
//! (delete + insert) in a single retried transaction together with the
//! per-item freshness bookkeeping.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::batch::dedupe_keep_last;
use super::StageContext;
use crate::common::log_job_run_log;
use crate::kernel::db::{execute_with_write_retry, BULK_PAGE_SIZE};
use crate::kernel::graph::{truncate, GraphClient, GraphError};

const PERMISSION_SELECT: &str =
    "id,roles,link,inheritedFrom,grantedTo,grantedToV2,grantedToIdentities,grantedToIdentitiesV2";
const ERROR_MAX_CHARS: usize = 500;

#[derive(Debug, Default, Serialize)]
pub struct PermissionsCounters {
    pub batches: u64,
    pub items_processed: u64,
    pub items_ok: u64,
    pub items_err: u64,
    pub stale_after_hours: i64,
    pub dropped_permission_duplicates: u64,
    pub dropped_grant_duplicates: u64,
    pub db_retry_attempts: u64,
    pub db_retry_exhausted_batches: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Grant {
    pub principal_type: String,
    pub principal_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub user_principal_name: Option<String>,
    pub raw: Value,
}

fn grants_from_identity_set(set: &Value, out: &mut Vec<Grant>) {
    for kind in ["user", "group", "application", "siteGroup", "siteUser"] {
        let Some(obj) = set.get(kind).filter(|v| !v.is_null()) else {
            continue;
        };
        let Some(principal_id) = obj.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())
        else {
            continue;
        };
        out.push(Grant {
            principal_type: kind.to_string(),
            principal_id: principal_id.to_string(),
            display_name: obj
                .get("displayName")
                .or_else(|| obj.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            email: obj
                .get("email")
                .or_else(|| obj.get("userPrincipalName"))
                .and_then(Value::as_str)
                .map(str::to_string),
            user_principal_name: obj
                .get("userPrincipalName")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: obj.clone(),
        });
    }
}

/// Grants of one permission. V2 identity shapes win over V1 when any V2
/// field is present; a sharing link contributes a single synthetic
/// `('link','link')` grant carrying the link object.
pub(crate) fn extract_grants(permission: &Value) -> Vec<Grant> {
    let mut grants = Vec::new();

    let v2_single = permission.get("grantedToV2").filter(|v| v.is_object());
    let v2_list = permission
        .get("grantedToIdentitiesV2")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty());
    let has_v2 = v2_single.is_some() || v2_list.is_some();

    if has_v2 {
        if let Some(set) = v2_single {
            grants_from_identity_set(set, &mut grants);
        }
        if let Some(list) = v2_list {
            for set in list.iter().filter(|v| v.is_object()) {
                grants_from_identity_set(set, &mut grants);
            }
        }
    } else {
        if let Some(set) = permission.get("grantedTo").filter(|v| v.is_object()) {
            grants_from_identity_set(set, &mut grants);
        }
        if let Some(list) = permission.get("grantedToIdentities").and_then(Value::as_array) {
            for set in list.iter().filter(|v| v.is_object()) {
                grants_from_identity_set(set, &mut grants);
            }
        }
    }

    if let Some(link) = permission
        .get("link")
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
    {
        grants.push(Grant {
            principal_type: "link".to_string(),
            principal_id: "link".to_string(),
            display_name: link.get("type").and_then(Value::as_str).map(str::to_string),
            email: None,
            user_principal_name: None,
            raw: link.clone(),
        });
    }

    grants
}

struct PermissionRow {
    drive_id: String,
    item_id: String,
    permission_id: String,
    source: &'static str,
    roles: Option<Vec<String>>,
    link_type: Option<String>,
    link_scope: Option<String>,
    link_web_url: Option<String>,
    link_prevents_download: Option<bool>,
    link_expiration_dt: Option<DateTime<Utc>>,
    inherited_from_id: Option<String>,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

struct GrantRow {
    drive_id: String,
    item_id: String,
    permission_id: String,
    grant: Grant,
    synced_at: DateTime<Utc>,
}

type ItemKey = (String, String);

async fn fetch_permissions(
    client: &GraphClient,
    drive_id: &str,
    item_id: &str,
) -> Result<Vec<Value>, GraphError> {
    client
        .collect_paged(&format!(
            "/drives/{drive_id}/items/{item_id}/permissions?$select={PERMISSION_SELECT}&$top=200"
        ))
        .await
}

#[allow(clippy::too_many_arguments)]
async fn write_batch(
    pool: &PgPool,
    ok_keys: &[ItemKey],
    permission_rows: &[PermissionRow],
    grant_rows: &[GrantRow],
    ok_updates: &[(String, String, DateTime<Utc>)],
    err_updates: &[(String, String, DateTime<Utc>, DateTime<Utc>, String)],
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    if !ok_keys.is_empty() {
        for chunk in ok_keys.chunks(BULK_PAGE_SIZE) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "DELETE FROM msgraph_drive_item_permission_grants g USING (",
            );
            qb.push_values(chunk, |mut b, (drive_id, item_id)| {
                b.push_bind(drive_id).push_bind(item_id);
            });
            qb.push(
                ") AS v(drive_id, item_id) WHERE g.drive_id = v.drive_id AND g.item_id = v.item_id",
            );
            qb.build().execute(&mut *tx).await?;

            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("DELETE FROM msgraph_drive_item_permissions p USING (");
            qb.push_values(chunk, |mut b, (drive_id, item_id)| {
                b.push_bind(drive_id).push_bind(item_id);
            });
            qb.push(
                ") AS v(drive_id, item_id) WHERE p.drive_id = v.drive_id AND p.item_id = v.item_id",
            );
            qb.build().execute(&mut *tx).await?;
        }

        for chunk in permission_rows.chunks(BULK_PAGE_SIZE) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO msgraph_drive_item_permissions \
                 (drive_id, item_id, permission_id, source, roles, link_type, link_scope, link_web_url, \
                  link_prevents_download, link_expiration_dt, inherited_from_id, synced_at, deleted_at, raw_json) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(&row.drive_id)
                    .push_bind(&row.item_id)
                    .push_bind(&row.permission_id)
                    .push_bind(row.source)
                    .push_bind(&row.roles)
                    .push_bind(&row.link_type)
                    .push_bind(&row.link_scope)
                    .push_bind(&row.link_web_url)
                    .push_bind(row.link_prevents_download)
                    .push_bind(row.link_expiration_dt)
                    .push_bind(&row.inherited_from_id)
                    .push_bind(row.synced_at)
                    .push_bind(None::<DateTime<Utc>>)
                    .push_bind(&row.raw_json);
            });
            qb.push(
                " ON CONFLICT (drive_id, item_id, permission_id) DO UPDATE SET \
                 source = EXCLUDED.source, \
                 roles = EXCLUDED.roles, \
                 link_type = EXCLUDED.link_type, \
                 link_scope = EXCLUDED.link_scope, \
                 link_web_url = EXCLUDED.link_web_url, \
                 link_prevents_download = EXCLUDED.link_prevents_download, \
                 link_expiration_dt = EXCLUDED.link_expiration_dt, \
                 inherited_from_id = EXCLUDED.inherited_from_id, \
                 synced_at = EXCLUDED.synced_at, \
                 deleted_at = NULL, \
                 raw_json = EXCLUDED.raw_json",
            );
            qb.build().execute(&mut *tx).await?;
        }

        for chunk in grant_rows.chunks(BULK_PAGE_SIZE) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO msgraph_drive_item_permission_grants \
                 (drive_id, item_id, permission_id, principal_type, principal_id, principal_display_name, \
                  principal_email, principal_user_principal_name, synced_at, deleted_at, raw_json) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(&row.drive_id)
                    .push_bind(&row.item_id)
                    .push_bind(&row.permission_id)
                    .push_bind(&row.grant.principal_type)
                    .push_bind(&row.grant.principal_id)
                    .push_bind(&row.grant.display_name)
                    .push_bind(&row.grant.email)
                    .push_bind(&row.grant.user_principal_name)
                    .push_bind(row.synced_at)
                    .push_bind(None::<DateTime<Utc>>)
                    .push_bind(&row.grant.raw);
            });
            qb.push(
                " ON CONFLICT (drive_id, item_id, permission_id, principal_type, principal_id) DO UPDATE SET \
                 principal_display_name = EXCLUDED.principal_display_name, \
                 principal_email = EXCLUDED.principal_email, \
                 principal_user_principal_name = EXCLUDED.principal_user_principal_name, \
                 synced_at = EXCLUDED.synced_at, \
                 deleted_at = NULL, \
                 raw_json = EXCLUDED.raw_json",
            );
            qb.build().execute(&mut *tx).await?;
        }

        for chunk in ok_updates.chunks(BULK_PAGE_SIZE) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("UPDATE msgraph_drive_items d SET \
                 permissions_last_synced_at = v.synced_at, \
                 permissions_last_error_at = NULL, \
                 permissions_last_error = NULL \
                 FROM (");
            qb.push_values(chunk, |mut b, (drive_id, item_id, synced_at)| {
                b.push_bind(drive_id).push_bind(item_id).push_bind(synced_at);
            });
            qb.push(
                ") AS v(drive_id, item_id, synced_at) \
                 WHERE d.drive_id = v.drive_id AND d.id = v.item_id",
            );
            qb.build().execute(&mut *tx).await?;
        }
    }

    if !err_updates.is_empty() {
        write_error_updates(&mut tx, err_updates).await?;
    }

    tx.commit().await
}

async fn write_error_updates(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    err_updates: &[(String, String, DateTime<Utc>, DateTime<Utc>, String)],
) -> sqlx::Result<()> {
    for chunk in err_updates.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE msgraph_drive_items d SET \
             permissions_last_synced_at = v.synced_at, \
             permissions_last_error_at = v.error_at, \
             permissions_last_error = v.error \
             FROM (");
        qb.push_values(chunk, |mut b, (drive_id, item_id, synced_at, error_at, error)| {
            b.push_bind(drive_id)
                .push_bind(item_id)
                .push_bind(synced_at)
                .push_bind(error_at)
                .push_bind(error);
        });
        qb.push(
            ") AS v(drive_id, item_id, synced_at, error_at, error) \
             WHERE d.drive_id = v.drive_id AND d.id = v.item_id",
        );
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn mark_batch_error(
    pool: &PgPool,
    err_updates: &[(String, String, DateTime<Utc>, DateTime<Utc>, String)],
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    write_error_updates(&mut tx, err_updates).await?;
    tx.commit().await
}

pub async fn scan_permissions(
    ctx: &StageContext<'_>,
    permissions_batch_size: i64,
    stale_after_hours: i64,
) -> Result<PermissionsCounters> {
    let stale_after_hours = stale_after_hours.max(0);
    let cutoff = Utc::now() - Duration::hours(stale_after_hours);
    let synced_at = Utc::now();

    let mut counters = PermissionsCounters {
        stale_after_hours,
        ..Default::default()
    };

    loop {
        let rows: Vec<ItemKey> = sqlx::query_as(
            r#"
            SELECT drive_id, id
            FROM msgraph_drive_items
            WHERE deleted_at IS NULL
              AND is_folder = false
              AND (permissions_last_synced_at IS NULL OR permissions_last_synced_at < $1)
            ORDER BY permissions_last_synced_at NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(permissions_batch_size)
        .fetch_all(ctx.pool)
        .await?;

        if rows.is_empty() {
            break;
        }

        counters.batches += 1;
        let mut keys = rows;
        keys.sort();
        counters.items_processed += keys.len() as u64;

        let results: HashMap<ItemKey, Result<Vec<Value>, String>> =
            stream::iter(keys.iter().cloned())
                .map(|(drive_id, item_id)| {
                    let client = ctx.client;
                    async move {
                        let fetched = fetch_permissions(client, &drive_id, &item_id)
                            .await
                            .map_err(|e| e.to_string());
                        ((drive_id, item_id), fetched)
                    }
                })
                .buffer_unordered(ctx.max_concurrency)
                .collect()
                .await;

        let mut ok_keys: Vec<ItemKey> = Vec::new();
        let mut ok_updates: Vec<(String, String, DateTime<Utc>)> = Vec::new();
        let mut err_updates: Vec<(String, String, DateTime<Utc>, DateTime<Utc>, String)> =
            Vec::new();
        let mut permission_rows: Vec<PermissionRow> = Vec::new();
        let mut grant_rows: Vec<GrantRow> = Vec::new();
        let mut sample_errors: Vec<Value> = Vec::new();

        for key in &keys {
            let (drive_id, item_id) = key;
            match results.get(key) {
                Some(Ok(perms)) => {
                    ok_keys.push(key.clone());
                    ok_updates.push((drive_id.clone(), item_id.clone(), synced_at));
                    for perm in perms {
                        let Some(perm_id) =
                            perm.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())
                        else {
                            continue;
                        };
                        let link = perm.get("link");
                        let inherited_from_id = perm
                            .get("inheritedFrom")
                            .and_then(|i| i.get("id"))
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        let source = if inherited_from_id.is_some() {
                            "inherited"
                        } else {
                            "direct"
                        };
                        for grant in extract_grants(perm) {
                            grant_rows.push(GrantRow {
                                drive_id: drive_id.clone(),
                                item_id: item_id.clone(),
                                permission_id: perm_id.to_string(),
                                grant,
                                synced_at,
                            });
                        }
                        permission_rows.push(PermissionRow {
                            drive_id: drive_id.clone(),
                            item_id: item_id.clone(),
                            permission_id: perm_id.to_string(),
                            source,
                            roles: perm.get("roles").and_then(Value::as_array).map(|list| {
                                list.iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            }),
                            link_type: link
                                .and_then(|l| l.get("type"))
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            link_scope: link
                                .and_then(|l| l.get("scope"))
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            link_web_url: link
                                .and_then(|l| l.get("webUrl"))
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            link_prevents_download: link
                                .and_then(|l| l.get("preventsDownload"))
                                .and_then(Value::as_bool),
                            link_expiration_dt: super::parse_graph_datetime(
                                link.and_then(|l| l.get("expirationDateTime")),
                            ),
                            inherited_from_id,
                            synced_at,
                            raw_json: perm.clone(),
                        });
                    }
                }
                Some(Err(error)) => {
                    let error = truncate(error, ERROR_MAX_CHARS);
                    err_updates.push((
                        drive_id.clone(),
                        item_id.clone(),
                        synced_at,
                        synced_at,
                        error.clone(),
                    ));
                    if sample_errors.len() < 5 {
                        sample_errors.push(json!({
                            "drive_id": drive_id,
                            "item_id": item_id,
                            "error": error,
                        }));
                    }
                }
                None => {}
            }
        }

        let (mut permission_rows, dropped) = dedupe_keep_last(permission_rows, |r| {
            (r.drive_id.clone(), r.item_id.clone(), r.permission_id.clone())
        });
        counters.dropped_permission_duplicates += dropped as u64;
        permission_rows.sort_by(|a, b| {
            (&a.drive_id, &a.item_id, &a.permission_id).cmp(&(
                &b.drive_id,
                &b.item_id,
                &b.permission_id,
            ))
        });

        let (mut grant_rows, dropped) = dedupe_keep_last(grant_rows, |r| {
            (
                r.drive_id.clone(),
                r.item_id.clone(),
                r.permission_id.clone(),
                r.grant.principal_type.clone(),
                r.grant.principal_id.clone(),
            )
        });
        counters.dropped_grant_duplicates += dropped as u64;
        grant_rows.sort_by(|a, b| {
            (
                &a.drive_id,
                &a.item_id,
                &a.permission_id,
                &a.grant.principal_type,
                &a.grant.principal_id,
            )
                .cmp(&(
                    &b.drive_id,
                    &b.item_id,
                    &b.permission_id,
                    &b.grant.principal_type,
                    &b.grant.principal_id,
                ))
        });

        let op_name = format!("permissions_batch:{}", counters.batches);
        let outcome = execute_with_write_retry(
            ctx.pool,
            &ctx.retry,
            ctx.run_id,
            &op_name,
            "permissions_db_write_retry",
            || {
                write_batch(
                    ctx.pool,
                    &ok_keys,
                    &permission_rows,
                    &grant_rows,
                    &ok_updates,
                    &err_updates,
                )
            },
        )
        .await?;
        counters.db_retry_attempts += outcome.retries as u64;

        if outcome.committed {
            counters.items_ok += ok_updates.len() as u64;
            counters.items_err += err_updates.len() as u64;
            if !err_updates.is_empty() {
                log_job_run_log(
                    ctx.pool,
                    ctx.run_id,
                    "WARN",
                    "permissions_batch_errors",
                    json!({
                        "batch": counters.batches,
                        "errors": err_updates.len(),
                        "sample": sample_errors,
                    }),
                )
                .await?;
            }
            continue;
        }

        counters.db_retry_exhausted_batches += 1;
        let exhausted_error = format!(
            "db_write_retry_exhausted:{}",
            outcome.sqlstate.as_deref().unwrap_or("unknown")
        );
        log_job_run_log(
            ctx.pool,
            ctx.run_id,
            "WARN",
            "permissions_db_write_retry_exhausted",
            json!({
                "batch": counters.batches,
                "items": keys.len(),
                "sqlstate": outcome.sqlstate,
                "error": outcome.error,
            }),
        )
        .await?;

        let fallback_err_updates: Vec<(String, String, DateTime<Utc>, DateTime<Utc>, String)> =
            keys.iter()
                .map(|(drive_id, item_id)| {
                    (
                        drive_id.clone(),
                        item_id.clone(),
                        synced_at,
                        synced_at,
                        exhausted_error.clone(),
                    )
                })
                .collect();

        let mark_op = format!("permissions_batch_mark_error:{}", counters.batches);
        let mark_outcome = execute_with_write_retry(
            ctx.pool,
            &ctx.retry,
            ctx.run_id,
            &mark_op,
            "permissions_db_write_retry",
            || mark_batch_error(ctx.pool, &fallback_err_updates),
        )
        .await?;
        counters.db_retry_attempts += mark_outcome.retries as u64;

        if mark_outcome.committed {
            counters.items_err += fallback_err_updates.len() as u64;
        } else {
            log_job_run_log(
                ctx.pool,
                ctx.run_id,
                "WARN",
                "permissions_db_write_retry_exhausted",
                json!({
                    "batch": counters.batches,
                    "operation": "mark_batch_error",
                    "sqlstate": mark_outcome.sqlstate,
                    "error": mark_outcome.error,
                }),
            )
            .await?;
        }

        if !err_updates.is_empty() {
            log_job_run_log(
                ctx.pool,
                ctx.run_id,
                "WARN",
                "permissions_batch_errors",
                json!({
                    "batch": counters.batches,
                    "errors": err_updates.len(),
                    "sample": sample_errors,
                    "batch_write_exhausted": true,
                }),
            )
            .await?;
        }
    }

    log_job_run_log(
        ctx.pool,
        ctx.run_id,
        "INFO",
        "permissions_scan_completed",
        json!({
            "synced_at": synced_at,
            "cutoff": cutoff,
            "batches": counters.batches,
            "items_processed": counters.items_processed,
            "items_ok": counters.items_ok,
            "items_err": counters.items_err,
            "dropped_permission_duplicates": counters.dropped_permission_duplicates,
            "dropped_grant_duplicates": counters.dropped_grant_duplicates,
            "db_retry_attempts": counters.db_retry_attempts,
            "db_retry_exhausted_batches": counters.db_retry_exhausted_batches,
        }),
    )
    .await?;

    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_identities_win_over_v1() {
        let permission = json!({
            "grantedToV2": {"user": {"id": "u-new", "displayName": "New"}},
            "grantedTo": {"user": {"id": "u-old", "displayName": "Old"}}
        });
        let grants = extract_grants(&permission);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].principal_id, "u-new");
    }

    #[test]
    fn v1_identities_used_when_no_v2_present() {
        let permission = json!({
            "grantedTo": {"user": {"id": "u1", "email": "a@b.c"}},
            "grantedToIdentities": [
                {"group": {"id": "g1", "displayName": "Team"}}
            ]
        });
        let grants = extract_grants(&permission);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].principal_type, "user");
        assert_eq!(grants[1].principal_type, "group");
        assert_eq!(grants[1].principal_id, "g1");
    }

    #[test]
    fn link_permission_synthesizes_link_grant() {
        let permission = json!({
            "link": {"type": "view", "scope": "anonymous", "webUrl": "https://x"}
        });
        let grants = extract_grants(&permission);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].principal_type, "link");
        assert_eq!(grants[0].principal_id, "link");
        assert_eq!(grants[0].display_name.as_deref(), Some("view"));
        assert_eq!(grants[0].raw.get("scope").unwrap(), "anonymous");
    }

    #[test]
    fn empty_link_object_is_ignored() {
        let permission = json!({"link": {}});
        assert!(extract_grants(&permission).is_empty());
    }

    #[test]
    fn identities_without_ids_are_dropped() {
        let permission = json!({
            "grantedToV2": {"user": {"displayName": "No Id"}}
        });
        assert!(extract_grants(&permission).is_empty());
    }

    #[test]
    fn site_principals_carry_their_kind() {
        let permission = json!({
            "grantedToV2": {
                "siteGroup": {"id": "5", "displayName": "Site Members"},
                "siteUser": {"id": "9", "displayName": "Alice"}
            }
        });
        let grants = extract_grants(&permission);
        let kinds: Vec<&str> = grants.iter().map(|g| g.principal_type.as_str()).collect();
        assert_eq!(kinds, vec!["siteGroup", "siteUser"]);
    }
}
