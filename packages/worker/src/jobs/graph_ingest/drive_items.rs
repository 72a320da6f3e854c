//! Drive-items stage: per-drive delta walk with tombstone cascade.
//!
//! Removed items delete their permissions and grants in the same retried
//! transaction as the tombstone upsert. If that write exhausts its retries
//! the drive's delta cursor is left untouched so the tombstones are
//! replayed on the next pass.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::batch::dedupe_keep_last;
use super::identity::{resolve_identity, UserMaps};
use super::{delta, parse_graph_datetime, str_value, StageContext};
use crate::common::log_job_run_log;
use crate::kernel::db::{execute_with_write_retry, BULK_PAGE_SIZE};
use crate::kernel::graph::GraphError;

const ITEM_SELECT: &str = "id,name,parentReference,webUrl,size,createdDateTime,lastModifiedDateTime,createdBy,lastModifiedBy,file,folder,fileSystemInfo,shared,remoteItem,sharepointIds,deleted";

#[derive(Debug, Default, Serialize)]
pub struct DriveItemsCounters {
    pub drives_processed: u64,
    pub drives_skipped_error: u64,
    pub drives_delta_resets: u64,
    pub items_seen: u64,
    pub items_removed_seen: u64,
    pub upserted_active: u64,
    pub upserted_removed: u64,
    pub dropped_active_duplicates: u64,
    pub dropped_removed_duplicates: u64,
}

struct ItemRow {
    drive_id: String,
    id: String,
    name: Option<String>,
    web_url: Option<String>,
    parent_id: Option<String>,
    path: Option<String>,
    normalized_path: Option<String>,
    path_level: Option<i32>,
    is_folder: bool,
    child_count: Option<i64>,
    size: Option<i64>,
    mime_type: Option<String>,
    file_hash_sha1: Option<String>,
    created_dt: Option<DateTime<Utc>>,
    modified_dt: Option<DateTime<Utc>>,
    created_by_user_id: Option<String>,
    created_by_display_name: Option<String>,
    created_by_email: Option<String>,
    last_modified_by_user_id: Option<String>,
    last_modified_by_display_name: Option<String>,
    last_modified_by_email: Option<String>,
    is_shared: bool,
    sp_site_id: Option<String>,
    sp_list_id: Option<String>,
    sp_list_item_id: Option<String>,
    sp_list_item_unique_id: Option<String>,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

struct RemovedRow {
    drive_id: String,
    id: String,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

/// Full path of the item: parent path (after the `:` of the drive-relative
/// form) joined with the item name.
pub(crate) fn item_path(item: &Value) -> Option<String> {
    let name = item.get("name").and_then(Value::as_str)?;
    if name.is_empty() {
        return None;
    }
    let parent_path = item
        .get("parentReference")
        .and_then(|p| p.get("path"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let parent_path = match parent_path.split_once(':') {
        Some((_, rest)) => rest,
        None => parent_path,
    }
    .trim();
    if parent_path.is_empty() {
        return Some(name.to_string());
    }
    if parent_path.ends_with('/') {
        Some(format!("{parent_path}{name}"))
    } else {
        Some(format!("{parent_path}/{name}"))
    }
}

/// Depth of a drive-relative path: number of segments after the `:`.
pub(crate) fn compute_path_level(normalized_path: Option<&str>) -> Option<i32> {
    let path = normalized_path?;
    let path = match path.split_once(':') {
        Some((_, rest)) => rest,
        None => path,
    }
    .trim();
    if path.is_empty() {
        return Some(0);
    }
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return Some(0);
    }
    Some(path.split('/').filter(|seg| !seg.is_empty()).count() as i32)
}

fn file_hash_sha1(item: &Value) -> Option<String> {
    item.get("file")
        .and_then(|f| f.get("hashes"))
        .and_then(|h| h.get("sha1Hash"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn build_item_row(
    drive_id: &str,
    id: String,
    item: &Value,
    synced_at: DateTime<Utc>,
    users: &UserMaps,
) -> ItemRow {
    let parent_ref = item.get("parentReference");
    let normalized_path = parent_ref
        .and_then(|p| p.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let created_by = resolve_identity(item.get("createdBy"), users);
    let last_modified_by = resolve_identity(item.get("lastModifiedBy"), users);
    let sp_ids = item.get("sharepointIds");
    let sp_str = |key: &str| {
        sp_ids
            .and_then(|s| s.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    ItemRow {
        drive_id: drive_id.to_string(),
        name: str_value(item, "name"),
        web_url: str_value(item, "webUrl"),
        parent_id: parent_ref
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        path: item_path(item),
        path_level: compute_path_level(normalized_path.as_deref()),
        normalized_path,
        is_folder: item.get("folder").map(|v| !v.is_null()).unwrap_or(false),
        child_count: item
            .get("folder")
            .and_then(|f| f.get("childCount"))
            .and_then(Value::as_i64),
        size: item.get("size").and_then(Value::as_i64),
        mime_type: item
            .get("file")
            .and_then(|f| f.get("mimeType"))
            .and_then(Value::as_str)
            .map(str::to_string),
        file_hash_sha1: file_hash_sha1(item),
        created_dt: parse_graph_datetime(item.get("createdDateTime")),
        modified_dt: parse_graph_datetime(item.get("lastModifiedDateTime")),
        created_by_user_id: created_by.user_fk,
        created_by_display_name: created_by.display_name,
        created_by_email: created_by.email,
        last_modified_by_user_id: last_modified_by.user_fk,
        last_modified_by_display_name: last_modified_by.display_name,
        last_modified_by_email: last_modified_by.email,
        is_shared: item.get("shared").map(|v| !v.is_null()).unwrap_or(false),
        sp_site_id: sp_str("siteId"),
        sp_list_id: sp_str("listId"),
        sp_list_item_id: sp_str("listItemId"),
        sp_list_item_unique_id: sp_str("listItemUniqueId"),
        synced_at,
        raw_json: item.clone(),
        id,
    }
}

async fn flush_active(pool: &PgPool, rows: &[ItemRow]) -> sqlx::Result<()> {
    for chunk in rows.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_drive_items \
             (drive_id, id, name, web_url, parent_id, path, normalized_path, path_level, is_folder, child_count, \
              size, mime_type, file_hash_sha1, created_dt, modified_dt, created_by_user_id, created_by_display_name, \
              created_by_email, last_modified_by_user_id, last_modified_by_display_name, last_modified_by_email, \
              is_shared, sp_site_id, sp_list_id, sp_list_item_id, sp_list_item_unique_id, \
              permissions_last_synced_at, permissions_last_error_at, permissions_last_error, \
              synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.drive_id)
                .push_bind(&row.id)
                .push_bind(&row.name)
                .push_bind(&row.web_url)
                .push_bind(&row.parent_id)
                .push_bind(&row.path)
                .push_bind(&row.normalized_path)
                .push_bind(row.path_level)
                .push_bind(row.is_folder)
                .push_bind(row.child_count)
                .push_bind(row.size)
                .push_bind(&row.mime_type)
                .push_bind(&row.file_hash_sha1)
                .push_bind(row.created_dt)
                .push_bind(row.modified_dt)
                .push_bind(&row.created_by_user_id)
                .push_bind(&row.created_by_display_name)
                .push_bind(&row.created_by_email)
                .push_bind(&row.last_modified_by_user_id)
                .push_bind(&row.last_modified_by_display_name)
                .push_bind(&row.last_modified_by_email)
                .push_bind(row.is_shared)
                .push_bind(&row.sp_site_id)
                .push_bind(&row.sp_list_id)
                .push_bind(&row.sp_list_item_id)
                .push_bind(&row.sp_list_item_unique_id)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(None::<String>)
                .push_bind(row.synced_at)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (drive_id, id) DO UPDATE SET \
             name = EXCLUDED.name, \
             web_url = EXCLUDED.web_url, \
             parent_id = EXCLUDED.parent_id, \
             path = EXCLUDED.path, \
             normalized_path = EXCLUDED.normalized_path, \
             path_level = EXCLUDED.path_level, \
             is_folder = EXCLUDED.is_folder, \
             child_count = EXCLUDED.child_count, \
             size = EXCLUDED.size, \
             mime_type = EXCLUDED.mime_type, \
             file_hash_sha1 = EXCLUDED.file_hash_sha1, \
             created_dt = EXCLUDED.created_dt, \
             modified_dt = EXCLUDED.modified_dt, \
             created_by_user_id = EXCLUDED.created_by_user_id, \
             created_by_display_name = EXCLUDED.created_by_display_name, \
             created_by_email = EXCLUDED.created_by_email, \
             last_modified_by_user_id = EXCLUDED.last_modified_by_user_id, \
             last_modified_by_display_name = EXCLUDED.last_modified_by_display_name, \
             last_modified_by_email = EXCLUDED.last_modified_by_email, \
             is_shared = EXCLUDED.is_shared, \
             sp_site_id = EXCLUDED.sp_site_id, \
             sp_list_id = EXCLUDED.sp_list_id, \
             sp_list_item_id = EXCLUDED.sp_list_item_id, \
             sp_list_item_unique_id = EXCLUDED.sp_list_item_unique_id, \
             permissions_last_synced_at = NULL, \
             permissions_last_error_at = NULL, \
             permissions_last_error = NULL, \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = NULL, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(pool).await?;
    }
    Ok(())
}

/// Tombstone upsert plus permission/grant cascade in one transaction.
async fn write_removed_batch(
    pool: &PgPool,
    rows: &[RemovedRow],
    keys: &[(String, String)],
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    for chunk in rows.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_drive_items (drive_id, id, synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.drive_id)
                .push_bind(&row.id)
                .push_bind(row.synced_at)
                .push_bind(row.synced_at)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (drive_id, id) DO UPDATE SET \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = EXCLUDED.deleted_at, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in keys.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "DELETE FROM msgraph_drive_item_permission_grants g USING (",
        );
        qb.push_values(chunk, |mut b, (drive_id, item_id)| {
            b.push_bind(drive_id).push_bind(item_id);
        });
        qb.push(") AS v(drive_id, item_id) WHERE g.drive_id = v.drive_id AND g.item_id = v.item_id");
        qb.build().execute(&mut *tx).await?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("DELETE FROM msgraph_drive_item_permissions p USING (");
        qb.push_values(chunk, |mut b, (drive_id, item_id)| {
            b.push_bind(drive_id).push_bind(item_id);
        });
        qb.push(") AS v(drive_id, item_id) WHERE p.drive_id = v.drive_id AND p.item_id = v.item_id");
        qb.build().execute(&mut *tx).await?;
    }

    tx.commit().await
}

struct DrivePassOutcome {
    delta_link_new: Option<String>,
    write_incomplete: bool,
}

async fn drive_delta_pass(
    ctx: &StageContext<'_>,
    drive_id: &str,
    start_url: &str,
    synced_at: DateTime<Utc>,
    users: &UserMaps,
    counters: &mut DriveItemsCounters,
) -> Result<DrivePassOutcome> {
    let mut next_url = Some(start_url.to_string());
    let mut delta_link_new: Option<String> = None;
    let mut active_batch: Vec<ItemRow> = Vec::new();
    let mut removed_batch: Vec<RemovedRow> = Vec::new();
    let mut write_incomplete = false;

    while let Some(url) = next_url.take() {
        let data = ctx.client.get_json(&url).await?;
        for item in data.get("value").and_then(Value::as_array).into_iter().flatten() {
            let Some(id) = item.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            counters.items_seen += 1;
            let removed = item.get("@removed").is_some() || item.get("deleted").is_some();
            if removed {
                counters.items_removed_seen += 1;
                removed_batch.push(RemovedRow {
                    drive_id: drive_id.to_string(),
                    id,
                    synced_at,
                    raw_json: item.clone(),
                });
            } else {
                active_batch.push(build_item_row(drive_id, id, item, synced_at, users));
            }

            if active_batch.len() >= ctx.flush_every {
                let (deduped, dropped) = dedupe_keep_last(std::mem::take(&mut active_batch), |r| {
                    (r.drive_id.clone(), r.id.clone())
                });
                flush_active(ctx.pool, &deduped).await?;
                counters.upserted_active += deduped.len() as u64;
                counters.dropped_active_duplicates += dropped as u64;
            }

            if removed_batch.len() >= ctx.flush_every {
                let flushed = flush_removed_with_retry(
                    ctx,
                    drive_id,
                    std::mem::take(&mut removed_batch),
                    counters,
                )
                .await?;
                if !flushed {
                    write_incomplete = true;
                }
            }
        }

        next_url = data
            .get("@odata.nextLink")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(link) = data.get("@odata.deltaLink").and_then(Value::as_str) {
            delta_link_new = Some(link.to_string());
        }
    }

    if !active_batch.is_empty() {
        let (deduped, dropped) =
            dedupe_keep_last(active_batch, |r| (r.drive_id.clone(), r.id.clone()));
        flush_active(ctx.pool, &deduped).await?;
        counters.upserted_active += deduped.len() as u64;
        counters.dropped_active_duplicates += dropped as u64;
    }

    if !removed_batch.is_empty() {
        let flushed = flush_removed_with_retry(ctx, drive_id, removed_batch, counters).await?;
        if !flushed {
            write_incomplete = true;
        }
    }

    Ok(DrivePassOutcome {
        delta_link_new,
        write_incomplete,
    })
}

/// Returns false when the batch exhausted its retries (and the caller must
/// withhold the cursor).
async fn flush_removed_with_retry(
    ctx: &StageContext<'_>,
    drive_id: &str,
    batch: Vec<RemovedRow>,
    counters: &mut DriveItemsCounters,
) -> Result<bool> {
    let (mut deduped, dropped) =
        dedupe_keep_last(batch, |r| (r.drive_id.clone(), r.id.clone()));
    deduped.sort_by(|a, b| (&a.drive_id, &a.id).cmp(&(&b.drive_id, &b.id)));
    let keys: Vec<(String, String)> = deduped
        .iter()
        .map(|r| (r.drive_id.clone(), r.id.clone()))
        .collect();

    let op_name = format!("drive_items_removed_cleanup:{drive_id}");
    let outcome = execute_with_write_retry(
        ctx.pool,
        &ctx.retry,
        ctx.run_id,
        &op_name,
        "drive_items_db_write_retry",
        || write_removed_batch(ctx.pool, &deduped, &keys),
    )
    .await?;

    if outcome.committed {
        counters.upserted_removed += deduped.len() as u64;
        counters.dropped_removed_duplicates += dropped as u64;
        Ok(true)
    } else {
        log_job_run_log(
            ctx.pool,
            ctx.run_id,
            "WARN",
            "drive_items_db_write_retry",
            json!({
                "operation": op_name,
                "exhausted": true,
                "sqlstate": outcome.sqlstate,
                "error": outcome.error,
            }),
        )
        .await?;
        Ok(false)
    }
}

pub async fn ingest_drive_items(ctx: &StageContext<'_>) -> Result<DriveItemsCounters> {
    let synced_at = Utc::now();
    let mut counters = DriveItemsCounters::default();

    let drive_ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM msgraph_drives WHERE deleted_at IS NULL")
            .fetch_all(ctx.pool)
            .await?;
    let users = UserMaps::load(ctx.pool).await?;
    let page_size = ctx.page_size;

    for drive_id in drive_ids {
        counters.drives_processed += 1;
        let base_url =
            format!("/drives/{drive_id}/root/delta?$top={page_size}&$select={ITEM_SELECT}");
        let mut delta_link = delta::get_delta_link(ctx.pool, "drive_items", &drive_id).await?;
        let mut start_url = delta_link.clone().unwrap_or_else(|| base_url.clone());

        for attempt in 0..2u8 {
            match drive_delta_pass(ctx, &drive_id, &start_url, synced_at, &users, &mut counters)
                .await
            {
                Ok(outcome) => {
                    match outcome.delta_link_new {
                        Some(link) if !outcome.write_incomplete => {
                            delta::set_delta_link(ctx.pool, "drive_items", &drive_id, &link)
                                .await?;
                        }
                        Some(_) => {
                            log_job_run_log(
                                ctx.pool,
                                ctx.run_id,
                                "WARN",
                                "drive_items_db_write_retry",
                                json!({
                                    "operation": format!("drive_items_removed_cleanup:{drive_id}"),
                                    "delta_link_advanced": false,
                                    "reason": "cleanup_write_retry_exhausted",
                                }),
                            )
                            .await?;
                        }
                        None => {}
                    }
                    break;
                }
                Err(err) => match err.downcast_ref::<GraphError>() {
                    Some(GraphError::Status { status: 410, .. })
                        if attempt == 0 && delta_link.is_some() =>
                    {
                        counters.drives_delta_resets += 1;
                        log_job_run_log(
                            ctx.pool,
                            ctx.run_id,
                            "WARN",
                            "drive_items_delta_expired_reset",
                            json!({
                                "drive_id": drive_id,
                                "status_code": 410,
                                "error": err.to_string(),
                            }),
                        )
                        .await?;
                        delta::clear_delta_link(ctx.pool, "drive_items", &drive_id).await?;
                        delta_link = None;
                        start_url = base_url.clone();
                        continue;
                    }
                    Some(GraphError::Status { status, .. }) => {
                        counters.drives_skipped_error += 1;
                        log_job_run_log(
                            ctx.pool,
                            ctx.run_id,
                            "WARN",
                            "drive_items_skipped",
                            json!({
                                "drive_id": drive_id,
                                "status_code": status,
                                "error": err.to_string(),
                            }),
                        )
                        .await?;
                        break;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    log_job_run_log(
        ctx.pool,
        ctx.run_id,
        "INFO",
        "drive_items_ingested",
        json!({
            "synced_at": synced_at,
            "drives_processed": counters.drives_processed,
            "drives_skipped_error": counters.drives_skipped_error,
            "drives_delta_resets": counters.drives_delta_resets,
            "items_seen": counters.items_seen,
            "items_removed_seen": counters.items_removed_seen,
            "upserted_active": counters.upserted_active,
            "upserted_removed": counters.upserted_removed,
            "dropped_active_duplicates": counters.dropped_active_duplicates,
            "dropped_removed_duplicates": counters.dropped_removed_duplicates,
        }),
    )
    .await?;

    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_path_joins_parent_and_name() {
        let item = json!({
            "name": "report.docx",
            "parentReference": {"path": "/drives/d1/root:/Shared Documents/Finance"}
        });
        assert_eq!(
            item_path(&item).as_deref(),
            Some("/Shared Documents/Finance/report.docx")
        );
    }

    #[test]
    fn item_path_without_parent_is_the_name() {
        let item = json!({"name": "root.txt"});
        assert_eq!(item_path(&item).as_deref(), Some("root.txt"));
        assert!(item_path(&json!({})).is_none());
    }

    #[test]
    fn path_level_counts_segments_after_colon() {
        assert_eq!(compute_path_level(Some("/drives/d1/root:")), Some(0));
        assert_eq!(compute_path_level(Some("/drives/d1/root:/a")), Some(1));
        assert_eq!(compute_path_level(Some("/drives/d1/root:/a/b/c")), Some(3));
        assert_eq!(compute_path_level(None), None);
    }

    #[test]
    fn folder_and_file_classification() {
        let folder = json!({
            "id": "i1",
            "name": "docs",
            "folder": {"childCount": 4}
        });
        let row = build_item_row("d1", "i1".into(), &folder, Utc::now(), &UserMaps::from_rows(vec![]));
        assert!(row.is_folder);
        assert_eq!(row.child_count, Some(4));

        let file = json!({
            "id": "i2",
            "name": "a.txt",
            "size": 12,
            "file": {"mimeType": "text/plain", "hashes": {"sha1Hash": "ABC"}},
            "shared": {"scope": "users"}
        });
        let row = build_item_row("d1", "i2".into(), &file, Utc::now(), &UserMaps::from_rows(vec![]));
        assert!(!row.is_folder);
        assert_eq!(row.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(row.file_hash_sha1.as_deref(), Some("ABC"));
        assert!(row.is_shared);
        assert_eq!(row.size, Some(12));
    }

    #[test]
    fn sharepoint_ids_are_lifted() {
        let item = json!({
            "id": "i3",
            "name": "x",
            "sharepointIds": {
                "siteId": "s",
                "listId": "l",
                "listItemId": "7",
                "listItemUniqueId": "u"
            }
        });
        let row = build_item_row("d1", "i3".into(), &item, Utc::now(), &UserMaps::from_rows(vec![]));
        assert_eq!(row.sp_site_id.as_deref(), Some("s"));
        assert_eq!(row.sp_list_item_id.as_deref(), Some("7"));
    }
}
