//! Sites stage: server-side delta with full-list fallback.
//!
//! The delta cursor is durably advanced only after a fully successful delta
//! pass; a failed pass discards uncommitted work and re-reads via the plain
//! list endpoint, without sweeping.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::batch::dedupe_keep_last;
use super::{delta, parse_graph_datetime, StageContext};
use crate::common::log_job_run_log;
use crate::kernel::db::BULK_PAGE_SIZE;
use crate::kernel::graph::GraphError;

const SITE_SELECT: &str =
    "id,name,displayName,webUrl,createdDateTime,siteCollection,sharepointIds,isPersonalSite";

#[derive(Debug, Serialize)]
pub struct SitesCounters {
    pub mode: &'static str,
    pub total_seen: u64,
    pub removed_seen: u64,
    pub upserted_active: u64,
    pub upserted_removed: u64,
    pub dropped_active_duplicates: u64,
    pub dropped_removed_duplicates: u64,
}

impl SitesCounters {
    fn new(mode: &'static str) -> Self {
        Self {
            mode,
            total_seen: 0,
            removed_seen: 0,
            upserted_active: 0,
            upserted_removed: 0,
            dropped_active_duplicates: 0,
            dropped_removed_duplicates: 0,
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct NormalizedSite {
    pub id: String,
    pub name: Option<String>,
    pub web_url: Option<String>,
    pub hostname: Option<String>,
    pub site_collection_id: Option<String>,
    pub created_dt: Option<DateTime<Utc>>,
}

/// Normalize a site record. Hostname and site-collection id come from
/// `siteCollection`/`sharepointIds`, falling back to the composite
/// `host,collection,web` site id.
pub(crate) fn normalize_site(id: String, site: &Value) -> NormalizedSite {
    let site_collection = site.get("siteCollection");
    let sharepoint_ids = site.get("sharepointIds");

    let mut hostname = site_collection
        .and_then(|c| c.get("hostname").or_else(|| c.get("hostName")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let mut site_collection_id = sharepoint_ids
        .and_then(|s| s.get("siteId"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            site_collection
                .and_then(|c| c.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    if id.matches(',').count() >= 2 {
        let mut parts = id.splitn(3, ',');
        let host_part = parts.next().unwrap_or_default();
        let collection_part = parts.next().unwrap_or_default();
        if hostname.is_none() && !host_part.is_empty() {
            hostname = Some(host_part.to_string());
        }
        if site_collection_id.is_none() && !collection_part.is_empty() {
            site_collection_id = Some(collection_part.to_string());
        }
    }

    NormalizedSite {
        name: ["name", "displayName"]
            .iter()
            .find_map(|key| site.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()))
            .map(str::to_string),
        web_url: site.get("webUrl").and_then(Value::as_str).map(str::to_string),
        hostname,
        site_collection_id,
        created_dt: parse_graph_datetime(site.get("createdDateTime")),
        id,
    }
}

struct ActiveSiteRow {
    site: NormalizedSite,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

struct RemovedSiteRow {
    id: String,
    synced_at: DateTime<Utc>,
    raw_json: Value,
}

async fn flush_active(pool: &PgPool, rows: &[ActiveSiteRow]) -> sqlx::Result<()> {
    for chunk in rows.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_sites \
             (id, name, web_url, hostname, site_collection_id, created_dt, synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.site.id)
                .push_bind(&row.site.name)
                .push_bind(&row.site.web_url)
                .push_bind(&row.site.hostname)
                .push_bind(&row.site.site_collection_id)
                .push_bind(row.site.created_dt)
                .push_bind(row.synced_at)
                .push_bind(None::<DateTime<Utc>>)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             name = EXCLUDED.name, \
             web_url = EXCLUDED.web_url, \
             hostname = EXCLUDED.hostname, \
             site_collection_id = EXCLUDED.site_collection_id, \
             created_dt = EXCLUDED.created_dt, \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = NULL, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(pool).await?;
    }
    Ok(())
}

async fn flush_removed(pool: &PgPool, rows: &[RemovedSiteRow]) -> sqlx::Result<()> {
    for chunk in rows.chunks(BULK_PAGE_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgraph_sites (id, synced_at, deleted_at, raw_json) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(row.synced_at)
                .push_bind(row.synced_at)
                .push_bind(&row.raw_json);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             synced_at = EXCLUDED.synced_at, \
             deleted_at = EXCLUDED.deleted_at, \
             raw_json = EXCLUDED.raw_json",
        );
        qb.build().execute(pool).await?;
    }
    Ok(())
}

/// Walk the delta feed from `start_url`. Returns the new delta link on
/// success; committed batches stay committed even if a later page fails.
async fn delta_pass(
    ctx: &StageContext<'_>,
    synced_at: DateTime<Utc>,
    start_url: String,
    counters: &mut SitesCounters,
) -> Result<Option<String>> {
    let mut next_url = Some(start_url);
    let mut new_delta_link: Option<String> = None;
    let mut active_batch: Vec<ActiveSiteRow> = Vec::new();
    let mut removed_batch: Vec<RemovedSiteRow> = Vec::new();

    while let Some(url) = next_url.take() {
        let data = ctx.client.get_json(&url).await?;
        for site in data.get("value").and_then(Value::as_array).into_iter().flatten() {
            let Some(id) = site.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            counters.total_seen += 1;
            if site.get("@removed").is_some() {
                counters.removed_seen += 1;
                removed_batch.push(RemovedSiteRow {
                    id,
                    synced_at,
                    raw_json: site.clone(),
                });
            } else {
                active_batch.push(ActiveSiteRow {
                    site: normalize_site(id, site),
                    synced_at,
                    raw_json: site.clone(),
                });
            }

            if active_batch.len() >= ctx.flush_every {
                let (deduped, dropped) =
                    dedupe_keep_last(std::mem::take(&mut active_batch), |r| r.site.id.clone());
                flush_active(ctx.pool, &deduped).await?;
                counters.upserted_active += deduped.len() as u64;
                counters.dropped_active_duplicates += dropped as u64;
            }
            if removed_batch.len() >= ctx.flush_every {
                let (deduped, dropped) =
                    dedupe_keep_last(std::mem::take(&mut removed_batch), |r| r.id.clone());
                flush_removed(ctx.pool, &deduped).await?;
                counters.upserted_removed += deduped.len() as u64;
                counters.dropped_removed_duplicates += dropped as u64;
            }
        }

        next_url = data
            .get("@odata.nextLink")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(link) = data.get("@odata.deltaLink").and_then(Value::as_str) {
            new_delta_link = Some(link.to_string());
        }
    }

    if !active_batch.is_empty() {
        let (deduped, dropped) = dedupe_keep_last(active_batch, |r| r.site.id.clone());
        flush_active(ctx.pool, &deduped).await?;
        counters.upserted_active += deduped.len() as u64;
        counters.dropped_active_duplicates += dropped as u64;
    }
    if !removed_batch.is_empty() {
        let (deduped, dropped) = dedupe_keep_last(removed_batch, |r| r.id.clone());
        flush_removed(ctx.pool, &deduped).await?;
        counters.upserted_removed += deduped.len() as u64;
        counters.dropped_removed_duplicates += dropped as u64;
    }

    Ok(new_delta_link)
}

/// Full re-read via `/sites?search=*`. No sweep: absent rows keep their
/// previous state rather than being soft-deleted off an unordered listing.
async fn list_pass(
    ctx: &StageContext<'_>,
    synced_at: DateTime<Utc>,
    counters: &mut SitesCounters,
) -> Result<()> {
    let mut batch: Vec<ActiveSiteRow> = Vec::new();
    let mut pages = ctx
        .client
        .paged(&format!("/sites?search=*&$select={SITE_SELECT}&$top=999"));

    while let Some(site) = pages.next().await? {
        let Some(id) = site.get("id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        counters.total_seen += 1;
        batch.push(ActiveSiteRow {
            site: normalize_site(id, &site),
            synced_at,
            raw_json: site,
        });

        if batch.len() >= ctx.flush_every {
            let (deduped, dropped) =
                dedupe_keep_last(std::mem::take(&mut batch), |r| r.site.id.clone());
            flush_active(ctx.pool, &deduped).await?;
            counters.upserted_active += deduped.len() as u64;
            counters.dropped_active_duplicates += dropped as u64;
        }
    }

    if !batch.is_empty() {
        let (deduped, dropped) = dedupe_keep_last(batch, |r| r.site.id.clone());
        flush_active(ctx.pool, &deduped).await?;
        counters.upserted_active += deduped.len() as u64;
        counters.dropped_active_duplicates += dropped as u64;
    }

    Ok(())
}

pub async fn ingest_sites(ctx: &StageContext<'_>) -> Result<SitesCounters> {
    let synced_at = Utc::now();
    let stored_link = delta::get_delta_link(ctx.pool, "sites", "global").await?;
    let start_url = stored_link
        .unwrap_or_else(|| format!("/sites/delta?$select={SITE_SELECT}&$top=999"));

    let mut counters = SitesCounters::new("delta");
    match delta_pass(ctx, synced_at, start_url, &mut counters).await {
        Ok(new_link) => {
            if let Some(link) = new_link {
                delta::set_delta_link(ctx.pool, "sites", "global", &link).await?;
            }
        }
        Err(err) => match err.downcast_ref::<GraphError>() {
            Some(GraphError::Status { status, .. }) => {
                log_job_run_log(
                    ctx.pool,
                    ctx.run_id,
                    "WARN",
                    "sites_delta_failed_fallback_to_list",
                    json!({"status_code": status, "error": err.to_string()}),
                )
                .await?;
                counters = SitesCounters::new("list_fallback");
                list_pass(ctx, synced_at, &mut counters).await?;
            }
            _ => return Err(err),
        },
    }

    log_job_run_log(
        ctx.pool,
        ctx.run_id,
        "INFO",
        "sites_ingested",
        json!({
            "mode": counters.mode,
            "synced_at": synced_at,
            "total_seen": counters.total_seen,
            "removed_seen": counters.removed_seen,
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
    fn normalize_site_prefers_explicit_collection_fields() {
        let site = json!({
            "name": "Team Site",
            "webUrl": "https://contoso.sharepoint.com/sites/team",
            "siteCollection": {"hostname": "contoso.sharepoint.com"},
            "sharepointIds": {"siteId": "col-1"}
        });
        let normalized = normalize_site("site-1".to_string(), &site);
        assert_eq!(normalized.hostname.as_deref(), Some("contoso.sharepoint.com"));
        assert_eq!(normalized.site_collection_id.as_deref(), Some("col-1"));
        assert_eq!(normalized.name.as_deref(), Some("Team Site"));
    }

    #[test]
    fn normalize_site_recovers_parts_from_composite_id() {
        let id = "contoso.sharepoint.com,11111111-aaaa,22222222-bbbb";
        let normalized = normalize_site(id.to_string(), &json!({}));
        assert_eq!(normalized.hostname.as_deref(), Some("contoso.sharepoint.com"));
        assert_eq!(normalized.site_collection_id.as_deref(), Some("11111111-aaaa"));
    }

    #[test]
    fn normalize_site_falls_back_to_display_name() {
        let site = json!({"displayName": "Display Only"});
        let normalized = normalize_site("s".to_string(), &site);
        assert_eq!(normalized.name.as_deref(), Some("Display Only"));
    }
}
