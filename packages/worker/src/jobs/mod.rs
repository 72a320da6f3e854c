//! Job bodies, dispatched by `job_type`.

pub mod graph_ingest;
pub mod mv_refresh;

use anyhow::{bail, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::Actor;
use crate::config::Config;
use crate::kernel::graph::GraphClient;

pub const JOB_TYPE_GRAPH_INGEST: &str = "graph_ingest";
pub const JOB_TYPE_MV_REFRESH: &str = "mv_refresh";

/// Run one job body to completion. Errors mean a failed run; they never
/// crash the caller's loop.
pub async fn execute_job(
    pool: &PgPool,
    config: &Config,
    client: &GraphClient,
    job_type: &str,
    job_config: &Value,
    run_id: Uuid,
    job_id: Uuid,
    actor: Option<&Actor>,
) -> Result<()> {
    match job_type {
        JOB_TYPE_GRAPH_INGEST => {
            graph_ingest::run_graph_ingest(pool, config, client, job_config, run_id, job_id, actor)
                .await
        }
        JOB_TYPE_MV_REFRESH => {
            mv_refresh::run_mv_refresh(pool, config, job_config, run_id, job_id, actor).await?;
            Ok(())
        }
        other => bail!("unknown_job_type:{other}"),
    }
}
