//! Database-coordinated job scheduler.
//!
//! Any number of worker replicas tick against the same tables. Two
//! mechanisms keep runs exclusive: `FOR UPDATE SKIP LOCKED` on the schedule
//! row (no two workers lease the same row) and a per-job advisory lock held
//! on a pinned connection for the whole run (no two runs of one job,
//! scheduled or ad-hoc, overlap).

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::pool::PoolConnection;
use sqlx::{Acquire, PgPool, Postgres};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::common::{log_audit_event, log_job_run_log, Actor};
use crate::config::Config;
use crate::jobs;
use crate::kernel::db;
use crate::kernel::graph::GraphClient;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    status: Arc<Mutex<SchedulerStatus>>,
}

impl SchedulerHandle {
    fn new() -> Self {
        Self {
            status: Arc::new(Mutex::new(SchedulerStatus::default())),
        }
    }

    /// Handle for a process running without a scheduler loop; reports
    /// `running: false` forever.
    pub fn disabled() -> Self {
        Self::new()
    }

    pub fn snapshot(&self) -> SchedulerStatus {
        self.status.lock().expect("scheduler status poisoned").clone()
    }

    fn tick(&self, error: Option<String>) {
        let mut status = self.status.lock().expect("scheduler status poisoned");
        status.running = true;
        status.last_tick = Some(Utc::now());
        status.last_error = error;
    }
}

/// A `jobs` row as leased or fetched for run-now.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub job_type: String,
    pub config: Option<Value>,
}

pub fn spawn_scheduler(
    pool: PgPool,
    config: Arc<Config>,
    client: Arc<GraphClient>,
) -> SchedulerHandle {
    let handle = SchedulerHandle::new();
    let loop_handle = handle.clone();
    let poll = Duration::from_secs(config.scheduler_poll_seconds.max(1));

    tokio::spawn(async move {
        info!("scheduler loop started");
        loop {
            let outcome = run_due_schedule(&pool, &config, &client).await;
            match outcome {
                Ok(()) => loop_handle.tick(None),
                Err(err) => {
                    error!(error = %err, "scheduler tick failed");
                    loop_handle.tick(Some(err.to_string()));
                }
            }
            tokio::time::sleep(poll).await;
        }
    });

    handle
}

pub fn compute_next_run(cron_expr: &str, base: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = croner::Cron::from_str(cron_expr)
        .map_err(|e| anyhow!("invalid_cron_expr:{e}"))?;
    cron.find_next_occurrence(&base, false)
        .map_err(|e| anyhow!("invalid_cron_expr:{e}"))
}

/// One scheduler tick: seed at most one schedule, else lease and run at
/// most one due schedule.
async fn run_due_schedule(pool: &PgPool, config: &Config, client: &GraphClient) -> Result<()> {
    let mut conn = pool.acquire().await?;

    // Seed pass: schedules with no computed next_run_at yet.
    {
        let mut tx = conn.begin().await?;
        let seed: Option<(Uuid, Uuid, String)> = sqlx::query_as(
            r#"
            SELECT schedule_id, job_id, cron_expr
            FROM job_schedules
            WHERE enabled = true
              AND next_run_at IS NULL
            ORDER BY schedule_id
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((schedule_id, job_id, cron_expr)) = seed {
            match compute_next_run(&cron_expr, Utc::now()) {
                Ok(next_run_at) => {
                    sqlx::query("UPDATE job_schedules SET next_run_at = $1 WHERE schedule_id = $2")
                        .bind(next_run_at)
                        .bind(schedule_id)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    info!(%schedule_id, %next_run_at, "new schedule picked up");
                }
                Err(err) => {
                    tx.rollback().await?;
                    disable_invalid_schedule(pool, schedule_id, job_id, &cron_expr, &err.to_string())
                        .await?;
                }
            }
            return Ok(());
        }
        tx.rollback().await?;
    }

    // Lease pass: the earliest due schedule whose job is enabled.
    let mut tx = conn.begin().await?;
    let due: Option<(Uuid, Uuid, String, String, Option<Value>)> = sqlx::query_as(
        r#"
        SELECT js.schedule_id, js.job_id, js.cron_expr, j.job_type, j.config
        FROM job_schedules js
        JOIN jobs j ON j.job_id = js.job_id
        WHERE js.enabled = true
          AND j.enabled = true
          AND js.next_run_at <= now()
        ORDER BY js.next_run_at ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some((schedule_id, job_id, cron_expr, job_type, job_config)) = due else {
        tx.rollback().await?;
        return Ok(());
    };

    let next_run_at = match compute_next_run(&cron_expr, Utc::now()) {
        Ok(next) => next,
        Err(err) => {
            tx.rollback().await?;
            disable_invalid_schedule(pool, schedule_id, job_id, &cron_expr, &err.to_string())
                .await?;
            return Ok(());
        }
    };

    // Session-scoped: taken on the pinned connection, survives the commit.
    let locked = db::try_advisory_lock(&mut tx, &job_id.to_string()).await?;
    if !locked {
        tx.rollback().await?;
        warn!(%job_id, "scheduled job skipped: advisory lock unavailable");
        return Ok(());
    }

    let leased: Result<Uuid> = async {
        let run_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO job_runs (run_id, job_id, started_at, status)
            VALUES (gen_random_uuid(), $1, now(), 'running')
            RETURNING run_id
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE job_schedules SET next_run_at = $1 WHERE schedule_id = $2")
            .bind(next_run_at)
            .bind(schedule_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(run_id)
    }
    .await;
    let run_id = match leased {
        Ok(run_id) => run_id,
        Err(err) => {
            // Do not hand a locked session back to the pool.
            let _ = conn.close().await;
            return Err(err);
        }
    };
    info!(%job_id, job_type = job_type.as_str(), %run_id, "scheduled job triggered");

    let job = JobRecord {
        job_id,
        job_type,
        config: job_config,
    };
    execute_and_finalize(pool, config, client, conn, &job, run_id, None, "schedule").await
}

/// Run-now path: no schedule interaction, same lock and lifecycle.
pub async fn run_job_once(
    pool: &PgPool,
    config: &Config,
    client: &GraphClient,
    job: JobRecord,
    actor: Option<Actor>,
) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let locked = db::try_advisory_lock(&mut conn, &job.job_id.to_string()).await?;
    if !locked {
        warn!(job_id = %job.job_id, "run-now job skipped: advisory lock unavailable");
        return Ok(());
    }

    let run_id: Uuid = match sqlx::query_scalar(
        r#"
        INSERT INTO job_runs (run_id, job_id, started_at, status)
        VALUES (gen_random_uuid(), $1, now(), 'running')
        RETURNING run_id
        "#,
    )
    .bind(job.job_id)
    .fetch_one(&mut *conn)
    .await
    {
        Ok(run_id) => run_id,
        Err(err) => {
            // Do not hand a locked session back to the pool.
            let _ = conn.close().await;
            return Err(err.into());
        }
    };
    info!(job_id = %job.job_id, job_type = job.job_type.as_str(), %run_id, "run-now job triggered");

    execute_and_finalize(pool, config, client, conn, &job, run_id, actor, "run_now").await
}

#[allow(clippy::too_many_arguments)]
async fn execute_and_finalize(
    pool: &PgPool,
    config: &Config,
    client: &GraphClient,
    mut conn: PoolConnection<Postgres>,
    job: &JobRecord,
    run_id: Uuid,
    actor: Option<Actor>,
    trigger: &str,
) -> Result<()> {
    let result =
        execute_and_finalize_on(pool, config, client, &mut conn, job, run_id, actor, trigger).await;
    if result.is_err() {
        // Closing the session releases the advisory lock server-side
        // instead of leaking it into a pooled connection.
        let _ = conn.close().await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn execute_and_finalize_on(
    pool: &PgPool,
    config: &Config,
    client: &GraphClient,
    conn: &mut PoolConnection<Postgres>,
    job: &JobRecord,
    run_id: Uuid,
    actor: Option<Actor>,
    trigger: &str,
) -> Result<()> {
    log_audit_event(
        pool,
        "job_run_started",
        "job_run",
        &run_id.to_string(),
        actor.as_ref(),
        json!({"job_id": job.job_id, "job_type": job.job_type, "trigger": trigger}),
    )
    .await?;

    let job_config = job.config.clone().unwrap_or_else(|| json!({}));
    let (status, error) = match jobs::execute_job(
        pool,
        config,
        client,
        &job.job_type,
        &job_config,
        run_id,
        job.job_id,
        actor.as_ref(),
    )
    .await
    {
        Ok(()) => ("success", None),
        Err(err) => {
            error!(
                job_id = %job.job_id,
                job_type = job.job_type.as_str(),
                error = %err,
                "job execution failed"
            );
            let _ = log_job_run_log(
                pool,
                run_id,
                "ERROR",
                "job_exception",
                json!({
                    "job_id": job.job_id,
                    "job_type": job.job_type,
                    "error": err.to_string(),
                }),
            )
            .await;
            ("failed", Some(err.to_string()))
        }
    };

    sqlx::query(
        "UPDATE job_runs SET finished_at = now(), status = $1, error = $2 WHERE run_id = $3",
    )
    .bind(status)
    .bind(&error)
    .bind(run_id)
    .execute(&mut **conn)
    .await
    .context("job run finalize failed")?;
    db::advisory_unlock(conn, &job.job_id.to_string()).await?;

    if status == "success" {
        info!(job_id = %job.job_id, %run_id, status, "job finished");
    } else {
        error!(
            job_id = %job.job_id,
            %run_id,
            status,
            error = error.as_deref().unwrap_or(""),
            "job finished"
        );
    }

    log_audit_event(
        pool,
        if status == "success" {
            "job_run_succeeded"
        } else {
            "job_run_failed"
        },
        "job_run",
        &run_id.to_string(),
        actor.as_ref(),
        json!({
            "job_id": job.job_id,
            "job_type": job.job_type,
            "trigger": trigger,
            "error": error,
        }),
    )
    .await?;
    log_job_run_log(
        pool,
        run_id,
        if status == "success" { "INFO" } else { "ERROR" },
        "job_finished",
        json!({
            "job_id": job.job_id,
            "job_type": job.job_type,
            "trigger": trigger,
            "status": status,
            "error": error,
        }),
    )
    .await?;

    Ok(())
}

/// A schedule whose cron expression cannot be parsed is disabled in place,
/// leaving a failed synthetic run and an audit trail instead of wedging
/// every subsequent tick.
async fn disable_invalid_schedule(
    pool: &PgPool,
    schedule_id: Uuid,
    job_id: Uuid,
    cron_expr: &str,
    error_reason: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE job_schedules SET enabled = false, next_run_at = NULL WHERE schedule_id = $1",
    )
    .bind(schedule_id)
    .execute(&mut *tx)
    .await?;
    let run_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO job_runs (run_id, job_id, started_at, finished_at, status, error)
        VALUES (gen_random_uuid(), $1, now(), now(), 'failed', $2)
        RETURNING run_id
        "#,
    )
    .bind(job_id)
    .bind(error_reason)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    error!(
        %schedule_id,
        %job_id,
        cron_expr,
        error = error_reason,
        "schedule disabled: invalid cron expression"
    );
    log_job_run_log(
        pool,
        run_id,
        "ERROR",
        "schedule_invalid_cron_disabled",
        json!({
            "schedule_id": schedule_id,
            "job_id": job_id,
            "cron_expr": cron_expr,
            "error": error_reason,
        }),
    )
    .await?;
    log_audit_event(
        pool,
        "schedule_invalid_cron_disabled",
        "job_schedule",
        &schedule_id.to_string(),
        None,
        json!({
            "job_id": job_id,
            "cron_expr": cron_expr,
            "error": error_reason,
        }),
    )
    .await?;

    Ok(())
}

/// Startup sweep: runs left `running` by a dead worker are closed out as
/// failed, restoring the one-running-run-per-job invariant.
pub async fn recover_interrupted_runs(pool: &PgPool) -> Result<u64> {
    let recovered: Vec<(Uuid, Uuid)> = sqlx::query_as(
        r#"
        UPDATE job_runs
        SET finished_at = now(),
            status = 'failed',
            error = COALESCE(error, 'interrupted_worker_restart')
        WHERE status = 'running' AND finished_at IS NULL
        RETURNING run_id, job_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    for (run_id, job_id) in &recovered {
        warn!(%run_id, %job_id, "recovered interrupted job run");
        log_job_run_log(
            pool,
            *run_id,
            "WARN",
            "job_run_recovered_after_restart",
            json!({"job_id": job_id, "error": "interrupted_worker_restart"}),
        )
        .await?;
        log_audit_event(
            pool,
            "job_run_recovered_after_restart",
            "job_run",
            &run_id.to_string(),
            None,
            json!({"job_id": job_id, "error": "interrupted_worker_restart"}),
        )
        .await?;
    }

    Ok(recovered.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_run_advances_to_the_following_slot() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = compute_next_run("*/5 * * * *", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());

        let from_lease = compute_next_run("*/5 * * * *", next).unwrap();
        assert_eq!(from_lease, Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap());
    }

    #[test]
    fn next_run_is_strictly_in_the_future_of_base() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 30).unwrap();
        let next = compute_next_run("*/5 * * * *", base).unwrap();
        assert!(next > base);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn invalid_cron_error_is_tagged() {
        let err = compute_next_run("not a cron", Utc::now()).unwrap_err();
        assert!(err.to_string().starts_with("invalid_cron_expr:"));
    }

    #[test]
    fn hourly_cron_parses() {
        let base = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let next = compute_next_run("0 * * * *", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap());
    }
}
