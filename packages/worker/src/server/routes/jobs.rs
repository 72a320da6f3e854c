//! Admin job endpoints: status, run-now, pause, resume.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::FromRow;
use tracing::error;
use uuid::Uuid;

use crate::common::{log_audit_event, Actor};
use crate::kernel::scheduler::{run_job_once, JobRecord};
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
pub struct JobActionBody {
    pub job_id: Option<String>,
    #[serde(default)]
    pub actor: Option<Actor>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct JobStatusRow {
    pub job_id: Uuid,
    pub job_type: String,
    pub enabled: bool,
    pub config: Option<Value>,
    pub schedule_id: Option<Uuid>,
    pub cron_expr: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub schedule_enabled: Option<bool>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub error: Option<String>,
}

type ApiError = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, code: &str) -> ApiError {
    (status, Json(json!({"error": code})))
}

fn parse_job_id(body: &JobActionBody) -> Result<Uuid, ApiError> {
    let Some(raw) = body.job_id.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
        return Err(error_response(StatusCode::BAD_REQUEST, "job_id_required"));
    };
    Uuid::parse_str(raw).map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_job_id"))
}

/// One row per job, joined with its schedule and most recent run.
pub async fn jobs_status_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let rows: Vec<JobStatusRow> = sqlx::query_as(
        r#"
        SELECT j.job_id, j.job_type, j.enabled, j.config,
               js.schedule_id, js.cron_expr, js.next_run_at, js.enabled AS schedule_enabled,
               r.run_id, r.started_at, r.finished_at, r.status, r.error
        FROM jobs j
        LEFT JOIN job_schedules js ON js.job_id = j.job_id
        LEFT JOIN LATERAL (
            SELECT run_id, started_at, finished_at, status, error
            FROM job_runs
            WHERE job_id = j.job_id
            ORDER BY started_at DESC
            LIMIT 1
        ) r ON true
        ORDER BY j.job_type
        "#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(|err| {
        error!(error = %err, "jobs status query failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "status_query_failed")
    })?;

    Ok(Json(json!({"jobs": rows})))
}

/// Spawn an ad-hoc run of a job. Responds 202 once the run is handed off;
/// the advisory lock still guarantees a single run per job.
pub async fn run_now_handler(
    State(state): State<AppState>,
    Json(body): Json<JobActionBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job_id = parse_job_id(&body)?;

    let job: Option<JobRecord> =
        sqlx::query_as("SELECT job_id, job_type, config FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&state.pool)
            .await
            .map_err(|err| {
                error!(error = %err, "run-now job lookup failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "job_lookup_failed")
            })?;
    let Some(job) = job else {
        return Err(error_response(StatusCode::NOT_FOUND, "job_not_found"));
    };

    let actor = body.actor;
    log_audit_event(
        &state.pool,
        "job_run_requested",
        "job",
        &job_id.to_string(),
        actor.as_ref(),
        json!({"job_type": job.job_type}),
    )
    .await
    .map_err(|err| {
        error!(error = %err, "run-now audit write failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "audit_write_failed")
    })?;

    let pool = state.pool.clone();
    let config = state.config.clone();
    let client = state.client.clone();
    tokio::spawn(async move {
        if let Err(err) = run_job_once(&pool, &config, &client, job, actor).await {
            error!(%job_id, error = %err, "run-now job failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({"status": "queued"}))))
}

/// Pause: the scheduler stops leasing the job; run-now stays available as a
/// manual override.
pub async fn pause_handler(
    State(state): State<AppState>,
    Json(body): Json<JobActionBody>,
) -> Result<Json<Value>, ApiError> {
    let job_id = parse_job_id(&body)?;

    let update = async {
        sqlx::query("UPDATE jobs SET enabled = false WHERE job_id = $1")
            .bind(job_id)
            .execute(&state.pool)
            .await?;
        sqlx::query(
            "UPDATE job_schedules SET enabled = false, next_run_at = NULL WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&state.pool)
        .await
    };
    update.await.map_err(|err| {
        error!(%job_id, error = %err, "pause update failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "pause_failed")
    })?;

    log_audit_event(
        &state.pool,
        "job_paused",
        "job",
        &job_id.to_string(),
        body.actor.as_ref(),
        json!({}),
    )
    .await
    .map_err(|err| {
        error!(error = %err, "pause audit write failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "audit_write_failed")
    })?;

    Ok(Json(json!({"status": "paused"})))
}

/// Resume re-seeds: `next_run_at` is cleared so the next tick recomputes it
/// instead of reusing a stale time.
pub async fn resume_handler(
    State(state): State<AppState>,
    Json(body): Json<JobActionBody>,
) -> Result<Json<Value>, ApiError> {
    let job_id = parse_job_id(&body)?;

    let update = async {
        sqlx::query("UPDATE jobs SET enabled = true WHERE job_id = $1")
            .bind(job_id)
            .execute(&state.pool)
            .await?;
        sqlx::query(
            "UPDATE job_schedules SET enabled = true, next_run_at = NULL WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&state.pool)
        .await
    };
    update.await.map_err(|err| {
        error!(%job_id, error = %err, "resume update failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "resume_failed")
    })?;

    log_audit_event(
        &state.pool,
        "job_resumed",
        "job",
        &job_id.to_string(),
        body.actor.as_ref(),
        json!({}),
    )
    .await
    .map_err(|err| {
        error!(error = %err, "resume audit write failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "audit_write_failed")
    })?;

    Ok(Json(json!({"status": "resumed"})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_job_id_is_rejected() {
        let body = JobActionBody {
            job_id: None,
            actor: None,
        };
        let err = parse_job_id(&body).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let body = JobActionBody {
            job_id: Some("   ".to_string()),
            actor: None,
        };
        assert!(parse_job_id(&body).is_err());
    }

    #[test]
    fn malformed_job_id_is_rejected() {
        let body = JobActionBody {
            job_id: Some("not-a-uuid".to_string()),
            actor: None,
        };
        let err = parse_job_id(&body).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn valid_job_id_parses() {
        let id = Uuid::new_v4();
        let body = JobActionBody {
            job_id: Some(id.to_string()),
            actor: None,
        };
        assert_eq!(parse_job_id(&body).unwrap(), id);
    }
}
