use axum::{extract::State, Json};
use serde::Serialize;

use crate::kernel::heartbeat::HeartbeatStatus;
use crate::kernel::scheduler::SchedulerStatus;
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    ok: bool,
    db: bool,
    scheduler: SchedulerStatus,
    heartbeat: HeartbeatStatus,
}

/// Liveness plus component snapshots: DB reachability, scheduler loop
/// state, heartbeat state.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();

    Json(HealthResponse {
        ok: true,
        db: db_ok,
        scheduler: state.scheduler.snapshot(),
        heartbeat: state.heartbeat.status(),
    })
}
