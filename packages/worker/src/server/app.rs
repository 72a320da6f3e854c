//! Application setup and router construction.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::graph::GraphClient;
use crate::kernel::heartbeat::HeartbeatHandle;
use crate::kernel::scheduler::SchedulerHandle;
use crate::server::middleware::require_internal_token;
use crate::server::routes::{
    health_handler, jobs_status_handler, pause_handler, resume_handler, run_now_handler,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub client: Arc<GraphClient>,
    pub scheduler: SchedulerHandle,
    pub heartbeat: HeartbeatHandle,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs/status", get(jobs_status_handler))
        .route("/jobs/run-now", post(run_now_handler))
        .route("/jobs/pause", post(pause_handler))
        .route("/jobs/resume", post(resume_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
