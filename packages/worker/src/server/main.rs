// Main entry point for the sync worker

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_core::kernel::{db, graph::GraphClient, heartbeat, scheduler};
use worker_core::server::{build_app, AppState};
use worker_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tenant graph sync worker");

    // Load configuration
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = db::connect(&config)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    let client = Arc::new(GraphClient::new(&config).context("Failed to build Graph client")?);

    if config.recover_interrupted_runs_on_startup {
        let recovered = scheduler::recover_interrupted_runs(&pool)
            .await
            .context("Interrupted-run recovery failed")?;
        if recovered > 0 {
            tracing::warn!(recovered, "closed out interrupted job runs from a previous worker");
        }
    }

    let (scheduler_handle, heartbeat_handle) = if config.enable_background_tasks {
        (
            scheduler::spawn_scheduler(pool.clone(), config.clone(), client.clone()),
            heartbeat::spawn_heartbeat(&config),
        )
    } else {
        tracing::warn!("background tasks disabled by configuration");
        (
            scheduler::SchedulerHandle::disabled(),
            heartbeat::spawn_disabled(&config),
        )
    };

    let state = AppState {
        pool,
        config: config.clone(),
        client,
        scheduler: scheduler_handle,
        heartbeat: heartbeat_handle,
    };
    let app = build_app(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.worker_port);
    tracing::info!("Starting admin server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
