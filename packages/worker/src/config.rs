use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_connect_timeout_seconds: u64,
    pub db_write_max_retries: u32,
    pub db_write_retry_base_ms: u64,
    pub db_write_retry_max_ms: u64,
    pub db_write_retry_jitter_ms: u64,

    pub graph_base: String,
    pub entra_tenant_id: String,
    pub entra_client_id: String,
    pub entra_client_secret: String,
    pub graph_max_retries: u32,
    pub graph_connect_timeout_seconds: u64,
    pub graph_read_timeout_seconds: u64,
    pub graph_max_concurrency: usize,
    pub graph_page_size: u32,
    pub graph_permissions_batch_size: i64,
    pub graph_permissions_stale_after_hours: i64,

    pub flush_every: usize,
    pub scheduler_poll_seconds: u64,
    pub recover_interrupted_runs_on_startup: bool,
    pub mv_refresh_max_views_per_run: i64,

    pub worker_port: u16,
    pub worker_internal_api_token: Option<String>,
    pub enable_background_tasks: bool,

    pub heartbeat_url: String,
    pub heartbeat_token: Option<String>,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub heartbeat_fail_threshold: u32,
}

const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_connect_timeout_seconds: parse_env("DB_CONNECT_TIMEOUT_SECONDS", 10)?,
            db_write_max_retries: parse_env("DB_WRITE_MAX_RETRIES", 6)?,
            db_write_retry_base_ms: parse_env("DB_WRITE_RETRY_BASE_MS", 200)?,
            db_write_retry_max_ms: parse_env("DB_WRITE_RETRY_MAX_MS", 3000)?,
            db_write_retry_jitter_ms: parse_env("DB_WRITE_RETRY_JITTER_MS", 150)?,

            graph_base: env::var("GRAPH_BASE")
                .unwrap_or_else(|_| DEFAULT_GRAPH_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            entra_tenant_id: env::var("ENTRA_TENANT_ID").context("ENTRA_TENANT_ID must be set")?,
            entra_client_id: env::var("ENTRA_CLIENT_ID").context("ENTRA_CLIENT_ID must be set")?,
            entra_client_secret: env::var("ENTRA_CLIENT_SECRET")
                .context("ENTRA_CLIENT_SECRET must be set")?,
            graph_max_retries: parse_env("GRAPH_MAX_RETRIES", 5)?,
            graph_connect_timeout_seconds: parse_env("GRAPH_CONNECT_TIMEOUT", 10)?,
            graph_read_timeout_seconds: parse_env("GRAPH_READ_TIMEOUT", 60)?,
            graph_max_concurrency: parse_env("GRAPH_MAX_CONCURRENCY", 4)?,
            graph_page_size: parse_env("GRAPH_PAGE_SIZE", 200)?,
            graph_permissions_batch_size: parse_env("GRAPH_PERMISSIONS_BATCH_SIZE", 50)?,
            graph_permissions_stale_after_hours: parse_env(
                "GRAPH_PERMISSIONS_STALE_AFTER_HOURS",
                24,
            )?,

            flush_every: parse_env("FLUSH_EVERY", 500)?,
            scheduler_poll_seconds: parse_env("SCHEDULER_POLL_SECONDS", 30)?,
            recover_interrupted_runs_on_startup: parse_env_bool(
                "RECOVER_INTERRUPTED_RUNS_ON_STARTUP",
                true,
            ),
            mv_refresh_max_views_per_run: parse_env("MV_REFRESH_MAX_VIEWS_PER_RUN", 20)?,

            worker_port: parse_env("WORKER_PORT", 5000)?,
            worker_internal_api_token: env::var("WORKER_INTERNAL_API_TOKEN")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            enable_background_tasks: parse_env_bool("WORKER_ENABLE_BACKGROUND_TASKS", true),

            heartbeat_url: env::var("WORKER_HEARTBEAT_URL")
                .unwrap_or_else(|_| "http://web:3000/api/internal/worker-heartbeat".to_string()),
            heartbeat_token: env::var("WORKER_HEARTBEAT_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            heartbeat_interval_seconds: parse_env("WORKER_HEARTBEAT_INTERVAL_SECONDS", 30)?,
            heartbeat_timeout_seconds: parse_env("WORKER_HEARTBEAT_TIMEOUT_SECONDS", 5)?,
            heartbeat_fail_threshold: parse_env("WORKER_HEARTBEAT_FAIL_THRESHOLD", 2)?,
        })
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_lowercase().as_str(),
            "1" | "true" | "t" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_bool_accepts_common_truthy_values() {
        env::set_var("TEST_BOOL_TRUTHY", "Yes");
        assert!(parse_env_bool("TEST_BOOL_TRUTHY", false));
        env::set_var("TEST_BOOL_TRUTHY", "0");
        assert!(!parse_env_bool("TEST_BOOL_TRUTHY", true));
        env::remove_var("TEST_BOOL_TRUTHY");
        assert!(parse_env_bool("TEST_BOOL_TRUTHY", true));
    }

    #[test]
    fn parse_env_falls_back_to_default() {
        env::remove_var("TEST_NUM_MISSING");
        let value: u64 = parse_env("TEST_NUM_MISSING", 42).unwrap();
        assert_eq!(value, 42);
    }
}
