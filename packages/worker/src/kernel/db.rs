//! Postgres store gateway: pool setup, advisory locks, and the
//! transient-write retry discipline shared by the ingest stages.
//!
//! Multi-row writes go through `sqlx::QueryBuilder` at the call site; this
//! module owns the page size, the SQLSTATE classifier and the backoff math
//! so every writer retries the same way.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::log_job_run_log;
use crate::config::Config;

/// Page size for multi-row INSERT ... VALUES statements.
pub const BULK_PAGE_SIZE: usize = 1000;

/// SQLSTATEs worth retrying: serialization failure, deadlock detected,
/// lock not available.
const RETRYABLE_SQLSTATES: [&str; 3] = ["40001", "40P01", "55P03"];

pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(config.db_connect_timeout_seconds))
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

/// Extract the SQLSTATE code from a sqlx error, if the server reported one.
pub fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.to_string())
}

pub fn is_retryable(err: &sqlx::Error) -> bool {
    match sqlstate(err) {
        Some(code) => RETRYABLE_SQLSTATES.contains(&code.as_str()),
        None => false,
    }
}

/// Retry knobs for transient write failures, with the same floors the
/// runtime has always enforced.
#[derive(Debug, Clone, Copy)]
pub struct WriteRetryPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl WriteRetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let base_ms = config.db_write_retry_base_ms.max(1);
        Self {
            max_retries: config.db_write_max_retries,
            base_ms,
            max_ms: config.db_write_retry_max_ms.max(base_ms),
            jitter_ms: config.db_write_retry_jitter_ms,
        }
    }
}

/// Backoff for the 1-based retry `attempt`:
/// `min(max_ms, base_ms * 2^(attempt - 1)) + U(0, jitter_ms)`.
pub fn compute_backoff(attempt: u32, policy: &WriteRetryPolicy) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let capped_ms = policy
        .base_ms
        .saturating_mul(1u64 << exp)
        .min(policy.max_ms);
    let jitter_ms = if policy.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(capped_ms + jitter_ms)
}

/// Outcome of a retried write: either committed, or retries exhausted with
/// the last transient failure attached. Non-retryable errors never land
/// here, they propagate.
#[derive(Debug)]
pub struct WriteRetryOutcome {
    pub committed: bool,
    pub retries: u32,
    pub sqlstate: Option<String>,
    pub error: Option<String>,
}

/// Run a transactional mutation, retrying on transient SQLSTATEs with
/// backoff. Each retry is recorded in `job_run_logs` under
/// `retry_log_message`.
pub async fn execute_with_write_retry<F, Fut>(
    pool: &PgPool,
    policy: &WriteRetryPolicy,
    run_id: Uuid,
    op_name: &str,
    retry_log_message: &str,
    mut mutation: F,
) -> Result<WriteRetryOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<()>>,
{
    let mut retries = 0u32;
    loop {
        match mutation().await {
            Ok(()) => {
                return Ok(WriteRetryOutcome {
                    committed: true,
                    retries,
                    sqlstate: None,
                    error: None,
                })
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err.into());
                }
                let state = sqlstate(&err);
                if retries >= policy.max_retries {
                    return Ok(WriteRetryOutcome {
                        committed: false,
                        retries,
                        sqlstate: state,
                        error: Some(err.to_string()),
                    });
                }
                retries += 1;
                let sleep = compute_backoff(retries, policy);
                warn!(
                    operation = op_name,
                    retry_attempt = retries,
                    max_retries = policy.max_retries,
                    sqlstate = state.as_deref().unwrap_or("unknown"),
                    sleep_ms = sleep.as_millis() as u64,
                    "transient db write failure, retrying"
                );
                log_job_run_log(
                    pool,
                    run_id,
                    "WARN",
                    retry_log_message,
                    json!({
                        "operation": op_name,
                        "retry_attempt": retries,
                        "max_retries": policy.max_retries,
                        "sqlstate": state,
                        "error": err.to_string(),
                        "sleep_ms": sleep.as_millis() as u64,
                    }),
                )
                .await?;
                tokio::time::sleep(sleep).await;
            }
        }
    }
}

/// Try to take the session-scoped advisory lock for `key`. The lock lives
/// on the connection it was taken on until unlocked or the session ends, so
/// callers must pin one connection for the whole critical section.
pub async fn try_advisory_lock(conn: &mut PgConnection, key: &str) -> Result<bool> {
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
        .bind(key)
        .fetch_one(conn)
        .await?;
    if locked {
        info!(key, "advisory lock acquired");
    } else {
        warn!(key, "advisory lock not acquired");
    }
    Ok(locked)
}

pub async fn advisory_unlock(conn: &mut PgConnection, key: &str) -> Result<bool> {
    let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
        .bind(key)
        .fetch_one(conn)
        .await?;
    if unlocked {
        info!(key, "advisory lock released");
    } else {
        warn!(key, "advisory lock release: not held");
    }
    Ok(unlocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, jitter_ms: u64) -> WriteRetryPolicy {
        WriteRetryPolicy {
            max_retries: 6,
            base_ms,
            max_ms,
            jitter_ms,
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let p = policy(200, 3000, 0);
        assert_eq!(compute_backoff(1, &p), Duration::from_millis(200));
        assert_eq!(compute_backoff(2, &p), Duration::from_millis(400));
        assert_eq!(compute_backoff(3, &p), Duration::from_millis(800));
        assert_eq!(compute_backoff(5, &p), Duration::from_millis(3000));
        assert_eq!(compute_backoff(30, &p), Duration::from_millis(3000));
    }

    #[test]
    fn backoff_jitter_stays_within_bound() {
        let p = policy(100, 1000, 50);
        for attempt in 1..8 {
            let sleep = compute_backoff(attempt, &p);
            let floor = 100u64.saturating_mul(1 << (attempt - 1)).min(1000);
            assert!(sleep >= Duration::from_millis(floor));
            assert!(sleep <= Duration::from_millis(floor + 50));
        }
    }

    #[test]
    fn backoff_survives_large_attempt_numbers() {
        let p = policy(200, 3000, 0);
        assert_eq!(compute_backoff(u32::MAX, &p), Duration::from_millis(3000));
    }

    #[test]
    fn retry_policy_clamps_floors() {
        let mut config_like = WriteRetryPolicy {
            max_retries: 0,
            base_ms: 0,
            max_ms: 0,
            jitter_ms: 0,
        };
        // mirror from_config clamps without a full Config
        config_like.base_ms = config_like.base_ms.max(1);
        config_like.max_ms = config_like.max_ms.max(config_like.base_ms);
        assert_eq!(config_like.base_ms, 1);
        assert_eq!(config_like.max_ms, 1);
    }
}
