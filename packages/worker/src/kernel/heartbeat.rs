//! Heartbeat worker: tells the web app this worker is alive, and tracks
//! whether the web app is reachable from here.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;

const HEARTBEAT_TOKEN_HEADER: &str = "X-Worker-Heartbeat-Token";
const LOG_ERROR_MAX_CHARS: usize = 220;

#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatState {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    #[serde(flatten)]
    pub state: HeartbeatState,
    pub webapp_reachable: bool,
    pub interval_seconds: u64,
    pub fail_threshold: u32,
}

#[derive(Clone)]
pub struct HeartbeatHandle {
    state: Arc<Mutex<HeartbeatState>>,
    interval_seconds: u64,
    fail_threshold: u32,
}

impl HeartbeatHandle {
    fn new(interval_seconds: u64, fail_threshold: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HeartbeatState::default())),
            interval_seconds,
            fail_threshold,
        }
    }

    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock().expect("heartbeat state poisoned");
        state.consecutive_failures < self.fail_threshold
    }

    pub fn status(&self) -> HeartbeatStatus {
        let state = self.state.lock().expect("heartbeat state poisoned").clone();
        HeartbeatStatus {
            webapp_reachable: state.consecutive_failures < self.fail_threshold,
            interval_seconds: self.interval_seconds,
            fail_threshold: self.fail_threshold,
            state,
        }
    }

    /// Fold one attempt into the state; returns the failure count before
    /// and after so the loop can log threshold crossings.
    fn record_attempt(
        &self,
        attempted_at: DateTime<Utc>,
        error: Option<String>,
    ) -> (u32, u32) {
        let mut state = self.state.lock().expect("heartbeat state poisoned");
        let previous = state.consecutive_failures;
        state.last_attempt_at = Some(attempted_at);
        match error {
            None => {
                state.last_success_at = Some(attempted_at);
                state.consecutive_failures = 0;
                state.last_error = None;
            }
            Some(error) => {
                state.consecutive_failures += 1;
                state.last_error = Some(error);
            }
        }
        (previous, state.consecutive_failures)
    }
}

/// Handle for a process running without a heartbeat loop; state stays at
/// its zero value and `webapp_reachable` stays true.
pub fn spawn_disabled(config: &Config) -> HeartbeatHandle {
    HeartbeatHandle::new(
        config.heartbeat_interval_seconds.max(1),
        config.heartbeat_fail_threshold,
    )
}

pub fn spawn_heartbeat(config: &Config) -> HeartbeatHandle {
    let handle = HeartbeatHandle::new(
        config.heartbeat_interval_seconds.max(1),
        config.heartbeat_fail_threshold,
    );
    let loop_handle = handle.clone();
    let url = config.heartbeat_url.clone();
    let token = config.heartbeat_token.clone();
    let timeout = Duration::from_secs(config.heartbeat_timeout_seconds);
    let interval = Duration::from_secs(handle.interval_seconds);
    let fail_threshold = handle.fail_threshold;

    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                error!(error = %err, "heartbeat client construction failed, heartbeat disabled");
                return;
            }
        };
        info!(url = url.as_str(), "heartbeat loop started");

        loop {
            let attempted_at = Utc::now();
            let mut request = client.post(&url).json(&json!({"sent_at": attempted_at}));
            if let Some(token) = token.as_deref() {
                request = request.header(HEARTBEAT_TOKEN_HEADER, token);
            }

            let error = match request.send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(_) => None,
                    Err(err) => Some(err.to_string()),
                },
                Err(err) => Some(err.to_string()),
            };

            let failed = error.is_some();
            let log_error = error
                .as_deref()
                .map(|e| flatten_error(e, LOG_ERROR_MAX_CHARS));
            let (previous, failures) = loop_handle.record_attempt(attempted_at, error);

            if failed {
                warn!(
                    url = url.as_str(),
                    failures,
                    error = log_error.as_deref().unwrap_or("heartbeat_failed"),
                    "heartbeat failed"
                );
                if previous < fail_threshold && fail_threshold <= failures {
                    error!(url = url.as_str(), failures, "heartbeat fail threshold reached");
                }
            }

            tokio::time::sleep(interval).await;
        }
    });

    handle
}

fn flatten_error(error: &str, max_chars: usize) -> String {
    let flat: String = error
        .replace(['\n', '\r'], " ")
        .trim()
        .to_string();
    if flat.chars().count() > max_chars {
        let truncated: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_until_threshold_and_recovers_on_first_success() {
        let handle = HeartbeatHandle::new(30, 2);
        assert!(handle.is_healthy());

        handle.record_attempt(Utc::now(), Some("boom".into()));
        assert!(handle.is_healthy());

        handle.record_attempt(Utc::now(), Some("boom".into()));
        assert!(!handle.is_healthy());
        assert!(!handle.status().webapp_reachable);

        handle.record_attempt(Utc::now(), None);
        assert!(handle.is_healthy());
        let status = handle.status();
        assert!(status.webapp_reachable);
        assert_eq!(status.state.consecutive_failures, 0);
        assert!(status.state.last_error.is_none());
    }

    #[test]
    fn record_attempt_reports_transition_counts() {
        let handle = HeartbeatHandle::new(30, 2);
        let (before, after) = handle.record_attempt(Utc::now(), Some("x".into()));
        assert_eq!((before, after), (0, 1));
        let (before, after) = handle.record_attempt(Utc::now(), Some("x".into()));
        assert_eq!((before, after), (1, 2));
    }

    #[test]
    fn flatten_error_strips_newlines_and_truncates() {
        assert_eq!(flatten_error("a\nb\rc", 220), "a b c");
        let long = "x".repeat(300);
        let flattened = flatten_error(&long, 220);
        assert_eq!(flattened.chars().count(), 220);
        assert!(flattened.ends_with("..."));
    }
}
